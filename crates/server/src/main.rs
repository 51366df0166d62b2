use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use tether_server::api::AppState;
use tether_server::config::TetherConfig;
use tether_server::driver::ProcessDriver;
use tether_server::lifecycle::{ManagerSettings, SessionManager};
use tether_server::store_factory::{self, StoreBackend};

/// Tether session server.
#[derive(Parser, Debug)]
#[command(name = "tether-server", about = "Messaging session server with durable session storage")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "tether.toml")]
    config: String,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the store tables, then exit.
    Migrate,
    /// Print stored sessions, archives and orphans.
    Inspect,
    /// Delete every stored session and archive.
    Purge {
        /// Required to actually delete anything.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration from TOML file, or use defaults if the file does not exist.
    let config_exists = Path::new(&cli.config).exists();
    let config: TetherConfig = if config_exists {
        let contents = std::fs::read_to_string(&cli.config)?;
        toml::from_str(&contents)?
    } else {
        toml::from_str("")?
    };
    config.validate()?;

    if let Some(command) = cli.command {
        tether_server::telemetry::init_plain(&config.telemetry);
        return run_command(command, &config).await;
    }

    let telemetry_guard = tether_server::telemetry::init(&config.telemetry);
    if !config_exists {
        info!(path = %cli.config, "config file not found, using defaults");
    }

    let backend = Arc::new(store_factory::create_store(&config.store)?);
    if let Err(e) = backend.run_migrations(&config.store).await {
        warn!(error = %e, "store migrations failed, persistence may be unavailable");
    }

    let driver = Arc::new(ProcessDriver::new(&config.client));
    let manager = SessionManager::new(
        ManagerSettings::from_config(&config.session),
        Arc::clone(&backend.store),
        driver,
    );

    if config.session.auto_init {
        spawn_auto_init(
            Arc::clone(&manager),
            Duration::from_secs(config.session.auto_init_delay_seconds),
        );
    }

    let state = AppState {
        manager: Arc::clone(&manager),
        backend: Arc::clone(&backend),
        ui_path: Some(config.ui.dist_path.clone()),
        ui_enabled: config.ui.enabled,
    };
    let app = tether_server::api::router(state);

    let host = cli.host.unwrap_or(config.server.host.clone());
    let port = cli.port.unwrap_or(config.server.port);
    let addr = format!("{host}:{port}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, session_id = %manager.session_id(), "tether-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_seconds);
    info!(
        timeout_secs = config.server.shutdown_timeout_seconds,
        "saving session and stopping client..."
    );
    if tokio::time::timeout(shutdown_timeout, manager.shutdown())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = config.server.shutdown_timeout_seconds,
            "shutdown timeout exceeded, the last session changes may be lost"
        );
    }
    backend.close().await;

    telemetry_guard.shutdown();

    info!("tether-server shut down");
    Ok(())
}

/// Resume a stored session once the server is up.
fn spawn_auto_init(manager: Arc<SessionManager>, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if !manager.has_stored_session().await {
            info!(session_id = %manager.session_id(), "no stored session, waiting for /api/init");
            return;
        }
        info!(session_id = %manager.session_id(), "stored session found, starting client");
        if let Err(e) = manager.initialize().await {
            warn!(session_id = %manager.session_id(), error = %e, "automatic start failed");
        }
    });
}

async fn run_command(command: Commands, config: &TetherConfig) -> Result<(), Box<dyn std::error::Error>> {
    let backend = store_factory::create_store(&config.store)?;
    let result = match command {
        Commands::Migrate => run_migrate(&backend, config).await,
        Commands::Inspect => run_inspect(&backend).await,
        Commands::Purge { yes } => run_purge(&backend, yes).await,
    };
    backend.close().await;
    result
}

async fn run_migrate(backend: &StoreBackend, config: &TetherConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(backend = %config.store.backend, "running store migrations...");
    backend.run_migrations(&config.store).await?;
    info!(backend = %config.store.backend, "store migrations complete");
    Ok(())
}

async fn run_inspect(backend: &StoreBackend) -> Result<(), Box<dyn std::error::Error>> {
    let inventory = backend.store.inventory().await?;

    println!("sessions: {}", inventory.records.len());
    for record in &inventory.records {
        println!(
            "  {}  archive={}  size={}  created={}  updated={}",
            record.id, record.archive_ref, record.size_bytes, record.created_at, record.updated_at
        );
    }
    println!("archives: {}", inventory.archives.len());
    for header in &inventory.archives {
        println!(
            "  {}  {}  size={}  chunks={}  uploaded={}",
            header.id,
            header.filename,
            header.length,
            header.chunk_count(),
            header.uploaded_at
        );
    }
    if !inventory.orphans.is_empty() {
        println!("orphaned archives: {}", inventory.orphans.len());
        for header in &inventory.orphans {
            println!("  {}  {}", header.id, header.filename);
        }
    }
    if !inventory.dangling.is_empty() {
        println!("records without archive: {}", inventory.dangling.len());
        for id in &inventory.dangling {
            println!("  {id}");
        }
    }
    if !inventory.stray_chunks.is_empty() {
        println!("chunks without header: {}", inventory.stray_chunks.len());
        for stray in &inventory.stray_chunks {
            println!("  {}  chunks={}  size={}", stray.files_id, stray.chunks, stray.bytes);
        }
    }
    println!("total bytes: {}", inventory.total_bytes);
    Ok(())
}

async fn run_purge(backend: &StoreBackend, confirmed: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !confirmed {
        return Err("refusing to purge without --yes".into());
    }
    let removed = backend.store.purge().await?;
    info!(removed, "all stored sessions deleted");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received SIGINT"); }
        () = terminate => { info!("received SIGTERM"); }
    }
}
