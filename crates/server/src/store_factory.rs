use std::sync::Arc;
#[cfg(feature = "postgres")]
use std::time::Duration;

use tether_store::SessionStore;
use tether_store_memory::{MemoryArchiveStore, MemorySessionLedger};
#[cfg(feature = "postgres")]
use tether_store_postgres::{PostgresArchiveStore, PostgresConfig, PostgresSessionLedger};

use crate::config::StoreConfig;
use crate::error::ServerError;

#[cfg(feature = "postgres")]
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// A session store together with the connection it runs on.
pub struct StoreBackend {
    pub store: Arc<SessionStore>,
    #[cfg(feature = "postgres")]
    pool: Option<sqlx::PgPool>,
}

impl StoreBackend {
    /// In-process backend. Nothing survives a restart.
    pub fn memory(chunk_size: usize) -> Self {
        let store = SessionStore::new(
            Arc::new(MemoryArchiveStore::with_chunk_size(chunk_size)),
            Arc::new(MemorySessionLedger::new()),
        );
        Self {
            store: Arc::new(store),
            #[cfg(feature = "postgres")]
            pool: None,
        }
    }

    /// Whether the backing database answers. Always `true` in memory.
    #[allow(clippy::unused_async)]
    pub async fn is_connected(&self) -> bool {
        #[cfg(feature = "postgres")]
        if let Some(pool) = &self.pool {
            let ping = sqlx::query("SELECT 1").execute(pool);
            return matches!(tokio::time::timeout(PING_TIMEOUT, ping).await, Ok(Ok(_)));
        }
        true
    }

    /// Create the backend's tables. A no-op in memory.
    #[allow(clippy::unused_async)]
    pub async fn run_migrations(&self, config: &StoreConfig) -> Result<(), ServerError> {
        #[cfg(feature = "postgres")]
        if let Some(pool) = &self.pool {
            tether_store_postgres::run_migrations(pool, &postgres_config(config)?)
                .await
                .map_err(|e| ServerError::Store(format!("migrations: {e}")))?;
            return Ok(());
        }
        let _ = config;
        Ok(())
    }

    /// Close pooled connections.
    #[allow(clippy::unused_async)]
    pub async fn close(&self) {
        #[cfg(feature = "postgres")]
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}

/// Create the session store backend named by `config.backend`.
///
/// The Postgres pool is lazy: an unreachable database does not fail startup.
pub fn create_store(config: &StoreConfig) -> Result<StoreBackend, ServerError> {
    match config.backend.as_str() {
        "memory" => Ok(StoreBackend::memory(config.chunk_size_bytes)),
        #[cfg(feature = "postgres")]
        "postgres" => {
            let pg_config = postgres_config(config)?;
            let pool = tether_store_postgres::connect_lazy(&pg_config)
                .map_err(|e| ServerError::Config(format!("store postgres: {e}")))?;

            let archives = PostgresArchiveStore::new(pool.clone(), pg_config.clone());
            let ledger = PostgresSessionLedger::new(pool.clone(), pg_config);
            Ok(StoreBackend {
                store: Arc::new(SessionStore::new(Arc::new(archives), Arc::new(ledger))),
                pool: Some(pool),
            })
        }
        other => Err(ServerError::Config(format!(
            "unknown store backend: {other} (is the feature enabled?)"
        ))),
    }
}

#[cfg(feature = "postgres")]
fn postgres_config(config: &StoreConfig) -> Result<PostgresConfig, ServerError> {
    let url = config.resolved_url().ok_or_else(|| {
        ServerError::Config(
            "store postgres backend requires [store] url or DATABASE_URL".into(),
        )
    })?;
    Ok(PostgresConfig {
        url,
        pool_size: config.pool_size,
        schema: config.schema.clone(),
        table_prefix: config.table_prefix.clone(),
        bucket: config.bucket.clone(),
        chunk_size: config.chunk_size_bytes,
        ssl_mode: config.ssl_mode.clone(),
        ssl_root_cert: config.ssl_root_cert.clone(),
        ssl_cert: config.ssl_cert.clone(),
        ssl_key: config.ssl_key.clone(),
    })
}
