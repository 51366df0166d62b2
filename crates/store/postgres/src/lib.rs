mod archive;
mod config;
mod connect;
mod ledger;
mod migrations;

pub use archive::PostgresArchiveStore;
pub use config::PostgresConfig;
pub use connect::{build_connect_options, connect_lazy};
pub use ledger::PostgresSessionLedger;
pub use migrations::run_migrations;
