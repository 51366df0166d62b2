pub mod api;
pub mod archive;
pub mod config;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod store_factory;
pub mod telemetry;
pub mod testing;
