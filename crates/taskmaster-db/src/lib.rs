pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use pool::{create_pool, ensure_database_exists, run_migrations};
