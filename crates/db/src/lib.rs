pub mod connection;
pub mod migrations;
pub mod sql_store;

pub use connection::{connect, connect_from_config, connect_with_settings, DbPool};
pub use sql_store::SqlSharedStore;
