//! Infrastructure layer module
//!
//! Backend adapters, local persistence, configuration, logging and the
//! server-push event encoder.

pub mod adapter_factory;
pub mod commerce;
pub mod config;
pub mod database_connection;
pub mod history_repository;
pub mod logging;
pub mod relational;
pub mod sse;
pub mod store_registry;

pub use adapter_factory::DefaultAdapterFactory;
pub use commerce::CommerceAdapter;
pub use config::{AppConfig, ConfigManager, LoggingConfig};
pub use database_connection::DatabaseConnection;
pub use history_repository::{SqliteExclusionStore, SqliteHistoryRecorder};
pub use relational::RelationalAdapter;
pub use sse::EventStreamEncoder;
pub use store_registry::StaticStoreRegistry;
