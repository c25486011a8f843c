pub mod config;
pub mod database;
pub mod queue_repository;
pub mod record_repository;

pub use config::{DatabaseConfig, QueueConfig};
pub use database::Database;
pub use queue_repository::{PgDelivery, PgMessageQueue};
pub use record_repository::PgRecordStore;
