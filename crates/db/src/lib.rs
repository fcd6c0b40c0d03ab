pub mod connection;
pub mod error;
pub mod migrations;
pub mod participant;
pub mod rollback;

mod sql;

pub use connection::{connect, connect_config, connect_with_settings, DbPool};
pub use error::RepositoryError;
pub use participant::{SqlTransactionParticipant, TransactionMarker};
pub use rollback::{AnalyticsMarker, AnalyticsMarkerExecutor, MarkerKind, SqlRollbackExecutor};
