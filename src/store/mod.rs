//! Persistence layer: libSQL-backed storage for subjects, campaigns, and the send log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{CampaignRow, MailStore, SendRecord, SendStatus};
