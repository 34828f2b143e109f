//! Campaign mailer: automated email eligibility and scheduling engine.

pub mod campaign;
pub mod config;
pub mod dispatch;
pub mod eligibility;
pub mod error;
pub mod mailer;
pub mod reconcile;
pub mod store;
pub mod subject;
pub mod template;
pub mod transport;
