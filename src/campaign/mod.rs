//! Campaigns: definitions, audience predicates, date windows and the registry.

pub mod catalog;
pub mod model;
pub mod predicate;
pub mod registry;
pub mod window;

pub use model::{CampaignDefinition, EmailFormat, SubjectQuery};
pub use predicate::{EvalContext, Predicate};
pub use registry::CampaignRegistry;
pub use window::{ActiveWindow, DateRule};
