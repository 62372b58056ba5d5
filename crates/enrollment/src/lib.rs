//! Campaign enrollment: enrolls accounts into multi-step customer-success
//! campaigns and advances each enrollment through its email, task, wait,
//! and condition steps on a periodic sweep.

pub mod demo;
pub mod directory;
pub mod dispatch;
pub mod evaluator;
pub mod lifecycle;
pub mod manager;
pub mod scheduler;
pub mod state_machine;
pub mod steps;
pub mod store;
pub mod types;

pub use directory::{AccountDirectory, StaticAccountDirectory};
pub use dispatch::{EmailDispatcher, OutboxDispatcher, TaskDispatcher};
pub use evaluator::{ConditionEvaluator, RuleEvaluator};
pub use lifecycle::CampaignLifecycle;
pub use manager::EnrollmentManager;
pub use scheduler::{AdvanceOutcome, StepScheduler, SweepReport};
pub use steps::StepTemplates;
pub use store::{CampaignStore, InMemoryStore};
pub use types::*;
