//! Policy evaluation: the per-input cascade, batch evaluators and summaries.

pub mod evaluator;
pub mod parallel;
pub mod state;
pub mod summary;

pub use evaluator::{evaluate_policy, Decision, EvaluationVariant, PolicyEvaluator};
pub use parallel::{default_workers, evaluate_parallel};
pub use state::{Acceptance, ExitCascade, ExitScore, PolicyState};
pub use summary::PolicySummary;
