//! Exit-score provider: the model boundary, the logit cache, and softmax.

pub mod cache;
pub mod prob;

pub use cache::{FeatureInput, LogitCache, LogitEntry, MultiExitModel};
pub use prob::{log_prob, softmax_with_temperature, top_class};
