//! Read-only analysis over caches and run records: per-exit classification
//! reports and per-variant aggregates. Table and plot generators consume these.

pub mod report;
pub mod variants;

pub use report::{classification_per_exit, ClassMetrics, ExitReport};
pub use variants::{aggregate_variants, VariantAggregate};
