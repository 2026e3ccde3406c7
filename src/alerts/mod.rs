//! System alerts derived from ingestion health and provider stats

pub mod evaluator;
pub mod store;
pub mod types;

pub use evaluator::{AlertEvaluator, AlertThresholds};
pub use store::{AlertChanges, AlertStore};
pub use types::{AlertCategory, AlertKey, AlertSignal, AlertStatus, Severity, SystemAlert};
