//! Approval gate: rules, scoring, verdict persistence, worker and read API

pub mod api;
pub mod engine;
pub mod rules;
pub mod store;
pub mod worker;

use crate::pipeline::db::StoreError;
use thiserror::Error;

pub use api::{ApprovalApi, ApprovalFact, ApprovalStats};
pub use engine::{RuleEngine, ScoreBands, Verdict, VerdictStatus};
pub use store::{VerdictCounts, VerdictStore};
pub use worker::{ApprovalWorker, RunSummary, WorkerStatus};

#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Token {0} is not tracked and has no windows")]
    UnknownToken(String),
}
