//! Audit engine: submission, the detector worker pool, correlation and
//! scoring, report finalization and the caller-facing actions.
//!
//! All coordination goes through the audit store. Workers share nothing but
//! a cache of parsed crawl pages; an `Engine` is cheap to clone and every
//! clone sees the same database.

mod actions;
mod correlate;
mod crawl_task;
mod engine;
mod finalize;
pub mod local;
mod orchestrator;
mod pages;
mod presign;
mod progress;
mod sweeper;
mod worker;

pub use actions::{
    AuditItemView, AuditStatusView, AuditSummary, CancelResponse, CertificateVerification, DownloadResponse, DownloadTarget,
    PoisonView, SubmitRequest, SubmitResponse,
};
pub use correlate::{correlate, exploitability, Rule, RuleSet};
pub use engine::{Engine, EngineBuilder};
pub use finalize::ssl_grade;
pub use presign::{PresignError, PresignedUrl, Presigner};
pub use progress::ProgressTracker;
pub use sweeper::SweepReport;
