//! SQLite persistence for audits, findings, events, checkpoints, the
//! detector task queue and the ledgers around them.

mod audits;
mod chains;
mod checkpoints;
mod codec;
mod crawl;
mod credits;
mod error;
mod events;
mod findings;
mod models;
mod open;
mod reports;
mod schema;
mod tasks;

pub use error::StoreError;
pub use findings::FindingCursor;
pub use models::*;
pub use open::Db;
