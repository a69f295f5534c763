//! In-process implementations of the external collaborators, backed by the
//! audit database and the local filesystem.

mod ai;
mod certs;
mod credits;
mod notify;
mod pdf;

pub use ai::{HeuristicAnalyzer, RateLimitedAnalyzer};
pub use certs::{is_certificate_number, is_legacy_certificate_id, StoreCertificateIssuer};
pub use credits::LedgerCredits;
pub use notify::LogNotifier;
pub use pdf::{minimal_pdf, LocalPdfRenderer};
