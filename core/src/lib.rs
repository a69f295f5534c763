//! Core types shared by the audit store, the scan modules and the engine.

pub mod cancel;
pub mod clock;
pub mod collab;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod ratelimiter;
pub mod retry;
pub mod score;
pub mod stage;
pub mod status;

pub use cancel::CancellationToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AuditConfig;
pub use error::{AuditError, ErrorKind};
pub use model::*;
pub use stage::Stage;
pub use status::{AuditEvent, AuditStatus};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Mint a new opaque, URL-safe identifier (time-ordered UUIDv7, hyphenless).
pub fn new_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }

    #[test]
    fn ids_are_url_safe_and_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
