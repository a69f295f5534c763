use async_trait::async_trait;
use audit_core::collab::CertificateIssuer;
use audit_core::{AuditError, Clock};
use audit_store::Db;
use rand::Rng;
use std::sync::Arc;

const PREFIX_LEN: usize = 10;
const DIGITS: usize = 5;
const MAX_DRAWS: usize = 8;
// No 0/O or 1/I in the prefix; numbers get read aloud and retyped.
const PREFIX_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// 15 alphanumerics, the last five digits.
pub fn is_certificate_number(s: &str) -> bool {
    s.len() == PREFIX_LEN + DIGITS
        && s.chars().all(|c| c.is_ascii_alphanumeric())
        && s[PREFIX_LEN..].chars().all(|c| c.is_ascii_digit())
}

/// Older write paths stored UUIDs, hyphenated or as 32 hex digits.
pub fn is_legacy_certificate_id(s: &str) -> bool {
    let bare: String = s.chars().filter(|c| *c != '-').collect();
    let hyphenated_ok = !s.contains('-')
        || (s.len() == 36 && [8, 13, 18, 23].iter().all(|&i| s.as_bytes()[i] == b'-'));
    bare.len() == 32 && hyphenated_ok && bare.chars().all(|c| c.is_ascii_hexdigit())
}

fn draw() -> String {
    let mut rng = rand::thread_rng();
    let mut s = String::with_capacity(PREFIX_LEN + DIGITS);
    for _ in 0..PREFIX_LEN {
        s.push(PREFIX_ALPHABET[rng.gen_range(0..PREFIX_ALPHABET.len())] as char);
    }
    for _ in 0..DIGITS {
        s.push(char::from(b'0' + rng.gen_range(0..10u8)));
    }
    s
}

/// Issues numbers from the certificate registry table; a collision draws again.
pub struct StoreCertificateIssuer {
    db: Arc<Db>,
    clock: Arc<dyn Clock>,
}

impl StoreCertificateIssuer {
    pub fn new(db: Arc<Db>, clock: Arc<dyn Clock>) -> Self {
        StoreCertificateIssuer { db, clock }
    }
}

#[async_trait]
impl CertificateIssuer for StoreCertificateIssuer {
    async fn issue(&self, audit_id: &str) -> Result<String, AuditError> {
        if let Some(existing) = self.db.certificate_for_audit(audit_id)? {
            return Ok(existing);
        }
        for attempt in 1..=MAX_DRAWS {
            let number = draw();
            if self.db.register_certificate(&number, audit_id, self.clock.now_ms())? {
                tracing::info!(audit_id, certificate_number = %number, "certificate issued");
                return Ok(number);
            }
            tracing::debug!(audit_id, attempt, "certificate number collision");
        }
        Err(AuditError::Internal(format!("no free certificate number after {MAX_DRAWS} draws")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit_core::ManualClock;

    #[test]
    fn formats() {
        assert!(is_certificate_number("ABCDEFGHJK12345"));
        assert!(!is_certificate_number("ABCDEFGHJK1234A"));
        assert!(!is_certificate_number("ABCDEFGHJK1234"));
        assert!(is_legacy_certificate_id("0190a3c2-7b1e-7cde-9f00-1234567890ab"));
        assert!(is_legacy_certificate_id("0190a3c27b1e7cde9f001234567890ab"));
        assert!(!is_legacy_certificate_id("0190a3c2-7b1e-7cde-9f00-1234567890"));
        assert!(!is_legacy_certificate_id("zz90a3c27b1e7cde9f001234567890ab"));
    }

    #[test]
    fn drawn_numbers_are_well_formed() {
        for _ in 0..50 {
            assert!(is_certificate_number(&draw()));
        }
    }

    #[tokio::test]
    async fn one_number_per_audit() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let issuer = StoreCertificateIssuer::new(db, Arc::new(ManualClock::new(0)));
        let a = issuer.issue("a1").await.unwrap();
        assert_eq!(issuer.issue("a1").await.unwrap(), a);
        assert_ne!(issuer.issue("a2").await.unwrap(), a);
    }
}
