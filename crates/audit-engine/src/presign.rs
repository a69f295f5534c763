//! Time-limited report links: HMAC-SHA256 over the URL with its `expires`
//! parameter, appended as `signature`.

use audit_core::config::ReportConfig;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const MAX_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Error)]
pub enum PresignError {
    #[error("invalid report url: {0}")]
    Url(#[from] url::ParseError),
    #[error("signing key rejected")]
    Key,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at_ms: i64,
}

#[derive(Clone)]
pub struct Presigner {
    secret: Arc<Vec<u8>>,
    ttl: Duration,
}

impl Presigner {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Presigner { secret: Arc::new(secret.to_vec()), ttl: ttl.min(MAX_TTL) }
    }

    /// An empty configured secret gets a random per-process key, so links
    /// stop verifying after a restart.
    pub fn from_config(cfg: &ReportConfig) -> Self {
        if cfg.signing_secret.is_empty() {
            tracing::warn!("report.signing_secret is empty; using an ephemeral signing key");
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            return Presigner::new(&key, cfg.presign_ttl());
        }
        Presigner::new(cfg.signing_secret.as_bytes(), cfg.presign_ttl())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn mac(&self, message: &str) -> Result<HmacSha256, PresignError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| PresignError::Key)?;
        mac.update(message.as_bytes());
        Ok(mac)
    }

    pub fn sign(&self, raw: &str, now_ms: i64) -> Result<PresignedUrl, PresignError> {
        let mut url = Url::parse(raw)?;
        let expires_at_ms = now_ms + self.ttl.as_millis() as i64;
        url.query_pairs_mut().append_pair("expires", &(expires_at_ms / 1000).to_string());
        let signature = hex::encode(self.mac(url.as_str())?.finalize().into_bytes());
        url.query_pairs_mut().append_pair("signature", &signature);
        Ok(PresignedUrl { url: url.to_string(), expires_at_ms })
    }

    /// Signature matches and the link has not expired.
    pub fn verify(&self, raw: &str, now_ms: i64) -> bool {
        let Ok(url) = Url::parse(raw) else { return false };
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let Some(signature) = pairs.iter().find(|(k, _)| k == "signature").map(|(_, v)| v.clone()) else {
            return false;
        };
        let Some(expires) = pairs.iter().find(|(k, _)| k == "expires").and_then(|(_, v)| v.parse::<i64>().ok()) else {
            return false;
        };
        if expires * 1000 < now_ms {
            return false;
        }
        let mut unsigned = url.clone();
        unsigned.set_query(None);
        {
            let mut q = unsigned.query_pairs_mut();
            for (k, v) in pairs.iter().filter(|(k, _)| k != "signature") {
                q.append_pair(k, v);
            }
        }
        let Ok(sig) = hex::decode(signature) else { return false };
        match self.mac(unsigned.as_str()) {
            Ok(mac) => mac.verify_slice(&sig).is_ok(),
            Err(_) => false,
        }
    }
}
