//! Immutable engine configuration, assembled once at startup.

use serde::Deserialize;
use std::time::Duration;

use crate::model::ScanDepth;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub database: DatabaseConfig,
    pub limits: LimitsConfig,
    pub crawler: CrawlerConfig,
    pub worker: WorkerConfig,
    pub policy: PolicyConfig,
    pub events: EventsConfig,
    pub report: ReportConfig,
    pub ai: AiConfig,
    pub scan_region: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            database: DatabaseConfig::default(),
            limits: LimitsConfig::default(),
            crawler: CrawlerConfig::default(),
            worker: WorkerConfig::default(),
            policy: PolicyConfig::default(),
            events: EventsConfig::default(),
            report: ReportConfig::default(),
            ai: AiConfig::default(),
            scan_region: "us-east-1".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig { path: "audits.sqlite".into() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Per-audit wall clock from `created_at`.
    pub audit_wall_clock_secs: u64,
    pub max_inflight_per_user: u32,
    /// Budget for non-high detectors, measured from `running`.
    pub detector_deadline_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig { audit_wall_clock_secs: 3600, max_inflight_per_user: 3, detector_deadline_secs: 1800 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub per_host_concurrency: usize,
    pub global_workers: usize,
    pub fetch_timeout_secs: u64,
    pub max_content_bytes: usize,
    pub max_pages_quick: usize,
    pub max_pages_standard: usize,
    pub max_pages_deep: usize,
    pub max_redirects: usize,
    pub host_lease_ttl_secs: u64,
    pub user_agent: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        CrawlerConfig {
            per_host_concurrency: 8,
            global_workers: 100,
            fetch_timeout_secs: 15,
            max_content_bytes: 2 * 1024 * 1024,
            max_pages_quick: 50,
            max_pages_standard: 500,
            max_pages_deep: 10_000,
            max_redirects: 5,
            host_lease_ttl_secs: 300,
            user_agent: format!("site-audit/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl CrawlerConfig {
    pub fn max_pages(&self, depth: ScanDepth) -> usize {
        match depth {
            ScanDepth::Quick => self.max_pages_quick,
            ScanDepth::Standard => self.max_pages_standard,
            ScanDepth::Deep => self.max_pages_deep,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub workers: usize,
    pub lease_secs: u64,
    pub poll_interval_ms: u64,
    pub default_max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            workers: 4,
            lease_secs: 900,
            poll_interval_ms: 250,
            default_max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub extra_blocked_hostnames: Vec<String>,
    pub extra_blocked_tlds: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub processed_event_ttl_days: u32,
}

impl Default for EventsConfig {
    fn default() -> Self {
        EventsConfig { processed_event_ttl_days: 14 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub public_base_url: String,
    pub signing_secret: String,
    pub presign_ttl_secs: u64,
    pub output_dir: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            public_base_url: "https://reports.localhost".into(),
            signing_secret: String::new(),
            presign_ttl_secs: 24 * 3600,
            output_dir: "reports".into(),
        }
    }
}

impl ReportConfig {
    /// Presigned links never outlive 24 h.
    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs.min(24 * 3600))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        AiConfig { requests_per_minute: 30, burst: 5, timeout_secs: 20 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let c = AuditConfig::default();
        assert_eq!(c.limits.audit_wall_clock_secs, 3600);
        assert_eq!(c.crawler.per_host_concurrency, 8);
        assert_eq!(c.crawler.global_workers, 100);
        assert_eq!(c.crawler.max_pages(ScanDepth::Standard), 500);
        assert_eq!(c.events.processed_event_ttl_days, 14);
    }

    #[test]
    fn presign_ttl_is_capped() {
        let r = ReportConfig { presign_ttl_secs: 7 * 24 * 3600, ..ReportConfig::default() };
        assert_eq!(r.presign_ttl(), Duration::from_secs(86_400));
    }
}
