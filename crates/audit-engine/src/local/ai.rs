use async_trait::async_trait;
use audit_core::collab::{AiAnalysis, AiAnalyzer, ChainHint};
use audit_core::config::AiConfig;
use audit_core::ratelimiter::RateLimiter;
use audit_core::{AuditError, Finding, Severity, SeverityCounts};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct HintTemplate {
    name: &'static str,
    types: &'static [&'static str],
    impact: &'static str,
}

const HINTS: &[HintTemplate] = &[
    HintTemplate {
        name: "insecure_session_transport",
        types: &["missing_hsts", "cookie_missing_httponly", "cookie_missing_samesite"],
        impact: "Session cookies can leak over downgraded or cross-site requests",
    },
    HintTemplate {
        name: "reconnaissance_surface",
        types: &["version_disclosure", "directory_listing", "source_map_exposed", "api_docs_exposed"],
        impact: "Disclosed internals shorten an attacker's discovery phase",
    },
    HintTemplate {
        name: "third_party_script_compromise",
        types: &["missing_sri", "csp_missing_script_src", "vulnerable_js_library"],
        impact: "A compromised script host can run code on every page",
    },
];

/// Offline analyzer: ranks remediation by severity and volume and proposes
/// chains from a fixed set of co-occurrence patterns.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicAnalyzer;

#[async_trait]
impl AiAnalyzer for HeuristicAnalyzer {
    async fn analyze(&self, findings: &[Finding]) -> Result<AiAnalysis, AuditError> {
        let mut counts = SeverityCounts::default();
        for f in findings {
            counts.add(f.severity, 1);
        }

        let mut ranked: Vec<(String, Severity, usize)> = Vec::new();
        for f in findings.iter().filter(|f| f.severity > Severity::Info) {
            match ranked.iter_mut().find(|(t, _, _)| *t == f.finding_type) {
                Some((_, sev, n)) => {
                    *sev = (*sev).max(f.severity);
                    *n += 1;
                }
                None => ranked.push((f.finding_type.clone(), f.severity, 1)),
            }
        }
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)).then(a.0.cmp(&b.0)));

        let present: HashSet<&str> = findings.iter().map(|f| f.finding_type.as_str()).collect();
        let attack_chain_hints = HINTS
            .iter()
            .filter(|h| h.types.iter().filter(|t| present.contains(**t)).count() >= 2)
            .map(|h| ChainHint {
                name: h.name.to_string(),
                finding_types: h.types.iter().map(|t| t.to_string()).collect(),
                impact: h.impact.to_string(),
            })
            .collect();

        let executive_summary = if counts.total() == counts.info {
            "No exploitable weaknesses were found; informational notes only.".to_string()
        } else {
            let top = ranked.iter().take(3).map(|(t, _, _)| t.replace('_', " ")).collect::<Vec<_>>().join(", ");
            format!(
                "{} critical, {} high and {} medium issues found. Start with: {top}.",
                counts.critical, counts.high, counts.medium
            )
        };

        Ok(AiAnalysis {
            executive_summary,
            remediation_priority: ranked.into_iter().map(|(t, _, _)| t).collect(),
            attack_chain_hints,
        })
    }
}

/// Token bucket in front of an analyzer: one token per call, waiting at
/// most the configured timeout for it.
pub struct RateLimitedAnalyzer {
    inner: Arc<dyn AiAnalyzer>,
    limiter: RateLimiter,
    wait: Duration,
}

impl RateLimitedAnalyzer {
    /// Must be called inside a tokio runtime.
    pub fn new(inner: Arc<dyn AiAnalyzer>, cfg: &AiConfig) -> Self {
        RateLimitedAnalyzer {
            inner,
            limiter: RateLimiter::new(cfg.requests_per_minute, cfg.burst),
            wait: Duration::from_secs(cfg.timeout_secs),
        }
    }
}

#[async_trait]
impl AiAnalyzer for RateLimitedAnalyzer {
    async fn analyze(&self, findings: &[Finding]) -> Result<AiAnalysis, AuditError> {
        if !self.limiter.acquire_within(self.wait).await {
            return Err(AuditError::RateLimited("ai provider token bucket empty".into()));
        }
        self.inner.analyze(findings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finding(ty: &str, sev: Severity) -> Finding {
        Finding {
            finding_id: audit_core::new_id(),
            audit_id: "a1".into(),
            detector_name: "t".into(),
            finding_type: ty.into(),
            severity: sev,
            confidence: 1.0,
            url: "https://example.com/".into(),
            evidence: json!({}),
            remediation: String::new(),
            cwe_id: None,
            owasp_category: None,
            dedupe_fingerprint: String::new(),
            detected_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn ranks_by_severity_then_volume() {
        let f = vec![
            finding("missing_hsts", Severity::Medium),
            finding("cookie_missing_httponly", Severity::Low),
            finding("cookie_missing_httponly", Severity::Low),
            finding("exposed_secret", Severity::Critical),
            finding("fetch_error", Severity::Info),
        ];
        let a = HeuristicAnalyzer.analyze(&f).await.unwrap();
        assert_eq!(a.remediation_priority, vec!["exposed_secret", "missing_hsts", "cookie_missing_httponly"]);
        assert_eq!(a.attack_chain_hints.len(), 1);
        assert_eq!(a.attack_chain_hints[0].name, "insecure_session_transport");
        assert!(a.executive_summary.contains("1 critical"));
    }

    #[tokio::test]
    async fn clean_snapshot() {
        let a = HeuristicAnalyzer.analyze(&[finding("fetch_error", Severity::Info)]).await.unwrap();
        assert!(a.remediation_priority.is_empty());
        assert!(a.attack_chain_hints.is_empty());
    }

    #[tokio::test]
    async fn bucket_limits_calls() {
        let cfg = AiConfig { requests_per_minute: 1, burst: 1, timeout_secs: 0 };
        let a = RateLimitedAnalyzer::new(Arc::new(HeuristicAnalyzer), &cfg);
        assert!(a.analyze(&[]).await.is_ok());
        let err = a.analyze(&[]).await.unwrap_err();
        assert_eq!(err.kind(), audit_core::ErrorKind::RateLimited);
    }
}
