//! Transport security: the TLS endpoint and the plain-HTTP entry point.

use async_trait::async_trait;
use audit_core::{NewFinding, Priority, RuntimeClass, Severity, Stage};
use crawler::FetchRequest;
use serde_json::json;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::probes::CertSummary;
use crate::{AuditCtx, Detector, DetectorError, DetectorSpec};

pub(crate) fn detectors() -> Vec<Arc<dyn Detector>> {
    vec![Arc::new(SslTls), Arc::new(HttpRedirect)]
}

const DAY_MS: i64 = 86_400_000;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

fn name_matches(host: &str, pattern: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => host.split_once('.').map(|(_, rest)| rest == suffix).unwrap_or(false),
        None => host == pattern,
    }
}

fn cert_names(cert: &CertSummary) -> Vec<String> {
    if cert.dns_names.is_empty() {
        cert.subject_cn.iter().cloned().collect()
    } else {
        cert.dns_names.clone()
    }
}

pub struct SslTls;

#[async_trait]
impl Detector for SslTls {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("ssl_tls", Stage::SslAnalysis, Priority::High).weight(3).runtime(RuntimeClass::Moderate).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let url = ctx.target.as_str();
        if !ctx.is_https() {
            return Ok(vec![NewFinding::new(name, "https_not_used", Severity::High, url)
                .evidence(json!({"scheme": ctx.target.scheme()}))
                .remediation("Serve the site over HTTPS and redirect all plain HTTP requests.")
                .cwe("CWE-319")
                .owasp("A02:2021")]);
        }
        ctx.ensure_active()?;
        let port = ctx.target.port_or_known_default().unwrap_or(443);
        let report = ctx.tls.inspect(ctx.host(), port).await?;
        let mut out = Vec::new();

        if let Some(err) = &report.handshake_error {
            out.push(
                NewFinding::new(name, "tls_handshake_failed", Severity::High, url)
                    .evidence(json!({"port": port}))
                    .remediation("Fix the TLS listener so that modern clients can complete a handshake.")
                    .cwe("CWE-295")
                    .owasp("A02:2021"),
            );
            tracing::debug!(audit_id = %ctx.audit_id, error = %err, "tls handshake failed");
            return Ok(out);
        }

        let now = now_ms();
        if let Some(cert) = &report.certificate {
            let expired = cert.not_after_ms <= now;
            if expired {
                out.push(
                    NewFinding::new(name, "certificate_expired", Severity::Critical, url)
                        .evidence(json!({"not_after_ms": cert.not_after_ms}))
                        .remediation("Renew the certificate and automate renewal.")
                        .cwe("CWE-298")
                        .owasp("A02:2021"),
                );
            } else if cert.not_after_ms - now < 30 * DAY_MS {
                let sev = if cert.not_after_ms - now < 14 * DAY_MS { Severity::High } else { Severity::Medium };
                out.push(
                    NewFinding::new(name, "certificate_expiring_soon", sev, url)
                        .evidence(json!({"not_after_ms": cert.not_after_ms}))
                        .remediation("Renew the certificate before it expires and automate renewal.")
                        .cwe("CWE-298"),
                );
            }
            if cert.self_signed {
                out.push(
                    NewFinding::new(name, "self_signed_certificate", Severity::High, url)
                        .evidence(json!({"issuer": cert.issuer_cn}))
                        .remediation("Use a certificate issued by a publicly trusted CA.")
                        .cwe("CWE-295")
                        .owasp("A02:2021"),
                );
            }
            let names = cert_names(cert);
            if !names.iter().any(|n| name_matches(ctx.host(), n)) {
                out.push(
                    NewFinding::new(name, "certificate_name_mismatch", Severity::High, url)
                        .evidence(json!({"host": ctx.host(), "names": names}))
                        .remediation("Issue a certificate that covers this hostname.")
                        .cwe("CWE-297")
                        .owasp("A02:2021"),
                );
            }
            if report.verify_error.is_some() && !expired && !cert.self_signed && out.iter().all(|f| f.finding_type != "certificate_name_mismatch") {
                out.push(
                    NewFinding::new(name, "untrusted_certificate_chain", Severity::High, url)
                        .evidence(json!({"issuer": cert.issuer_cn}))
                        .remediation("Serve the full intermediate chain up to a publicly trusted root.")
                        .cwe("CWE-295")
                        .owasp("A02:2021"),
                );
            }
        } else if report.verify_error.is_some() {
            out.push(
                NewFinding::new(name, "untrusted_certificate_chain", Severity::High, url)
                    .remediation("Serve a valid certificate chain.")
                    .cwe("CWE-295"),
            );
        }

        if report.protocol.as_deref() == Some("TLSv1_2") {
            out.push(
                NewFinding::new(name, "tls13_not_supported", Severity::Low, url)
                    .evidence(json!({"protocol": "TLSv1.2"}))
                    .remediation("Enable TLS 1.3.")
                    .cwe("CWE-326"),
            );
        }
        Ok(out)
    }
}

/// Does plain HTTP send visitors to HTTPS?
pub struct HttpRedirect;

#[async_trait]
impl Detector for HttpRedirect {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("http_redirect", Stage::SslAnalysis, Priority::Normal).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        if !ctx.is_https() {
            return Ok(Vec::new());
        }
        let mut plain = ctx.target.clone();
        if plain.set_scheme("http").is_err() || plain.set_port(None).is_err() {
            return Ok(Vec::new());
        }
        plain.set_path("/");
        plain.set_query(None);
        let Some(resp) = ctx.probe(FetchRequest::get(plain.clone()).no_redirects()).await? else {
            return Ok(Vec::new());
        };
        let name = self.spec().name;
        let url = plain.as_str();
        if (300..400).contains(&resp.status) {
            let location = resp.header("location").and_then(|l| plain.join(l).ok());
            return Ok(match location {
                Some(l) if l.scheme() == "https" => Vec::new(),
                other => vec![NewFinding::new(name, "http_redirect_not_https", Severity::Medium, url)
                    .evidence(json!({"location": other.map(|u| u.to_string())}))
                    .remediation("Redirect plain HTTP straight to the HTTPS origin.")
                    .cwe("CWE-319")
                    .owasp("A02:2021")],
            });
        }
        if (200..300).contains(&resp.status) {
            return Ok(vec![NewFinding::new(name, "http_served_without_redirect", Severity::Medium, url)
                .evidence(json!({"status": resp.status}))
                .remediation("Answer plain HTTP with a 301 to HTTPS and enable HSTS.")
                .cwe("CWE-319")
                .owasp("A02:2021")]);
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{ctx, ctx_with, types};
    use crate::probes::{StaticDns, StaticTls, TlsReport};
    use crawler::ScriptedFetcher;

    fn cert(days_left: i64, names: &[&str], self_signed: bool) -> CertSummary {
        CertSummary {
            subject_cn: names.first().map(|s| s.to_string()),
            issuer_cn: Some("R3".into()),
            not_before_ms: now_ms() - 30 * DAY_MS,
            not_after_ms: now_ms() + days_left * DAY_MS,
            dns_names: names.iter().map(|s| s.to_string()).collect(),
            self_signed,
        }
    }

    async fn run_tls(report: TlsReport) -> Vec<NewFinding> {
        let c = ctx_with("https://www.example.com/", ScriptedFetcher::new(), Vec::new(), StaticDns::new(), StaticTls::new(report));
        SslTls.run(&c, &json!({})).await.unwrap()
    }

    #[tokio::test]
    async fn healthy_tls13_is_clean() {
        let f = run_tls(TlsReport {
            protocol: Some("TLSv1_3".into()),
            certificate: Some(cert(80, &["*.example.com", "example.com"], false)),
            ..TlsReport::default()
        })
        .await;
        assert!(f.is_empty(), "{f:?}");
    }

    #[tokio::test]
    async fn expiring_mismatched_tls12() {
        let f = run_tls(TlsReport {
            protocol: Some("TLSv1_2".into()),
            certificate: Some(cert(5, &["other.org"], false)),
            verify_error: Some("invalid peer certificate: NotValidForName".into()),
            ..TlsReport::default()
        })
        .await;
        assert_eq!(types(&f), ["certificate_expiring_soon", "certificate_name_mismatch", "tls13_not_supported"]);
        assert_eq!(f.iter().find(|x| x.finding_type == "certificate_expiring_soon").unwrap().severity, Severity::High);
    }

    #[tokio::test]
    async fn self_signed_and_expired() {
        let f = run_tls(TlsReport {
            protocol: Some("TLSv1_3".into()),
            certificate: Some(cert(-1, &["www.example.com"], true)),
            verify_error: Some("UnknownIssuer".into()),
            ..TlsReport::default()
        })
        .await;
        assert_eq!(types(&f), ["certificate_expired", "self_signed_certificate"]);
    }

    #[tokio::test]
    async fn unreachable_tls_is_transient() {
        let c = ctx("https://example.com/", ScriptedFetcher::new(), Vec::new());
        assert!(SslTls.run(&c, &json!({})).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn plain_http_target() {
        let c = ctx("http://example.com/", ScriptedFetcher::new(), Vec::new());
        assert_eq!(types(&SslTls.run(&c, &json!({})).await.unwrap()), ["https_not_used"]);
    }

    #[tokio::test]
    async fn http_entry_point() {
        let good = ScriptedFetcher::new().page("http://example.com/", 301, "", &[("Location", "https://example.com/")], "");
        let c = ctx("https://example.com/", good, Vec::new());
        assert!(HttpRedirect.run(&c, &json!({})).await.unwrap().is_empty());

        let bad = ScriptedFetcher::new().html("http://example.com/", "<html>hi</html>");
        let c = ctx("https://example.com/", bad, Vec::new());
        assert_eq!(types(&HttpRedirect.run(&c, &json!({})).await.unwrap()), ["http_served_without_redirect"]);
    }

    #[test]
    fn wildcard_matching() {
        assert!(name_matches("www.example.com", "*.example.com"));
        assert!(!name_matches("example.com", "*.example.com"));
        assert!(!name_matches("a.b.example.com", "*.example.com"));
    }
}
