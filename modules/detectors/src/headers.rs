//! Response header analysis.

use async_trait::async_trait;
use audit_core::{NewFinding, PageRecord, Priority, Severity, Stage};
use crawler::FetchRequest;
use serde_json::json;
use std::sync::Arc;

use crate::{AuditCtx, Detector, DetectorError, DetectorSpec};

pub(crate) fn detectors() -> Vec<Arc<dyn Detector>> {
    vec![Arc::new(Headers), Arc::new(CspAnalysis), Arc::new(Cors), Arc::new(ServerDisclosure), Arc::new(CacheControl)]
}

const HSTS_MIN_AGE: u64 = 15_552_000;

fn hsts_max_age(value: &str) -> Option<u64> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|d| d.to_ascii_lowercase().strip_prefix("max-age=").map(|v| v.trim_matches('"').to_string()))
        .and_then(|v| v.parse().ok())
}

fn csp_frame_ancestors(page: &PageRecord) -> bool {
    page.header("content-security-policy").map(|c| c.to_ascii_lowercase().contains("frame-ancestors")).unwrap_or(false)
}

/// Baseline security headers on the landing page.
pub struct Headers;

#[async_trait]
impl Detector for Headers {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("headers", Stage::HeaderAnalysis, Priority::High).weight(2)
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let page = ctx.root_page().await?;
        let url = page.url.as_str();
        let mut out = Vec::new();

        if ctx.is_https() {
            match page.header("strict-transport-security") {
                None => out.push(
                    NewFinding::new(name, "missing_hsts", Severity::Medium, url)
                        .remediation("Send Strict-Transport-Security: max-age=31536000; includeSubDomains.")
                        .cwe("CWE-319")
                        .owasp("A05:2021"),
                ),
                Some(v) if hsts_max_age(v).map(|a| a < HSTS_MIN_AGE).unwrap_or(true) => out.push(
                    NewFinding::new(name, "weak_hsts", Severity::Low, url)
                        .evidence(json!({"value": v}))
                        .remediation("Raise the HSTS max-age to at least 180 days.")
                        .cwe("CWE-319"),
                ),
                Some(_) => {}
            }
        }
        if page.header("content-security-policy").is_none() {
            out.push(
                NewFinding::new(name, "missing_csp", Severity::Medium, url)
                    .remediation("Define a Content-Security-Policy that restricts script sources.")
                    .cwe("CWE-693")
                    .owasp("A05:2021"),
            );
        }
        if page.header("x-frame-options").is_none() && !csp_frame_ancestors(&page) {
            out.push(
                NewFinding::new(name, "missing_x_frame_options", Severity::Medium, url)
                    .remediation("Send X-Frame-Options: DENY or a CSP frame-ancestors directive.")
                    .cwe("CWE-1021")
                    .owasp("A05:2021"),
            );
        }
        let nosniff = page.header("x-content-type-options").map(|v| v.trim().eq_ignore_ascii_case("nosniff")).unwrap_or(false);
        if !nosniff {
            out.push(
                NewFinding::new(name, "missing_x_content_type_options", Severity::Low, url)
                    .remediation("Send X-Content-Type-Options: nosniff.")
                    .cwe("CWE-693")
                    .owasp("A05:2021"),
            );
        }
        if page.header("referrer-policy").is_none() {
            out.push(
                NewFinding::new(name, "missing_referrer_policy", Severity::Low, url)
                    .remediation("Send Referrer-Policy: strict-origin-when-cross-origin or stricter.")
                    .cwe("CWE-200"),
            );
        }
        if page.header("permissions-policy").is_none() {
            out.push(
                NewFinding::new(name, "missing_permissions_policy", Severity::Low, url)
                    .remediation("Send a Permissions-Policy that disables unused browser features.")
                    .cwe("CWE-693"),
            );
        }
        Ok(out)
    }
}

fn csp_directives(policy: &str) -> Vec<(String, Vec<String>)> {
    policy
        .split(';')
        .filter_map(|d| {
            let mut parts = d.split_whitespace();
            let name = parts.next()?.to_ascii_lowercase();
            Some((name, parts.map(|p| p.to_ascii_lowercase()).collect()))
        })
        .collect()
}

/// Weaknesses inside a Content-Security-Policy that is present.
pub struct CspAnalysis;

#[async_trait]
impl Detector for CspAnalysis {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("csp_analysis", Stage::HeaderAnalysis, Priority::Normal)
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let page = ctx.root_page().await?;
        let Some(policy) = page.header("content-security-policy") else { return Ok(Vec::new()) };
        let url = page.url.as_str();
        let directives = csp_directives(policy);
        let get = |n: &str| directives.iter().find(|(d, _)| d == n).map(|(_, v)| v.clone());
        let script = get("script-src").or_else(|| get("default-src"));
        let mut out = Vec::new();

        match &script {
            None => out.push(
                NewFinding::new(name, "csp_missing_script_src", Severity::Medium, url)
                    .evidence(json!({"policy": policy}))
                    .remediation("Add default-src or script-src so scripts are restricted.")
                    .cwe("CWE-693")
                    .owasp("A05:2021"),
            ),
            Some(sources) => {
                let has_nonce = sources.iter().any(|s| s.starts_with("'nonce-") || s.starts_with("'sha") || s == "'strict-dynamic'");
                if sources.iter().any(|s| s == "'unsafe-inline'") && !has_nonce {
                    out.push(
                        NewFinding::new(name, "csp_unsafe_inline", Severity::Medium, url)
                            .evidence(json!({"directive": "script-src", "source": "'unsafe-inline'"}))
                            .remediation("Drop 'unsafe-inline' from script-src and use nonces or hashes.")
                            .cwe("CWE-79")
                            .owasp("A05:2021"),
                    );
                }
                if sources.iter().any(|s| s == "'unsafe-eval'") {
                    out.push(
                        NewFinding::new(name, "csp_unsafe_eval", Severity::Medium, url)
                            .evidence(json!({"directive": "script-src", "source": "'unsafe-eval'"}))
                            .remediation("Drop 'unsafe-eval' and remove eval-style code paths.")
                            .cwe("CWE-95")
                            .owasp("A05:2021"),
                    );
                }
                let wild: Vec<&String> = sources.iter().filter(|s| *s == "*" || *s == "http:" || *s == "https:" || *s == "data:").collect();
                if !wild.is_empty() {
                    out.push(
                        NewFinding::new(name, "csp_wildcard_source", Severity::Medium, url)
                            .evidence(json!({"directive": "script-src", "sources": wild}))
                            .remediation("List explicit script origins instead of wildcards or bare schemes.")
                            .cwe("CWE-693")
                            .owasp("A05:2021"),
                    );
                }
            }
        }
        if get("object-src").is_none() && get("default-src").map(|d| !d.iter().any(|s| s == "'none'")).unwrap_or(true) {
            out.push(
                NewFinding::new(name, "csp_missing_object_src", Severity::Low, url)
                    .remediation("Add object-src 'none'.")
                    .cwe("CWE-693"),
            );
        }
        if get("base-uri").is_none() {
            out.push(
                NewFinding::new(name, "csp_missing_base_uri", Severity::Low, url)
                    .remediation("Add base-uri 'self' or 'none'.")
                    .cwe("CWE-693"),
            );
        }
        Ok(out)
    }
}

const CORS_PROBE_ORIGIN: &str = "https://cors-probe.audit-origin.net";

/// Origin reflection and wildcard CORS on the landing page.
pub struct Cors;

#[async_trait]
impl Detector for Cors {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("cors", Stage::HeaderAnalysis, Priority::Normal).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let url = ctx.target.as_str();
        let mut out = Vec::new();
        for origin in [CORS_PROBE_ORIGIN, "null"] {
            let req = FetchRequest::get(ctx.target.clone()).header("Origin", origin).no_redirects();
            let Some(resp) = ctx.probe(req).await? else { continue };
            let acao = resp.header("access-control-allow-origin").map(str::trim);
            let creds = resp.header("access-control-allow-credentials").map(|v| v.trim().eq_ignore_ascii_case("true")).unwrap_or(false);
            match acao {
                Some(a) if a == origin && origin != "null" => out.push(
                    NewFinding::new(name, "cors_origin_reflection", if creds { Severity::High } else { Severity::Medium }, url)
                        .evidence(json!({"reflected": true, "credentials": creds}))
                        .remediation("Only echo origins from an explicit allowlist.")
                        .cwe("CWE-942")
                        .owasp("A05:2021"),
                ),
                Some("null") if origin == "null" => out.push(
                    NewFinding::new(name, "cors_null_origin", Severity::Medium, url)
                        .evidence(json!({"credentials": creds}))
                        .remediation("Never allow the null origin.")
                        .cwe("CWE-942")
                        .owasp("A05:2021"),
                ),
                Some("*") if creds && origin != "null" => out.push(
                    NewFinding::new(name, "cors_wildcard_with_credentials", Severity::Medium, url)
                        .remediation("Drop Access-Control-Allow-Credentials or list explicit origins.")
                        .cwe("CWE-942"),
                ),
                _ => {}
            }
        }
        Ok(out)
    }
}

fn has_version(v: &str) -> bool {
    v.chars().any(|c| c.is_ascii_digit()) && v.contains(['/', ' '])
}

/// Version banners and technology hints.
pub struct ServerDisclosure;

#[async_trait]
impl Detector for ServerDisclosure {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("server_disclosure", Stage::HeaderAnalysis, Priority::Low)
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let page = ctx.root_page().await?;
        let url = page.url.as_str();
        let mut out = Vec::new();
        for header in ["server", "x-powered-by", "x-aspnet-version", "x-aspnetmvc-version", "x-generator"] {
            let Some(v) = page.header(header) else { continue };
            if header == "server" && !has_version(v) {
                continue;
            }
            out.push(
                NewFinding::new(name, "version_disclosure", Severity::Low, url)
                    .evidence(json!({"header": header, "value": v}))
                    .remediation(format!("Remove or genericize the {header} header."))
                    .cwe("CWE-200")
                    .owasp("A05:2021"),
            );
        }
        let mut tech = crawler::fingerprint_page(&page);
        for (p, markup) in ctx.html_documents().take(5) {
            tech.extend(crawler::compute_fingerprints(&p.headers, markup.title(), &p.body));
        }
        tech.sort();
        tech.dedup();
        if !tech.is_empty() {
            out.push(
                NewFinding::new(name, "technology_fingerprint", Severity::Info, url)
                    .evidence(json!({"technologies": tech}))
                    .remediation("No action needed; listed for inventory."),
            );
        }
        Ok(out)
    }
}

/// Pages that set session state or carry credentials forms but may be cached.
pub struct CacheControl;

#[async_trait]
impl Detector for CacheControl {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("cache_control", Stage::HeaderAnalysis, Priority::Low)
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut out = Vec::new();
        for (page, markup) in ctx.html_documents() {
            let password = markup.tags("input").any(|i| i.attr("type").is_some_and(|t| t.eq_ignore_ascii_case("password")));
            let sensitive = page.header("set-cookie").is_some() || password;
            if !sensitive {
                continue;
            }
            let cc = page.header("cache-control").unwrap_or("").to_ascii_lowercase();
            if !(cc.contains("no-store") || cc.contains("private")) {
                out.push(
                    NewFinding::new(name, "sensitive_page_cacheable", Severity::Low, &page.url)
                        .evidence(json!({"cache_control": page.header("cache-control")}))
                        .remediation("Send Cache-Control: no-store on pages that set cookies or show credentials forms.")
                        .cwe("CWE-525")
                        .owasp("A04:2021"),
                );
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{ctx, html, types};
    use crawler::ScriptedFetcher;

    #[tokio::test]
    async fn bare_site_misses_everything() {
        let c = ctx("https://example.com/", ScriptedFetcher::new(), vec![html("https://example.com/", &[], "<html></html>")]);
        let f = Headers.run(&c, &json!({})).await.unwrap();
        assert_eq!(
            types(&f),
            [
                "missing_csp",
                "missing_hsts",
                "missing_permissions_policy",
                "missing_referrer_policy",
                "missing_x_content_type_options",
                "missing_x_frame_options",
            ]
        );
    }

    #[tokio::test]
    async fn hardened_site_is_clean() {
        let headers = [
            ("Strict-Transport-Security", "max-age=31536000; includeSubDomains"),
            ("Content-Security-Policy", "default-src 'self'; object-src 'none'; base-uri 'none'; frame-ancestors 'none'"),
            ("X-Content-Type-Options", "nosniff"),
            ("Referrer-Policy", "no-referrer"),
            ("Permissions-Policy", "camera=()"),
        ];
        let c = ctx("https://example.com/", ScriptedFetcher::new(), vec![html("https://example.com/", &headers, "")]);
        assert!(Headers.run(&c, &json!({})).await.unwrap().is_empty());
        assert!(CspAnalysis.run(&c, &json!({})).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn headers_fetches_root_when_not_crawled() {
        let fetcher = ScriptedFetcher::new().page(
            "https://example.com/",
            200,
            "text/html",
            &[("strict-transport-security", "max-age=300")],
            "<html></html>",
        );
        let c = ctx("https://example.com/", fetcher, Vec::new());
        let f = Headers.run(&c, &json!({})).await.unwrap();
        assert!(types(&f).contains(&"weak_hsts"));
    }

    #[tokio::test]
    async fn weak_csp() {
        let headers = [("Content-Security-Policy", "script-src 'self' 'unsafe-inline' 'unsafe-eval' https:")];
        let c = ctx("https://example.com/", ScriptedFetcher::new(), vec![html("https://example.com/", &headers, "")]);
        let f = CspAnalysis.run(&c, &json!({})).await.unwrap();
        assert_eq!(
            types(&f),
            ["csp_missing_base_uri", "csp_missing_object_src", "csp_unsafe_eval", "csp_unsafe_inline", "csp_wildcard_source"]
        );
    }

    #[tokio::test]
    async fn cors_reflection_with_credentials() {
        let fetcher = ScriptedFetcher::new().page(
            "https://example.com/",
            200,
            "text/html",
            &[("Access-Control-Allow-Origin", CORS_PROBE_ORIGIN), ("Access-Control-Allow-Credentials", "true")],
            "",
        );
        let c = ctx("https://example.com/", fetcher, Vec::new());
        let f = Cors.run(&c, &json!({})).await.unwrap();
        assert_eq!(types(&f), ["cors_origin_reflection"]);
        assert_eq!(f[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn banners_and_tech() {
        let page = html(
            "https://example.com/",
            &[("Server", "Apache/2.4.41 (Ubuntu)"), ("X-Powered-By", "PHP/7.4.3")],
            "<link href='/wp-content/themes/x.css'>",
        );
        let c = ctx("https://example.com/", ScriptedFetcher::new(), vec![page]);
        let f = ServerDisclosure.run(&c, &json!({})).await.unwrap();
        assert_eq!(f.iter().filter(|x| x.finding_type == "version_disclosure").count(), 2);
        let tech = f.iter().find(|x| x.finding_type == "technology_fingerprint").unwrap();
        assert!(tech.evidence["technologies"].as_array().unwrap().iter().any(|t| t == "cms:wordpress"));
    }

    #[tokio::test]
    async fn login_page_cacheable() {
        let page = html("https://example.com/login", &[], "<form method=post><input type=PASSWORD name=pw></form>");
        let prose = html("https://example.com/about", &[], "<p>use type=\"password\" inputs</p>");
        let c = ctx("https://example.com/", ScriptedFetcher::new(), vec![page, prose]);
        let f = CacheControl.run(&c, &json!({})).await.unwrap();
        assert_eq!(types(&f), ["sensitive_page_cacheable"]);
        assert_eq!(f.len(), 1);
        assert_eq!(f[0].url, "https://example.com/login");
    }
}
