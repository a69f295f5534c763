//! Forms: credential transport, CSRF tokens, client-trusted fields.

use async_trait::async_trait;
use audit_core::{NewFinding, Priority, Severity, Stage};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use url::Url;

use crate::support::Form;
use crate::{AuditCtx, Detector, DetectorError, DetectorSpec};

pub(crate) fn detectors() -> Vec<Arc<dyn Detector>> {
    vec![Arc::new(Forms), Arc::new(Csrf), Arc::new(BusinessLogic)]
}

/// Every form on a crawled HTML page, with the page URL. A form repeated on
/// many pages (a header login box) is reported once per action.
fn site_forms(ctx: &AuditCtx) -> Vec<(Url, Form)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (p, markup) in ctx.html_documents() {
        let Ok(page_url) = Url::parse(&p.url) else { continue };
        for f in markup.forms() {
            let action = f.action_url(&page_url).map(|u| u.to_string()).unwrap_or_default();
            let names: Vec<&str> = f.inputs.iter().filter_map(|i| i.attr("name")).collect();
            if seen.insert((action, f.method(), names.join(","))) {
                out.push((page_url.clone(), f.clone()));
            }
        }
    }
    out
}

pub struct Forms;

#[async_trait]
impl Detector for Forms {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("forms", Stage::FormAnalysis, Priority::Normal).weight(2)
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut out = Vec::new();
        for (page, form) in site_forms(ctx) {
            let Some(action) = form.action_url(&page) else { continue };
            let url = page.as_str();
            let ev = json!({"action": action.as_str(), "method": form.method()});
            if form.has_password() {
                if page.scheme() == "http" || action.scheme() == "http" {
                    out.push(
                        NewFinding::new(name, "password_form_over_http", Severity::High, url)
                            .evidence(ev.clone())
                            .remediation("Serve login pages and submit credentials over HTTPS only.")
                            .cwe("CWE-319")
                            .owasp("A02:2021"),
                    );
                }
                if form.method() == "get" {
                    out.push(
                        NewFinding::new(name, "password_in_get_form", Severity::Medium, url)
                            .evidence(ev.clone())
                            .remediation("Submit credentials with POST so they stay out of URLs and logs.")
                            .cwe("CWE-598")
                            .owasp("A04:2021"),
                    );
                }
                let autocomplete_off = form
                    .inputs
                    .iter()
                    .filter(|i| i.attr("type").map(|t| t.eq_ignore_ascii_case("password")).unwrap_or(false))
                    .all(|i| i.attr("autocomplete").map(|a| a != "on").unwrap_or(false))
                    || form.tag.attr("autocomplete") == Some("off");
                if !autocomplete_off {
                    out.push(
                        NewFinding::new(name, "password_autocomplete_enabled", Severity::Low, url)
                            .evidence(ev.clone())
                            .remediation("Set autocomplete=\"current-password\" or \"new-password\" on password fields.")
                            .cwe("CWE-522"),
                    );
                }
            }
            if !target_policy::same_site(&action, &ctx.root_domain()) {
                out.push(
                    NewFinding::new(name, "form_posts_off_site", Severity::Medium, url)
                        .evidence(ev)
                        .remediation("Check that the third-party form endpoint is intended and trusted.")
                        .cwe("CWE-201"),
                );
            }
        }
        Ok(out)
    }
}

const CSRF_FIELD_HINTS: &[&str] = &["csrf", "xsrf", "token", "nonce", "authenticity", "__requestverification"];

fn has_csrf_field(form: &Form) -> bool {
    form.inputs.iter().any(|i| {
        let hidden = i.attr("type").map(|t| t.eq_ignore_ascii_case("hidden")).unwrap_or(false);
        let name = i.attr("name").unwrap_or("").to_ascii_lowercase();
        hidden && CSRF_FIELD_HINTS.iter().any(|h| name.contains(h))
    })
}

/// State-changing forms without a synchronizer token.
pub struct Csrf;

#[async_trait]
impl Detector for Csrf {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("csrf", Stage::FormAnalysis, Priority::Normal)
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut out = Vec::new();
        for (page, form) in site_forms(ctx) {
            if form.method() != "post" || has_csrf_field(&form) {
                continue;
            }
            let fields: Vec<&str> = form.inputs.iter().filter_map(|i| i.attr("name")).collect();
            out.push(
                NewFinding::new(name, "missing_csrf_token", Severity::Medium, page.as_str())
                    .evidence(json!({"action": form.action_url(&page).map(|u| u.to_string()), "fields": fields}))
                    .remediation("Add a per-session anti-CSRF token to every state-changing form and verify it server-side.")
                    .cwe("CWE-352")
                    .owasp("A01:2021")
                    .confidence(0.8),
            );
        }
        Ok(out)
    }
}

const TRUSTED_FIELDS: &[&str] = &["price", "amount", "total", "discount", "role", "is_admin", "isadmin", "user_id", "userid", "quantity_max"];

/// Hidden fields that look like values the server should compute itself.
pub struct BusinessLogic;

#[async_trait]
impl Detector for BusinessLogic {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("business_logic", Stage::FormAnalysis, Priority::Low)
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut out = Vec::new();
        for (page, form) in site_forms(ctx) {
            let fields: Vec<&str> = form
                .inputs
                .iter()
                .filter(|i| i.attr("type").map(|t| t.eq_ignore_ascii_case("hidden")).unwrap_or(false))
                .filter_map(|i| i.attr("name"))
                .filter(|n| TRUSTED_FIELDS.contains(&n.to_ascii_lowercase().as_str()))
                .collect();
            if fields.is_empty() {
                continue;
            }
            out.push(
                NewFinding::new(name, "client_side_trusted_field", Severity::Low, page.as_str())
                    .evidence(json!({"fields": fields}))
                    .remediation("Recompute prices and privileges on the server; never trust hidden form values.")
                    .cwe("CWE-602")
                    .owasp("A04:2021")
                    .confidence(0.6),
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{ctx, html, types};
    use crawler::ScriptedFetcher;

    const LOGIN: &str = r#"<form action="/login" method="get"><input name="user"><input type="password" name="pw"></form>"#;

    #[tokio::test]
    async fn insecure_login_form() {
        let c = ctx("http://example.com/", ScriptedFetcher::new(), vec![html("http://example.com/", &[], LOGIN)]);
        let f = Forms.run(&c, &json!({})).await.unwrap();
        assert_eq!(types(&f), ["password_autocomplete_enabled", "password_form_over_http", "password_in_get_form"]);
    }

    #[tokio::test]
    async fn repeated_form_reported_once() {
        let pages = vec![html("http://example.com/", &[], LOGIN), html("http://example.com/about", &[], LOGIN)];
        let c = ctx("http://example.com/", ScriptedFetcher::new(), pages);
        let f = Forms.run(&c, &json!({})).await.unwrap();
        assert_eq!(f.iter().filter(|x| x.finding_type == "password_form_over_http").count(), 1);
        let body = r#"<form action="https://example.com/login" method="post"><input type="password" name="pw" autocomplete="current-password"></form>"#;
        let pages = vec![html("https://example.com/", &[], body), html("https://example.com/about", &[], body)];
        let c = ctx("https://example.com/", ScriptedFetcher::new(), pages);
        assert!(Forms.run(&c, &json!({})).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn off_site_action() {
        let body = r#"<form action="https://collector.other.net/x" method="post"><input name="email"></form>"#;
        let c = ctx("https://example.com/", ScriptedFetcher::new(), vec![html("https://example.com/", &[], body)]);
        assert_eq!(types(&Forms.run(&c, &json!({})).await.unwrap()), ["form_posts_off_site"]);
    }

    #[tokio::test]
    async fn csrf_token_presence() {
        let body = r#"<form method="post" action="/a"><input name="q"></form>
            <form method="post" action="/b"><input type="hidden" name="csrf_token" value="x"><input name="q"></form>
            <form action="/search"><input name="q"></form>"#;
        let c = ctx("https://example.com/", ScriptedFetcher::new(), vec![html("https://example.com/", &[], body)]);
        let f = Csrf.run(&c, &json!({})).await.unwrap();
        assert_eq!(f.len(), 1);
        assert_eq!(f[0].evidence["action"], "https://example.com/a");
    }

    #[tokio::test]
    async fn hidden_price_field() {
        let body = r#"<form method="post" action="/cart"><input type="hidden" name="csrf" value="t"><input type="hidden" name="Price" value="10"></form>"#;
        let c = ctx("https://example.com/", ScriptedFetcher::new(), vec![html("https://example.com/shop", &[], body)]);
        let f = BusinessLogic.run(&c, &json!({})).await.unwrap();
        assert_eq!(types(&f), ["client_side_trusted_field"]);
        assert_eq!(f[0].evidence["fields"][0], "Price");
    }
}
