//! Cookie flags and token handling.

use async_trait::async_trait;
use audit_core::{NewFinding, PageRecord, Priority, Severity, Stage};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use regex::Regex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use crate::support::redact;
use crate::{AuditCtx, Detector, DetectorError, DetectorSpec};

pub(crate) fn detectors() -> Vec<Arc<dyn Detector>> {
    vec![Arc::new(Cookies), Arc::new(JwtPosture)]
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SetCookie {
    name: String,
    value: String,
    secure: bool,
    http_only: bool,
    same_site: Option<String>,
}

fn parse_set_cookie(raw: &str) -> Option<SetCookie> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let mut c = SetCookie { name: name.to_string(), value: value.trim().to_string(), secure: false, http_only: false, same_site: None };
    for attr in parts {
        let attr = attr.trim();
        let (k, v) = attr.split_once('=').unwrap_or((attr, ""));
        match k.trim().to_ascii_lowercase().as_str() {
            "secure" => c.secure = true,
            "httponly" => c.http_only = true,
            "samesite" => c.same_site = Some(v.trim().to_ascii_lowercase()),
            _ => {}
        }
    }
    Some(c)
}

/// Every distinct cookie the site set, with the page that first set it.
fn site_cookies(pages: &[PageRecord]) -> Vec<(String, SetCookie)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for p in pages {
        for raw in p.headers_named("set-cookie") {
            if let Some(c) = parse_set_cookie(raw) {
                if seen.insert(c.name.to_ascii_lowercase()) {
                    out.push((p.url.clone(), c));
                }
            }
        }
    }
    out
}

fn is_session_like(name: &str) -> bool {
    let n = name.to_ascii_lowercase();
    ["sess", "sid", "auth", "token", "jwt", "login", "remember"].iter().any(|k| n.contains(k))
}

pub struct Cookies;

#[async_trait]
impl Detector for Cookies {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("cookies", Stage::CookieAnalysis, Priority::Normal).weight(2)
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut out = Vec::new();
        for (url, c) in site_cookies(&ctx.pages) {
            let ev = json!({"cookie": c.name});
            if ctx.is_https() && !c.secure {
                out.push(
                    NewFinding::new(name, "cookie_missing_secure", Severity::Medium, &url)
                        .evidence(ev.clone())
                        .remediation(format!("Set the Secure attribute on cookie {}.", c.name))
                        .cwe("CWE-614")
                        .owasp("A05:2021"),
                );
            }
            if !c.http_only && is_session_like(&c.name) {
                out.push(
                    NewFinding::new(name, "cookie_missing_httponly", Severity::Medium, &url)
                        .evidence(ev.clone())
                        .remediation(format!("Set HttpOnly on session cookie {} so scripts cannot read it.", c.name))
                        .cwe("CWE-1004")
                        .owasp("A05:2021"),
                );
            }
            match c.same_site.as_deref() {
                None => out.push(
                    NewFinding::new(name, "cookie_missing_samesite", Severity::Low, &url)
                        .evidence(ev)
                        .remediation(format!("Set SameSite=Lax or Strict on cookie {}.", c.name))
                        .cwe("CWE-1275"),
                ),
                Some("none") if !c.secure => out.push(
                    NewFinding::new(name, "cookie_samesite_none_insecure", Severity::Medium, &url)
                        .evidence(ev)
                        .remediation("SameSite=None requires the Secure attribute.")
                        .cwe("CWE-1275"),
                ),
                _ => {}
            }
        }
        Ok(out)
    }
}

fn jwt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"eyJ[A-Za-z0-9_-]{4,}\.eyJ[A-Za-z0-9_-]{4,}\.[A-Za-z0-9_-]*").expect("jwt regex"))
}

fn decode_part(part: &str) -> Option<serde_json::Value> {
    let bytes = URL_SAFE_NO_PAD.decode(part.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Header and claims of a compact JWS, when both decode.
fn decode_jwt(token: &str) -> Option<(serde_json::Value, serde_json::Value)> {
    let mut it = token.split('.');
    let header = decode_part(it.next()?)?;
    let claims = decode_part(it.next()?)?;
    Some((header, claims))
}

const SENSITIVE_CLAIMS: &[&str] = &["password", "passwd", "secret", "ssn", "credit_card", "card_number", "api_key"];

enum Carrier {
    Cookie { http_only: bool },
    Url,
    Body,
}

/// Tokens found in cookies, crawl URLs and page bodies.
pub struct JwtPosture;

impl JwtPosture {
    fn inspect(&self, token: &str, at: &str, carrier: Carrier, out: &mut Vec<NewFinding>) {
        let name = self.spec().name;
        let Some((header, claims)) = decode_jwt(token) else { return };
        let shown = redact(token);
        let alg = header.get("alg").and_then(|a| a.as_str()).unwrap_or("").to_ascii_lowercase();
        if alg == "none" || alg.is_empty() {
            out.push(
                NewFinding::new(name, "jwt_alg_none", Severity::High, at)
                    .evidence(json!({"token": shown, "alg": header.get("alg")}))
                    .remediation("Reject unsigned tokens and pin the accepted algorithms on the server.")
                    .cwe("CWE-347")
                    .owasp("A02:2021"),
            );
        }
        if claims.get("exp").is_none() {
            out.push(
                NewFinding::new(name, "jwt_without_expiry", Severity::Low, at)
                    .evidence(json!({"token": shown}))
                    .remediation("Issue tokens with a short exp claim.")
                    .cwe("CWE-613"),
            );
        }
        let leaked: Vec<&str> = SENSITIVE_CLAIMS.iter().copied().filter(|k| claims.get(*k).is_some()).collect();
        if !leaked.is_empty() {
            out.push(
                NewFinding::new(name, "jwt_sensitive_claims", Severity::Medium, at)
                    .evidence(json!({"token": shown, "claims": leaked}))
                    .remediation("Keep secrets out of token claims; JWT payloads are only encoded.")
                    .cwe("CWE-312")
                    .owasp("A02:2021"),
            );
        }
        match carrier {
            Carrier::Url => out.push(
                NewFinding::new(name, "jwt_in_url", Severity::Medium, at)
                    .evidence(json!({"token": shown}))
                    .remediation("Send tokens in headers or cookies, never in URLs.")
                    .cwe("CWE-598")
                    .owasp("A04:2021"),
            ),
            Carrier::Cookie { http_only: false } => out.push(
                NewFinding::new(name, "jwt_cookie_script_readable", Severity::Medium, at)
                    .evidence(json!({"token": shown}))
                    .remediation("Mark the cookie carrying the token HttpOnly.")
                    .cwe("CWE-1004"),
            ),
            _ => {}
        }
    }
}

#[async_trait]
impl Detector for JwtPosture {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("jwt_posture", Stage::CookieAnalysis, Priority::Normal)
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for (url, c) in site_cookies(&ctx.pages) {
            if let Some(m) = jwt_re().find(&c.value) {
                if seen.insert(m.as_str().to_string()) {
                    self.inspect(m.as_str(), &url, Carrier::Cookie { http_only: c.http_only }, &mut out);
                }
            }
        }
        for p in ctx.pages.iter() {
            for link in std::iter::once(&p.url).chain(p.links.iter()) {
                for m in jwt_re().find_iter(link) {
                    if seen.insert(m.as_str().to_string()) {
                        self.inspect(m.as_str(), link, Carrier::Url, &mut out);
                    }
                }
            }
            for m in jwt_re().find_iter(&p.body) {
                if seen.insert(m.as_str().to_string()) {
                    self.inspect(m.as_str(), &p.url, Carrier::Body, &mut out);
                }
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

    fn jwt(header: serde_json::Value, claims: serde_json::Value) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        )
    }

    #[test]
    fn parses_attributes() {
        let c = parse_set_cookie("SID=abc; Path=/; Secure; HttpOnly; SameSite=Lax").unwrap();
        assert_eq!(c.name, "SID");
        assert!(c.secure && c.http_only);
        assert_eq!(c.same_site.as_deref(), Some("lax"));
        assert!(parse_set_cookie("garbage").is_none());
    }

    #[tokio::test]
    async fn weak_session_cookie() {
        let page = html("https://example.com/", &[("Set-Cookie", "sessionid=1; Path=/"), ("Set-Cookie", "theme=dark; Secure; SameSite=Lax")], "");
        let c = ctx("https://example.com/", ScriptedFetcher::new(), vec![page]);
        let f = Cookies.run(&c, &json!({})).await.unwrap();
        assert_eq!(types(&f), ["cookie_missing_httponly", "cookie_missing_samesite", "cookie_missing_secure"]);
        assert!(f.iter().all(|x| x.evidence["cookie"] == "sessionid"));
    }

    #[tokio::test]
    async fn hardened_cookie_is_clean() {
        let page = html("https://example.com/", &[("Set-Cookie", "sid=1; Secure; HttpOnly; SameSite=Strict")], "");
        let c = ctx("https://example.com/", ScriptedFetcher::new(), vec![page]);
        assert!(Cookies.run(&c, &json!({})).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsigned_token_in_url() {
        let token = jwt(json!({"alg": "none", "typ": "JWT"}), json!({"sub": "1", "password": "hunter2"}));
        let mut page = html("https://example.com/", &[], "");
        page.links.push(format!("https://example.com/cb?token={token}"));
        let c = ctx("https://example.com/", ScriptedFetcher::new(), vec![page]);
        let f = JwtPosture.run(&c, &json!({})).await.unwrap();
        assert_eq!(types(&f), ["jwt_alg_none", "jwt_in_url", "jwt_sensitive_claims", "jwt_without_expiry"]);
        assert!(!f[0].evidence.to_string().contains(&token));
    }

    #[tokio::test]
    async fn token_cookie_readable_by_scripts() {
        let token = jwt(json!({"alg": "HS256"}), json!({"sub": "1", "exp": 1_900_000_000}));
        let cookie = format!("access_token={token}; Secure; SameSite=Lax");
        let page = html("https://example.com/", &[("Set-Cookie", cookie.as_str())], "");
        let c = ctx("https://example.com/", ScriptedFetcher::new(), vec![page]);
        let f = JwtPosture.run(&c, &json!({})).await.unwrap();
        assert_eq!(types(&f), ["jwt_cookie_script_readable"]);
    }
}
