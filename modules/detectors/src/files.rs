//! Files and paths that should not be public.

use async_trait::async_trait;
use audit_core::{NewFinding, Priority, RuntimeClass, Severity, Stage};
use crawler::{FetchRequest, FetchedPage};
use regex::Regex;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use url::Url;

use crate::support::crawl_urls;
use crate::{AuditCtx, Detector, DetectorError, DetectorSpec};

pub(crate) fn detectors() -> Vec<Arc<dyn Detector>> {
    vec![Arc::new(SensitiveFiles), Arc::new(DirectoryListing), Arc::new(RobotsSecurityTxt), Arc::new(AdminInterfaces)]
}

enum Signature {
    Prefix(&'static str),
    Contains(&'static str),
    Pattern(&'static str),
}

impl Signature {
    fn matches(&self, body: &str) -> bool {
        match self {
            Signature::Prefix(p) => body.trim_start().starts_with(p),
            Signature::Contains(s) => body.contains(s),
            Signature::Pattern(p) => Regex::new(p).map(|r| r.is_match(body)).unwrap_or(false),
        }
    }
}

struct Exposure {
    path: &'static str,
    kind: &'static str,
    signature: Signature,
    severity: Severity,
}

/// Most damaging first so shallow scans still try them.
const EXPOSURES: &[Exposure] = &[
    Exposure { path: "/.env", kind: "environment_file", signature: Signature::Pattern(r"(?m)^[A-Z][A-Z0-9_]*=\S"), severity: Severity::Critical },
    Exposure { path: "/.git/config", kind: "git_repository", signature: Signature::Contains("[core]"), severity: Severity::High },
    Exposure { path: "/.git/HEAD", kind: "git_repository", signature: Signature::Prefix("ref: refs/"), severity: Severity::High },
    Exposure { path: "/wp-config.php.bak", kind: "config_backup", signature: Signature::Contains("DB_PASSWORD"), severity: Severity::Critical },
    Exposure { path: "/backup.sql", kind: "database_dump", signature: Signature::Pattern(r"(?i)(create table|insert into)"), severity: Severity::Critical },
    Exposure { path: "/.aws/credentials", kind: "cloud_credentials", signature: Signature::Contains("aws_access_key_id"), severity: Severity::Critical },
    Exposure { path: "/id_rsa", kind: "private_key", signature: Signature::Contains("PRIVATE KEY-----"), severity: Severity::Critical },
    Exposure { path: "/.htpasswd", kind: "password_file", signature: Signature::Pattern(r"(?m)^[\w.-]+:\$"), severity: Severity::High },
    Exposure { path: "/backup.zip", kind: "archive", signature: Signature::Prefix("PK\u{3}\u{4}"), severity: Severity::High },
    Exposure { path: "/.svn/entries", kind: "svn_repository", signature: Signature::Pattern(r"^\d+\s*\n"), severity: Severity::High },
    Exposure { path: "/phpinfo.php", kind: "phpinfo", signature: Signature::Contains("PHP Version"), severity: Severity::Medium },
    Exposure { path: "/server-status", kind: "server_status", signature: Signature::Contains("Apache Server Status"), severity: Severity::Medium },
    Exposure { path: "/docker-compose.yml", kind: "deployment_manifest", signature: Signature::Pattern(r"(?m)^services:"), severity: Severity::Medium },
    Exposure { path: "/.DS_Store", kind: "ds_store", signature: Signature::Contains("Bud1"), severity: Severity::Low },
];

/// Well-known secret-bearing files; content signatures rule out soft 404s.
pub struct SensitiveFiles;

#[async_trait]
impl Detector for SensitiveFiles {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("sensitive_files", Stage::SensitiveFiles, Priority::Normal).weight(3).runtime(RuntimeClass::Moderate).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut out = Vec::new();
        for e in EXPOSURES.iter().take(ctx.probe_budget()) {
            let Some(url) = ctx.url_for(e.path) else { continue };
            let Some(resp) = ctx.probe(FetchRequest::get(url.clone()).no_redirects()).await? else { continue };
            if resp.status != 200 || !e.signature.matches(&resp.text()) {
                continue;
            }
            out.push(
                NewFinding::new(name, "sensitive_file_exposed", e.severity, url.as_str())
                    .evidence(json!({"path": e.path, "kind": e.kind, "bytes": resp.body.len()}))
                    .remediation(format!("Remove {} from the web root or deny access to it.", e.path))
                    .cwe("CWE-538")
                    .owasp("A05:2021"),
            );
        }
        Ok(out)
    }
}

fn listing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<title>\s*(index of /|directory listing for /)").expect("listing regex"))
}

fn is_listing(body: &str) -> bool {
    listing_re().is_match(body)
}

/// Parent directories of crawled URLs, deepest first.
fn parent_dirs(urls: &[Url]) -> Vec<Url> {
    let mut dirs = BTreeSet::new();
    for u in urls {
        let mut path = u.path().to_string();
        while let Some(i) = path[..path.len().saturating_sub(1)].rfind('/') {
            path.truncate(i + 1);
            if path == "/" {
                break;
            }
            let mut d = u.clone();
            d.set_path(&path);
            d.set_query(None);
            d.set_fragment(None);
            dirs.insert((std::cmp::Reverse(path.matches('/').count()), d.to_string()));
        }
    }
    dirs.into_iter().filter_map(|(_, d)| Url::parse(&d).ok()).collect()
}

pub struct DirectoryListing;

#[async_trait]
impl Detector for DirectoryListing {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("directory_listing", Stage::SensitiveFiles, Priority::Low).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut reported = BTreeSet::new();
        let mut out = Vec::new();
        let finding = |url: &str| {
            NewFinding::new(name, "directory_listing", Severity::Medium, url)
                .remediation("Disable automatic directory indexes on the web server.")
                .cwe("CWE-548")
                .owasp("A05:2021")
        };
        for p in ctx.html_pages() {
            if is_listing(&p.body) && reported.insert(p.url.clone()) {
                out.push(finding(&p.url).evidence(json!({"source": "crawl"})));
            }
        }
        for dir in parent_dirs(&crawl_urls(ctx)).into_iter().take(ctx.probe_budget()) {
            if reported.contains(dir.as_str()) {
                continue;
            }
            let Some(resp) = ctx.probe(FetchRequest::get(dir.clone()).no_redirects()).await? else { continue };
            if resp.status == 200 && is_listing(&resp.text()) && reported.insert(dir.to_string()) {
                out.push(finding(dir.as_str()).evidence(json!({"source": "probe"})));
            }
        }
        Ok(out)
    }
}

const SENSITIVE_HINTS: &[&str] = &["admin", "backup", "private", "config", "internal", "secret", ".git", "db", "staging", "debug"];

/// robots.txt disclosures and the security.txt contact file.
pub struct RobotsSecurityTxt;

impl RobotsSecurityTxt {
    async fn fetch_ok(&self, ctx: &AuditCtx, path: &str) -> Result<Option<FetchedPage>, DetectorError> {
        let Some(url) = ctx.url_for(path) else { return Ok(None) };
        Ok(ctx.probe(FetchRequest::get(url)).await?.filter(|r| r.status == 200))
    }
}

#[async_trait]
impl Detector for RobotsSecurityTxt {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("robots_security_txt", Stage::SensitiveFiles, Priority::Low).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut out = Vec::new();
        if let Some(robots) = self.fetch_ok(ctx, "/robots.txt").await? {
            let paths: BTreeSet<String> = robots
                .text()
                .lines()
                .filter_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    k.trim().eq_ignore_ascii_case("disallow").then(|| v.trim().to_string())
                })
                .filter(|p| {
                    let lower = p.to_ascii_lowercase();
                    SENSITIVE_HINTS.iter().any(|h| lower.contains(h))
                })
                .collect();
            if !paths.is_empty() {
                out.push(
                    NewFinding::new(name, "robots_reveals_sensitive_paths", Severity::Info, robots.url.as_str())
                        .evidence(json!({"paths": paths}))
                        .remediation("robots.txt is public; protect these paths with authentication instead of hiding them.")
                        .cwe("CWE-200"),
                );
            }
        }
        let security_txt = match self.fetch_ok(ctx, "/.well-known/security.txt").await? {
            Some(p) => Some(p),
            None => self.fetch_ok(ctx, "/security.txt").await?,
        };
        let has_contact = security_txt.map(|p| p.text().lines().any(|l| l.trim_start().to_ascii_lowercase().starts_with("contact:"))).unwrap_or(false);
        if !has_contact {
            let url = ctx.url_for("/.well-known/security.txt").map(|u| u.to_string()).unwrap_or_else(|| ctx.target.to_string());
            out.push(
                NewFinding::new(name, "missing_security_txt", Severity::Info, url)
                    .remediation("Publish /.well-known/security.txt with a Contact field (RFC 9116).")
                    .cwe("CWE-1059"),
            );
        }
        Ok(out)
    }
}

const ADMIN_PATHS: &[&str] = &[
    "/admin/",
    "/administrator/",
    "/wp-admin/",
    "/wp-login.php",
    "/phpmyadmin/",
    "/manager/html",
    "/admin.php",
    "/cpanel",
    "/_admin/",
    "/console/",
];

fn looks_like_login(body: &str) -> bool {
    let b = body.to_ascii_lowercase();
    b.contains("type=\"password\"") || b.contains("type='password'") || b.contains("type=password")
}

/// Reachable administrative consoles.
pub struct AdminInterfaces;

#[async_trait]
impl Detector for AdminInterfaces {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("admin_interfaces", Stage::SensitiveFiles, Priority::Normal).runtime(RuntimeClass::Moderate).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut out = Vec::new();
        for path in ADMIN_PATHS.iter().take(ctx.probe_budget()) {
            let Some(url) = ctx.url_for(path) else { continue };
            let Some(resp) = ctx.probe(FetchRequest::get(url.clone()).no_redirects()).await? else { continue };
            let basic_auth = resp.status == 401 && resp.header("www-authenticate").is_some();
            let login = resp.status == 200 && looks_like_login(&resp.text());
            if !(basic_auth || login) {
                continue;
            }
            let severity = if login { Severity::Medium } else { Severity::Low };
            out.push(
                NewFinding::new(name, "admin_interface_exposed", severity, url.as_str())
                    .evidence(json!({"path": path, "status": resp.status}))
                    .remediation("Restrict administrative interfaces to a VPN or an IP allowlist and require MFA.")
                    .cwe("CWE-284")
                    .owasp("A01:2021"),
            );
        }
        Ok(out)
    }
}
