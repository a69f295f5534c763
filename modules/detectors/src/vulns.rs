//! Parameter-level checks. Active probes stay read-only: GET requests with
//! harmless marker values, never payloads that change server state.

use async_trait::async_trait;
use audit_core::{NewFinding, Priority, RuntimeClass, Severity, Stage};
use crawler::FetchRequest;
use regex::Regex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use url::Url;

use crate::support::{crawl_urls, param_names, with_param};
use crate::{AuditCtx, Detector, DetectorError, DetectorSpec};

pub(crate) fn detectors() -> Vec<Arc<dyn Detector>> {
    vec![Arc::new(ReflectedXss), Arc::new(Xxe), Arc::new(SsrfProbe), Arc::new(OpenRedirect), Arc::new(InfoDisclosure)]
}

/// Same-site URLs with at least one query parameter: crawled links plus GET
/// forms filled with placeholder values.
fn parameterized(ctx: &AuditCtx) -> Vec<Url> {
    let mut out: Vec<Url> = crawl_urls(ctx).into_iter().filter(|u| u.query().map(|q| !q.is_empty()).unwrap_or(false)).collect();
    let domain = ctx.root_domain();
    for (p, markup) in ctx.html_documents() {
        let Ok(page) = Url::parse(&p.url) else { continue };
        for f in markup.forms().iter().filter(|f| f.method() == "get") {
            let Some(mut action) = f.action_url(&page) else { continue };
            if !target_policy::same_site(&action, &domain) {
                continue;
            }
            let names: Vec<&str> = f.inputs.iter().filter_map(|i| i.attr("name")).filter(|n| !n.is_empty()).collect();
            if names.is_empty() {
                continue;
            }
            action.set_query(None);
            action.query_pairs_mut().extend_pairs(names.iter().map(|n| (*n, "1")));
            out.push(action);
        }
    }
    out
}

/// (url, parameter) pairs, one per distinct path and parameter name.
fn param_targets(ctx: &AuditCtx, accept: impl Fn(&str, &str) -> bool) -> Vec<(Url, String)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for u in parameterized(ctx) {
        let pairs: Vec<(String, String)> = u.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
        for (name, value) in pairs {
            if accept(&name, &value) && seen.insert((u.path().to_string(), name.clone())) {
                out.push((u.clone(), name));
            }
        }
    }
    out
}

const XSS_MARKER: &str = "qz7k\"'><qz7k>";
const XSS_REFLECTED: &str = "\"'><qz7k>";

/// A marker with HTML metacharacters that comes back unencoded.
pub struct ReflectedXss;

#[async_trait]
impl Detector for ReflectedXss {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("reflected_xss", Stage::VulnerabilityDetection, Priority::Normal)
            .weight(3)
            .runtime(RuntimeClass::Moderate)
            .network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut out = Vec::new();
        for (url, param) in param_targets(ctx, |_, _| true).into_iter().take(ctx.probe_budget()) {
            let probe = with_param(&url, &param, XSS_MARKER);
            let Some(resp) = ctx.probe(FetchRequest::get(probe).no_redirects()).await? else { continue };
            let html = resp.content_type.as_deref().map(|c| c.contains("html")).unwrap_or(true);
            if html && resp.text().contains(XSS_REFLECTED) {
                let mut at = url.clone();
                at.set_query(None);
                out.push(
                    NewFinding::new(name, "reflected_xss", Severity::Medium, at.as_str())
                        .evidence(json!({"parameter": param, "marker_reflected": true}))
                        .remediation("HTML-encode user input on output and add a restrictive Content-Security-Policy.")
                        .cwe("CWE-79")
                        .owasp("A03:2021")
                        .confidence(0.7),
                );
            }
        }
        Ok(out)
    }
}

/// XML-consuming endpoints, where external entity handling is worth a review.
pub struct Xxe;

#[async_trait]
impl Detector for Xxe {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("xxe", Stage::VulnerabilityDetection, Priority::Low).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut out = Vec::new();
        let mut endpoints = Vec::new();
        for u in crawl_urls(ctx) {
            let path = u.path().to_ascii_lowercase();
            let query = u.query().unwrap_or("").to_ascii_lowercase();
            if path.contains("soap") || path.ends_with(".asmx") || query == "wsdl" || path.ends_with(".wsdl") {
                endpoints.push(u.to_string());
            }
        }
        for (p, markup) in ctx.html_documents() {
            if markup.forms().iter().any(|f| f.tag.attr("enctype").map(|e| e.contains("xml")).unwrap_or(false)) {
                endpoints.push(p.url.clone());
            }
        }
        endpoints.sort();
        endpoints.dedup();
        for e in &endpoints {
            out.push(
                NewFinding::new(name, "xml_endpoint_detected", Severity::Low, e)
                    .remediation("Disable DTD processing and external entities in the XML parser.")
                    .cwe("CWE-611")
                    .owasp("A05:2021")
                    .confidence(0.3),
            );
        }
        if let Some(url) = ctx.url_for("/xmlrpc.php") {
            if let Some(resp) = ctx.probe(FetchRequest::get(url.clone()).no_redirects()).await? {
                if resp.text().contains("XML-RPC server accepts POST requests only") {
                    out.push(
                        NewFinding::new(name, "xmlrpc_enabled", Severity::Low, url.as_str())
                            .remediation("Disable xmlrpc.php unless a client depends on it.")
                            .cwe("CWE-611")
                            .owasp("A05:2021"),
                    );
                }
            }
        }
        Ok(out)
    }
}

const SSRF_PARAMS: &[&str] = &[
    "url", "uri", "target", "dest", "feed", "fetch", "proxy", "image_url", "imageurl", "callback", "webhook", "site", "host", "link", "src",
];

fn looks_like_url(v: &str) -> bool {
    let v = v.to_ascii_lowercase();
    v.starts_with("http://") || v.starts_with("https://") || v.starts_with("//")
}

/// Parameters that carry URLs the server may fetch. Reported, not exploited.
pub struct SsrfProbe;

#[async_trait]
impl Detector for SsrfProbe {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("ssrf_probe", Stage::VulnerabilityDetection, Priority::Normal)
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let targets = param_targets(ctx, |n, v| SSRF_PARAMS.contains(&n.to_ascii_lowercase().as_str()) || looks_like_url(v));
        Ok(targets
            .into_iter()
            .map(|(mut url, param)| {
                url.set_query(None);
                NewFinding::new(name, "ssrf_parameter", Severity::Low, url.as_str())
                    .evidence(json!({"parameter": param}))
                    .remediation("Fetch only from an allowlist of hosts and block internal address ranges server-side.")
                    .cwe("CWE-918")
                    .owasp("A10:2021")
                    .confidence(0.4)
            })
            .collect())
    }
}

const REDIRECT_PARAMS: &[&str] = &[
    "redirect", "redirect_uri", "redirect_url", "redirecturl", "return", "returnto", "return_to", "returnurl", "return_url", "next", "url",
    "continue", "dest", "destination", "goto", "r", "forward",
];

const REDIRECT_PROBE: &str = "https://example.org/";

/// Redirect parameters that send visitors anywhere.
pub struct OpenRedirect;

#[async_trait]
impl Detector for OpenRedirect {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("open_redirect", Stage::VulnerabilityDetection, Priority::Normal).network()
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut out = Vec::new();
        let targets = param_targets(ctx, |n, _| REDIRECT_PARAMS.contains(&n.to_ascii_lowercase().as_str()));
        for (url, param) in targets.into_iter().take(ctx.probe_budget()) {
            let probe = with_param(&url, &param, REDIRECT_PROBE);
            let Some(resp) = ctx.probe(FetchRequest::get(probe.clone()).no_redirects()).await? else { continue };
            if !(300..400).contains(&resp.status) {
                continue;
            }
            let Some(location) = resp.header("location").and_then(|l| probe.join(l.trim()).ok()) else { continue };
            if location.host_str() == Some("example.org") {
                let mut at = url.clone();
                at.set_query(None);
                out.push(
                    NewFinding::new(name, "open_redirect", Severity::Medium, at.as_str())
                        .evidence(json!({"parameter": param, "location": location.as_str()}))
                        .remediation("Redirect only to relative paths or an allowlist of destinations.")
                        .cwe("CWE-601")
                        .owasp("A01:2021"),
                );
            }
        }
        Ok(out)
    }
}

struct Leak {
    finding_type: &'static str,
    label: &'static str,
    pattern: &'static str,
    severity: Severity,
}

const LEAKS: &[Leak] = &[
    Leak { finding_type: "debug_mode_enabled", label: "django_debug", pattern: r"DEBUG\s*=\s*True</code>", severity: Severity::High },
    Leak { finding_type: "debug_mode_enabled", label: "werkzeug_debugger", pattern: r"Werkzeug Debugger|__debugger__", severity: Severity::High },
    Leak { finding_type: "debug_mode_enabled", label: "laravel_whoops", pattern: r"Whoops! There was an error|Whoops, looks like something went wrong", severity: Severity::High },
    Leak { finding_type: "stack_trace_disclosure", label: "python_traceback", pattern: r"Traceback \(most recent call last\)", severity: Severity::Medium },
    Leak { finding_type: "stack_trace_disclosure", label: "java_stack", pattern: r"\bat [\w.$]+\([\w$]+\.java:\d+\)", severity: Severity::Medium },
    Leak { finding_type: "stack_trace_disclosure", label: "php_error", pattern: r"(?:Fatal error|Parse error|Warning)(?:</b>)?:.{0,300}? on line (?:<b>)?\d+", severity: Severity::Medium },
    Leak { finding_type: "stack_trace_disclosure", label: "aspnet_error", pattern: r"Server Error in '[^']*' Application", severity: Severity::Medium },
    Leak { finding_type: "sql_error_disclosure", label: "sql_error", pattern: r"SQLSTATE\[|You have an error in your SQL syntax|\bORA-\d{5}\b|PG::[A-Z]\w+Error|SQLite3::SQLException", severity: Severity::Medium },
];

fn leak_res() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| LEAKS.iter().map(|l| Regex::new(l.pattern).expect("leak regex")).collect())
}

fn private_ip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(10\.\d{1,3}\.\d{1,3}\.\d{1,3}|192\.168\.\d{1,3}\.\d{1,3}|172\.(?:1[6-9]|2\d|3[01])\.\d{1,3}\.\d{1,3})\b")
            .expect("private ip regex")
    })
}

/// Debug pages, stack traces and internal addresses in responses.
pub struct InfoDisclosure;

#[async_trait]
impl Detector for InfoDisclosure {
    fn spec(&self) -> DetectorSpec {
        DetectorSpec::new("info_disclosure", Stage::VulnerabilityDetection, Priority::Normal).weight(2)
    }

    async fn run(&self, ctx: &AuditCtx, _inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError> {
        let name = self.spec().name;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for p in ctx.pages.iter() {
            for (leak, re) in LEAKS.iter().zip(leak_res()) {
                if re.is_match(&p.body) && seen.insert((leak.finding_type, p.url.clone())) {
                    out.push(
                        NewFinding::new(name, leak.finding_type, leak.severity, &p.url)
                            .evidence(json!({"signature": leak.label, "status": p.status}))
                            .remediation("Turn off debug output in production and return generic error pages.")
                            .cwe("CWE-209")
                            .owasp("A05:2021"),
                    );
                }
            }
            let mut ips: Vec<&str> = private_ip_re().find_iter(&p.body).map(|m| m.as_str()).collect();
            for (_, v) in &p.headers {
                ips.extend(private_ip_re().find_iter(v).map(|m| m.as_str()));
            }
            ips.sort();
            ips.dedup();
            if !ips.is_empty() && seen.insert(("internal_ip_disclosure", p.url.clone())) {
                out.push(
                    NewFinding::new(name, "internal_ip_disclosure", Severity::Low, &p.url)
                        .evidence(json!({"addresses": ips}))
                        .remediation("Strip internal addresses from responses and headers.")
                        .cwe("CWE-200")
                        .owasp("A05:2021"),
                );
            }
        }
        Ok(out)
    }
}
