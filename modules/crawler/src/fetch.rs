//! HTTP fetching behind a trait so crawls and probes can be scripted in tests.

use async_trait::async_trait;
use audit_core::config::CrawlerConfig;
use audit_core::PageRecord;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect::{Attempt, Policy};
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out")]
    Timeout,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("redirect refused: {0}")]
    Redirect(String),
    #[error("request blocked by target policy: {0}")]
    Blocked(String),
    #[error("http error: {0}")]
    Http(String),
}

impl FetchError {
    /// Worth another attempt later.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Timeout | FetchError::Connect(_) | FetchError::Http(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Options,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub follow_redirects: bool,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        FetchRequest { url, method: Method::Get, headers: Vec::new(), follow_redirects: true }
    }

    pub fn head(url: Url) -> Self {
        FetchRequest { method: Method::Head, ..FetchRequest::get(url) }
    }

    pub fn options(url: Url) -> Self {
        FetchRequest { method: Method::Options, ..FetchRequest::get(url) }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    /// URL after redirects.
    pub url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    /// Lowercased names, response order.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub truncated: bool,
}

impl FetchedPage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Declared content type, or a sniffed one when the server sent none.
    pub fn effective_content_type(&self) -> Option<String> {
        self.content_type.clone().or_else(|| infer::get(&self.body).map(|t| t.mime_type().to_string())).or_else(|| {
            let head = String::from_utf8_lossy(&self.body[..self.body.len().min(256)]).to_ascii_lowercase();
            (head.contains("<html") || head.contains("<!doctype html")).then(|| "text/html".to_string())
        })
    }

    pub fn into_record(self, links: Vec<String>) -> PageRecord {
        let content_type = self.effective_content_type();
        PageRecord {
            url: self.url.to_string(),
            status: self.status,
            content_type,
            body_hash: blake3::hash(&self.body).to_hex().to_string(),
            body: String::from_utf8_lossy(&self.body).into_owned(),
            headers: self.headers,
            links,
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn send(&self, req: FetchRequest) -> Result<FetchedPage, FetchError>;

    async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        self.send(FetchRequest::get(url.clone())).await
    }
}

/// Resolver handed to reqwest: refuses names whose addresses are blocked, so
/// a rebinding answer between validation and fetch cannot reach inside.
struct GuardedResolver;

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(lookup_public(name.as_str().to_string()))
    }
}

async fn lookup_public(host: String) -> Result<Addrs, Box<dyn std::error::Error + Send + Sync>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0u16)).await?.collect();
    if let Some(bad) = addrs.iter().find(|a| target_policy::is_blocked_ip(a.ip())) {
        return Err(format!("{host} resolves to blocked address {}", bad.ip()).into());
    }
    Ok(Box::new(addrs.into_iter()))
}

fn redirect_policy(max: usize) -> Policy {
    Policy::custom(move |attempt: Attempt| {
        if attempt.previous().len() >= max {
            return attempt.error(format!("more than {max} redirects"));
        }
        let url = attempt.url();
        if !matches!(url.scheme(), "http" | "https") {
            let scheme = url.scheme().to_string();
            return attempt.error(format!("redirect to {scheme} scheme"));
        }
        let blocked = match url.host() {
            Some(url::Host::Ipv4(ip)) => target_policy::is_blocked_ip(ip.into()),
            Some(url::Host::Ipv6(ip)) => target_policy::is_blocked_ip(ip.into()),
            Some(url::Host::Domain(d)) => target_policy::is_blocked_hostname(d, &[]) || target_policy::reserved_tld(d, &[]).is_some(),
            None => true,
        };
        if blocked {
            let to = url.to_string();
            return attempt.error(format!("redirect to blocked target {to}"));
        }
        attempt.follow()
    })
}

/// Production fetcher on reqwest + rustls.
pub struct ReqwestFetcher {
    following: Client,
    direct: Client,
    max_content_bytes: usize,
}

impl ReqwestFetcher {
    pub fn new(cfg: &CrawlerConfig) -> Result<Self, FetchError> {
        let build = |policy: Policy| {
            Client::builder()
                .redirect(policy)
                .timeout(cfg.fetch_timeout())
                .user_agent(cfg.user_agent.clone())
                .dns_resolver(Arc::new(GuardedResolver))
                .brotli(true)
                .gzip(true)
                .deflate(true)
                .build()
                .map_err(|e| FetchError::Http(e.to_string()))
        };
        Ok(ReqwestFetcher {
            following: build(redirect_policy(cfg.max_redirects))?,
            direct: build(Policy::none())?,
            max_content_bytes: cfg.max_content_bytes,
        })
    }
}

fn classify(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_redirect() {
        FetchError::Redirect(e.to_string())
    } else if e.is_connect() {
        let mut blocked = false;
        let mut src: Option<&dyn std::error::Error> = std::error::Error::source(&e);
        while let Some(s) = src {
            blocked |= s.to_string().contains("blocked address");
            src = s.source();
        }
        if blocked {
            FetchError::Blocked(e.to_string())
        } else {
            FetchError::Connect(e.to_string())
        }
    } else {
        FetchError::Http(e.to_string())
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn send(&self, req: FetchRequest) -> Result<FetchedPage, FetchError> {
        let client = if req.follow_redirects { &self.following } else { &self.direct };
        let method = match req.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
        };
        let mut rb = client.request(method, req.url.clone());
        for (k, v) in &req.headers {
            rb = rb.header(k.as_str(), v.as_str());
        }
        let mut resp = rb.send().await.map_err(classify)?;
        let status = resp.status().as_u16();
        let url = resp.url().clone();
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_ascii_lowercase(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = resp.chunk().await.map_err(classify)? {
            let room = self.max_content_bytes.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }
        Ok(FetchedPage { url, status, content_type, headers, body, truncated })
    }
}
