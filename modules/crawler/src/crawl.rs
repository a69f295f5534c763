//! Frontier expansion from a root URL.
//!
//! The crawl runs on its own task and hands events to the consumer through a
//! bounded channel, so a slow consumer slows the crawl instead of buffering
//! the whole site. Pages arrive in the order their fetches completed.

use audit_core::{CancellationToken, PageRecord};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use target_policy::{canonical_str, canonical_url, same_site, url_registrable_domain};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use url::Url;

use crate::budget::CrawlBudget;
use crate::fetch::{FetchError, Fetcher};
use crate::links::extract_links;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrawlError {
    #[error("root url unreachable: {0}")]
    RootUnreachable(String),
    #[error("crawl cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrawlEvent {
    Page(PageRecord),
    FetchFailed { url: String, error: FetchError },
    /// A link outside the root's registrable domain; recorded, never fetched.
    OffOrigin(String),
    Finished { pages: usize },
}

#[derive(Debug, Clone)]
pub struct CrawlRequest {
    pub root: Url,
    pub max_pages: usize,
    /// Pages persisted by an earlier run of the same crawl.
    pub resume: Vec<PageRecord>,
}

impl CrawlRequest {
    pub fn new(root: Url, max_pages: usize) -> Self {
        CrawlRequest { root, max_pages, resume: Vec::new() }
    }

    pub fn resume_from(mut self, pages: Vec<PageRecord>) -> Self {
        self.resume = pages;
        self
    }
}

pub struct CrawlStream {
    rx: mpsc::Receiver<Result<CrawlEvent, CrawlError>>,
    handle: JoinHandle<()>,
}

impl CrawlStream {
    /// Next event; `None` once the crawl task has exited.
    pub async fn next(&mut self) -> Option<Result<CrawlEvent, CrawlError>> {
        self.rx.recv().await
    }
}

impl Drop for CrawlStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn crawl(fetcher: Arc<dyn Fetcher>, budget: Arc<CrawlBudget>, req: CrawlRequest, cancel: CancellationToken) -> CrawlStream {
    let (tx, rx) = mpsc::channel(32);
    let handle = tokio::spawn(async move {
        let mut frontier = Frontier::new(&req);
        frontier.run(fetcher, budget, cancel, &tx).await;
    });
    CrawlStream { rx, handle }
}

struct Frontier {
    root: Url,
    root_key: String,
    root_domain: String,
    max_pages: usize,
    seen: HashSet<String>,
    off_origin: HashSet<String>,
    queue: VecDeque<Url>,
    attempts: usize,
    pages: usize,
    root_pending: bool,
}

impl Frontier {
    fn new(req: &CrawlRequest) -> Self {
        let mut f = Frontier {
            root: req.root.clone(),
            root_key: canonical_url(&req.root),
            root_domain: url_registrable_domain(&req.root).unwrap_or_default(),
            max_pages: req.max_pages.max(1),
            seen: HashSet::new(),
            off_origin: HashSet::new(),
            queue: VecDeque::new(),
            attempts: 0,
            pages: 0,
            root_pending: req.resume.is_empty(),
        };
        for page in &req.resume {
            if let Some(k) = canonical_str(&page.url) {
                f.seen.insert(k);
            }
            f.attempts += 1;
            f.pages += 1;
        }
        if req.resume.is_empty() {
            f.seen.insert(f.root_key.clone());
            f.queue.push_back(f.root.clone());
        } else {
            for page in &req.resume {
                for link in &page.links {
                    if let Ok(u) = Url::parse(link) {
                        if same_site(&u, &f.root_domain) && f.seen.insert(canonical_url(&u)) {
                            f.queue.push_back(u);
                        }
                    }
                }
            }
        }
        f
    }

    /// Queue same-site links; return off-origin ones not reported before.
    fn expand(&mut self, links: &[Url]) -> Vec<String> {
        let mut off = Vec::new();
        for link in links {
            let k = canonical_url(link);
            if same_site(link, &self.root_domain) {
                if self.seen.insert(k) {
                    self.queue.push_back(link.clone());
                }
            } else if self.off_origin.insert(k.clone()) {
                off.push(k);
            }
        }
        off
    }

    async fn run(
        &mut self,
        fetcher: Arc<dyn Fetcher>,
        budget: Arc<CrawlBudget>,
        cancel: CancellationToken,
        tx: &mpsc::Sender<Result<CrawlEvent, CrawlError>>,
    ) {
        let concurrency = budget.per_host();
        let mut inflight: JoinSet<(Url, Result<crate::FetchedPage, FetchError>)> = JoinSet::new();
        loop {
            if cancel.is_cancelled() {
                inflight.abort_all();
                let _ = tx.send(Err(CrawlError::Cancelled)).await;
                return;
            }
            // The root goes out alone; its outcome decides whether the crawl lives.
            let width = if self.root_pending { 1 } else { concurrency };
            while inflight.len() < width && self.attempts < self.max_pages {
                let Some(url) = self.queue.pop_front() else { break };
                self.attempts += 1;
                let fetcher = fetcher.clone();
                let budget = budget.clone();
                inflight.spawn(async move {
                    let host = url.host_str().unwrap_or_default().to_string();
                    let _permit = budget.acquire(&host).await;
                    let result = fetcher.fetch(&url).await;
                    (url, result)
                });
            }
            let Some(joined) = inflight.join_next().await else { break };
            let (url, result) = match joined {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "crawl fetch task failed");
                    continue;
                }
            };
            let is_root = self.root_pending && canonical_url(&url) == self.root_key;
            match result {
                Ok(page) => {
                    self.root_pending = false;
                    self.pages += 1;
                    if let Some(k) = canonical_str(page.url.as_str()) {
                        self.seen.insert(k);
                    }
                    let links = if page.effective_content_type().map(|c| c.contains("html")).unwrap_or(false) {
                        extract_links(&page.url, &page.text())
                    } else {
                        Vec::new()
                    };
                    let off = if same_site(&page.url, &self.root_domain) { self.expand(&links) } else { Vec::new() };
                    tracing::debug!(url = %page.url, status = page.status, links = links.len(), "crawled page");
                    let record = page.into_record(links.iter().map(|u| u.to_string()).collect());
                    if tx.send(Ok(CrawlEvent::Page(record))).await.is_err() {
                        return;
                    }
                    for o in off {
                        if tx.send(Ok(CrawlEvent::OffOrigin(o))).await.is_err() {
                            return;
                        }
                    }
                }
                Err(error) if is_root => {
                    tracing::warn!(url = %url, %error, "root url unreachable");
                    let _ = tx.send(Err(CrawlError::RootUnreachable(error.to_string()))).await;
                    return;
                }
                Err(error) => {
                    tracing::debug!(url = %url, %error, "page fetch failed");
                    if tx.send(Ok(CrawlEvent::FetchFailed { url: url.to_string(), error })).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = tx.send(Ok(CrawlEvent::Finished { pages: self.pages })).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptedFetcher;
    use std::time::Duration;

    fn budget() -> Arc<CrawlBudget> {
        Arc::new(CrawlBudget::new(100, 8, Duration::from_secs(60)))
    }

    async fn drain(mut s: CrawlStream) -> Vec<Result<CrawlEvent, CrawlError>> {
        let mut out = Vec::new();
        while let Some(ev) = s.next().await {
            out.push(ev);
        }
        out
    }

    fn site() -> ScriptedFetcher {
        ScriptedFetcher::new()
            .html(
                "https://example.com/",
                r#"<a href="/about">About</a> <a href="/about/">again</a> <a href="https://blog.example.com/">blog</a>
                   <a href="https://evil.test.org/">x</a> <script src="/app.js"></script> <a href="/gone">gone</a>"#,
            )
            .html("https://example.com/about", r#"<a href="/">home</a>"#)
            .html("https://blog.example.com/", "<p>blog</p>")
            .page("https://example.com/app.js", 200, "application/javascript", &[], "var a=1;")
            .fail("https://example.com/gone", FetchError::Timeout)
    }

    #[tokio::test]
    async fn crawls_same_site_and_records_off_origin() {
        let fetcher = Arc::new(site());
        let root = Url::parse("https://example.com").unwrap();
        let events = drain(crawl(fetcher.clone(), budget(), CrawlRequest::new(root, 50), CancellationToken::new())).await;

        let pages: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                Ok(CrawlEvent::Page(p)) => Some(p.url.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(pages.len(), 4);
        assert_eq!(pages[0], "https://example.com/");
        assert!(pages.contains(&"https://blog.example.com/".to_string()));
        assert!(events.iter().any(|e| matches!(e, Ok(CrawlEvent::OffOrigin(u)) if u == "https://evil.test.org/")));
        assert!(events.iter().any(|e| matches!(e, Ok(CrawlEvent::FetchFailed { url, .. }) if url.ends_with("/gone"))));
        assert!(matches!(events.last(), Some(Ok(CrawlEvent::Finished { pages: 4 }))));
        assert!(!fetcher.requested_urls().iter().any(|u| u.contains("evil")));
        // "/about" and "/about/" collapse to one fetch
        assert_eq!(fetcher.requested_urls().iter().filter(|u| u.contains("about")).count(), 1);
    }

    #[tokio::test]
    async fn page_cap_is_honored() {
        let root = Url::parse("https://example.com/").unwrap();
        let events = drain(crawl(Arc::new(site()), budget(), CrawlRequest::new(root, 2), CancellationToken::new())).await;
        let fetched = events.iter().filter(|e| matches!(e, Ok(CrawlEvent::Page(_)) | Ok(CrawlEvent::FetchFailed { .. }))).count();
        assert_eq!(fetched, 2);
    }

    #[tokio::test]
    async fn unreachable_root_aborts() {
        let fetcher = ScriptedFetcher::new().fail("https://down.example.com/", FetchError::Connect("refused".into()));
        let root = Url::parse("https://down.example.com/").unwrap();
        let events = drain(crawl(Arc::new(fetcher), budget(), CrawlRequest::new(root, 50), CancellationToken::new())).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(CrawlError::RootUnreachable(_))));
    }

    #[tokio::test]
    async fn cancellation_stops_between_pages() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let root = Url::parse("https://example.com/").unwrap();
        let fetcher = Arc::new(site());
        let events = drain(crawl(fetcher.clone(), budget(), CrawlRequest::new(root, 50), cancel)).await;
        assert_eq!(events, vec![Err(CrawlError::Cancelled)]);
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn resumes_without_refetching() {
        let root = Url::parse("https://example.com/").unwrap();
        let first = drain(crawl(Arc::new(site()), budget(), CrawlRequest::new(root.clone(), 1), CancellationToken::new())).await;
        let done: Vec<PageRecord> = first
            .into_iter()
            .filter_map(|e| match e {
                Ok(CrawlEvent::Page(p)) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(done.len(), 1);

        let fetcher = Arc::new(site());
        let req = CrawlRequest::new(root, 50).resume_from(done);
        let events = drain(crawl(fetcher.clone(), budget(), req, CancellationToken::new())).await;
        assert!(!fetcher.requested_urls().contains(&"https://example.com/".to_string()));
        assert!(matches!(events.last(), Some(Ok(CrawlEvent::Finished { pages: 4 }))));
    }
}
