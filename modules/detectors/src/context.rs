//! What a detector sees of an audit.

use audit_core::{CancellationToken, PageRecord, ScanDepth};
use crawler::{FetchRequest, FetchedPage, Fetcher};
use std::ops::Deref;
use std::sync::{Arc, OnceLock};
use url::Url;

use crate::probes::{DnsLookup, TlsInspector};
use crate::support::Markup;
use crate::DetectorError;

/// The crawled pages of one audit. HTML is parsed on first use and the
/// result kept, so every detector holding the set reads the same tree.
#[derive(Debug, Default)]
pub struct PageSet {
    pages: Vec<PageRecord>,
    markup: Vec<OnceLock<Markup>>,
}

impl PageSet {
    pub fn new(pages: Vec<PageRecord>) -> Self {
        let markup = pages.iter().map(|_| OnceLock::new()).collect();
        PageSet { pages, markup }
    }

    /// Parsed markup of the `i`th page.
    pub fn markup(&self, i: usize) -> Option<&Markup> {
        let page = self.pages.get(i)?;
        Some(self.markup.get(i)?.get_or_init(|| Markup::parse(&page.body)))
    }

    /// HTML pages with their parsed markup, in crawl order.
    pub fn html_documents(&self) -> impl Iterator<Item = (&PageRecord, &Markup)> {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_html())
            .filter_map(move |(i, p)| self.markup(i).map(|m| (p, m)))
    }

    /// How many pages have been parsed so far.
    pub fn parsed(&self) -> usize {
        self.markup.iter().filter(|m| m.get().is_some()).count()
    }
}

impl Deref for PageSet {
    type Target = [PageRecord];

    fn deref(&self) -> &[PageRecord] {
        &self.pages
    }
}

#[derive(Clone)]
pub struct AuditCtx {
    pub audit_id: String,
    pub target: Url,
    pub depth: ScanDepth,
    /// Crawled pages, in crawl order. Empty for detectors that run before the crawl.
    pub pages: Arc<PageSet>,
    pub fetcher: Arc<dyn Fetcher>,
    pub dns: Arc<dyn DnsLookup>,
    pub tls: Arc<dyn TlsInspector>,
    pub cancel: CancellationToken,
}

impl AuditCtx {
    pub fn ensure_active(&self) -> Result<(), DetectorError> {
        if self.cancel.is_cancelled() {
            return Err(DetectorError::Cancelled);
        }
        Ok(())
    }

    pub fn host(&self) -> &str {
        self.target.host_str().unwrap_or_default()
    }

    pub fn root_domain(&self) -> String {
        target_policy::url_registrable_domain(&self.target).unwrap_or_default()
    }

    pub fn is_https(&self) -> bool {
        self.target.scheme() == "https"
    }

    /// One request to the target. Cancellation is checked first.
    pub async fn send(&self, req: FetchRequest) -> Result<FetchedPage, DetectorError> {
        self.ensure_active()?;
        Ok(self.fetcher.send(req).await?)
    }

    /// A best-effort probe: only cancellation is an error, failed requests are `None`.
    pub async fn probe(&self, req: FetchRequest) -> Result<Option<FetchedPage>, DetectorError> {
        self.ensure_active()?;
        let url = req.url.clone();
        match self.fetcher.send(req).await {
            Ok(p) => Ok(Some(p)),
            Err(e) => {
                tracing::debug!(audit_id = %self.audit_id, url = %url, error = %e, "probe failed");
                Ok(None)
            }
        }
    }

    /// `path` resolved against the target's origin.
    pub fn url_for(&self, path: &str) -> Option<Url> {
        self.target.join(path).ok()
    }

    /// The crawled root page, or a fresh fetch of the target.
    pub async fn root_page(&self) -> Result<PageRecord, DetectorError> {
        let key = target_policy::canonical_url(&self.target);
        if let Some(p) = self.pages.iter().find(|p| target_policy::canonical_str(&p.url).as_deref() == Some(key.as_str())) {
            return Ok(p.clone());
        }
        if let Some(p) = self.pages.first() {
            return Ok(p.clone());
        }
        let page = self.send(FetchRequest::get(self.target.clone())).await?;
        Ok(page.into_record(Vec::new()))
    }

    pub fn html_pages(&self) -> impl Iterator<Item = &PageRecord> {
        self.pages.iter().filter(|p| p.is_html())
    }

    pub fn html_documents(&self) -> impl Iterator<Item = (&PageRecord, &Markup)> {
        self.pages.html_documents()
    }

    pub fn script_pages(&self) -> impl Iterator<Item = &PageRecord> {
        self.pages.iter().filter(|p| p.is_javascript())
    }

    /// How many active probes this depth allows per detector.
    pub fn probe_budget(&self) -> usize {
        match self.depth {
            ScanDepth::Quick => 5,
            ScanDepth::Standard => 25,
            ScanDepth::Deep => 100,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::probes::{StaticDns, StaticTls};
    use crawler::ScriptedFetcher;

    pub fn ctx(target: &str, fetcher: ScriptedFetcher, pages: Vec<PageRecord>) -> AuditCtx {
        ctx_with(target, fetcher, pages, StaticDns::new(), StaticTls::default())
    }

    pub fn ctx_with(target: &str, fetcher: ScriptedFetcher, pages: Vec<PageRecord>, dns: StaticDns, tls: StaticTls) -> AuditCtx {
        AuditCtx {
            audit_id: "a1".into(),
            target: Url::parse(target).unwrap(),
            depth: ScanDepth::Standard,
            pages: Arc::new(PageSet::new(pages)),
            fetcher: Arc::new(fetcher),
            dns: Arc::new(dns),
            tls: Arc::new(tls),
            cancel: CancellationToken::new(),
        }
    }

    pub fn page(url: &str, content_type: &str, headers: &[(&str, &str)], body: &str) -> PageRecord {
        PageRecord {
            url: url.into(),
            status: 200,
            content_type: Some(content_type.into()),
            headers: headers.iter().map(|(k, v)| (k.to_ascii_lowercase(), v.to_string())).collect(),
            body_hash: String::new(),
            body: body.into(),
            links: Vec::new(),
        }
    }

    pub fn html(url: &str, headers: &[(&str, &str)], body: &str) -> PageRecord {
        page(url, "text/html", headers, body)
    }

    #[test]
    fn pages_are_parsed_once_and_only_when_read() {
        let set = PageSet::new(vec![
            html("https://example.com/", &[], "<form action=/a></form>"),
            page("https://example.com/app.js", "application/javascript", &[], "var a;"),
            html("https://example.com/b", &[], "<p>b</p>"),
        ]);
        assert_eq!(set.parsed(), 0);
        assert_eq!(set.len(), 3);
        let first = set.markup(0).unwrap() as *const Markup;
        assert_eq!(set.markup(0).unwrap() as *const Markup, first);
        let docs: Vec<&str> = set.html_documents().map(|(p, _)| p.url.as_str()).collect();
        assert_eq!(docs, ["https://example.com/", "https://example.com/b"]);
        assert_eq!(set.parsed(), 2);
        assert_eq!(set.html_documents().next().unwrap().1.forms().len(), 1);
    }

    pub fn types(findings: &[audit_core::NewFinding]) -> Vec<&str> {
        let mut t: Vec<&str> = findings.iter().map(|f| f.finding_type.as_str()).collect();
        t.sort();
        t.dedup();
        t
    }
}
