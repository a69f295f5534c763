//! The engine context: every store handle, network seam and collaborator an
//! audit touches, assembled once and passed around by clone.

use audit_core::collab::{AiAnalyzer, Authz, CertificateIssuer, CreditManager, Notifier, OwnerOrAdmin, PdfRenderer};
use audit_core::{AuditConfig, AuditError, Clock, SystemClock};
use audit_store::Db;
use crawler::{CrawlBudget, Fetcher, ReqwestFetcher};
use detectors::probes::{DnsLookup, HickoryLookup, RustlsInspector, TlsInspector};
use detectors::Catalog;
use std::sync::Arc;
use target_policy::{Resolver, SystemResolver, UrlPolicy};

use crate::correlate::RuleSet;
use crate::pages::PageCache;
use crate::local::{HeuristicAnalyzer, LedgerCredits, LocalPdfRenderer, LogNotifier, RateLimitedAnalyzer, StoreCertificateIssuer};
use crate::presign::Presigner;

#[derive(Clone)]
pub struct Engine {
    pub(crate) db: Arc<Db>,
    pub(crate) cfg: Arc<AuditConfig>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) policy: Arc<UrlPolicy>,
    pub(crate) resolver: Arc<dyn Resolver>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) budget: Arc<CrawlBudget>,
    pub(crate) dns: Arc<dyn DnsLookup>,
    pub(crate) tls: Arc<dyn TlsInspector>,
    pub(crate) credits: Arc<dyn CreditManager>,
    pub(crate) certificates: Arc<dyn CertificateIssuer>,
    pub(crate) pdf: Arc<dyn PdfRenderer>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) ai: Option<Arc<dyn AiAnalyzer>>,
    pub(crate) authz: Arc<dyn Authz>,
    pub(crate) presigner: Presigner,
    pub(crate) rules: Arc<RuleSet>,
    pub(crate) pages: Arc<PageCache>,
}

impl Engine {
    pub fn builder(db: Arc<Db>, cfg: AuditConfig) -> EngineBuilder {
        EngineBuilder::new(db, cfg)
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn config(&self) -> &AuditConfig {
        &self.cfg
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

/// Anything left unset gets the production implementation. `build` must run
/// inside a tokio runtime: the AI rate limiter spawns its refill task there.
pub struct EngineBuilder {
    db: Arc<Db>,
    cfg: AuditConfig,
    clock: Option<Arc<dyn Clock>>,
    catalog: Option<Catalog>,
    resolver: Option<Arc<dyn Resolver>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    dns: Option<Arc<dyn DnsLookup>>,
    tls: Option<Arc<dyn TlsInspector>>,
    credits: Option<Arc<dyn CreditManager>>,
    certificates: Option<Arc<dyn CertificateIssuer>>,
    pdf: Option<Arc<dyn PdfRenderer>>,
    notifier: Option<Arc<dyn Notifier>>,
    ai: Option<Option<Arc<dyn AiAnalyzer>>>,
    authz: Option<Arc<dyn Authz>>,
    rules: Option<RuleSet>,
}

impl EngineBuilder {
    pub fn new(db: Arc<Db>, cfg: AuditConfig) -> Self {
        EngineBuilder {
            db,
            cfg,
            clock: None,
            catalog: None,
            resolver: None,
            fetcher: None,
            dns: None,
            tls: None,
            credits: None,
            certificates: None,
            pdf: None,
            notifier: None,
            ai: None,
            authz: None,
            rules: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn dns(mut self, dns: Arc<dyn DnsLookup>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn tls(mut self, tls: Arc<dyn TlsInspector>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn credits(mut self, credits: Arc<dyn CreditManager>) -> Self {
        self.credits = Some(credits);
        self
    }

    pub fn certificates(mut self, issuer: Arc<dyn CertificateIssuer>) -> Self {
        self.certificates = Some(issuer);
        self
    }

    pub fn pdf(mut self, renderer: Arc<dyn PdfRenderer>) -> Self {
        self.pdf = Some(renderer);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// `None` turns AI augmentation off entirely.
    pub fn ai(mut self, analyzer: Option<Arc<dyn AiAnalyzer>>) -> Self {
        self.ai = Some(analyzer);
        self
    }

    pub fn authz(mut self, authz: Arc<dyn Authz>) -> Self {
        self.authz = Some(authz);
        self
    }

    pub fn rules(mut self, rules: RuleSet) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn build(self) -> Result<Engine, AuditError> {
        let cfg = Arc::new(self.cfg);
        let db = self.db;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(f) => f,
            None => Arc::new(ReqwestFetcher::new(&cfg.crawler).map_err(AuditError::internal)?),
        };
        let dns: Arc<dyn DnsLookup> = match self.dns {
            Some(d) => d,
            None => Arc::new(HickoryLookup::from_system().map_err(AuditError::internal)?),
        };
        let tls = self.tls.unwrap_or_else(|| Arc::new(RustlsInspector::new(cfg.crawler.fetch_timeout())));
        let ai = match self.ai {
            Some(choice) => choice,
            None => Some(Arc::new(RateLimitedAnalyzer::new(Arc::new(HeuristicAnalyzer), &cfg.ai)) as Arc<dyn AiAnalyzer>),
        };
        let presigner = Presigner::from_config(&cfg.report);
        Ok(Engine {
            catalog: Arc::new(self.catalog.unwrap_or_else(Catalog::standard)),
            policy: Arc::new(UrlPolicy::new(&cfg.policy)),
            resolver: self.resolver.unwrap_or_else(|| Arc::new(SystemResolver)),
            budget: Arc::new(CrawlBudget::from_config(&cfg.crawler)),
            credits: self.credits.unwrap_or_else(|| Arc::new(LedgerCredits::new(db.clone(), clock.clone()))),
            certificates: self
                .certificates
                .unwrap_or_else(|| Arc::new(StoreCertificateIssuer::new(db.clone(), clock.clone()))),
            pdf: self.pdf.unwrap_or_else(|| Arc::new(LocalPdfRenderer::new(db.clone(), &cfg.report))),
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            authz: self.authz.unwrap_or_else(|| Arc::new(OwnerOrAdmin)),
            rules: Arc::new(self.rules.unwrap_or_else(RuleSet::standard)),
            pages: Arc::new(PageCache::new(cfg.worker.workers.max(1) * 2)),
            presigner,
            fetcher,
            dns,
            tls,
            ai,
            clock,
            db,
            cfg,
        })
    }
}
