//! Detector catalog.
//!
//! A detector inspects one aspect of the target and returns findings. Most
//! work over the crawled pages; the rest issue read-only GET/HEAD probes,
//! DNS lookups or a TLS handshake. Every network call goes through the
//! `AuditCtx`, which checks cancellation first.

mod context;
mod error;
pub mod probes;
mod support;

mod api;
mod cookies;
mod dns;
mod files;
mod forms;
mod headers;
mod javascript;
mod transport;
mod vulns;

pub use context::{AuditCtx, PageSet};
pub use support::{Form, Markup, Tag};
pub use error::DetectorError;

use async_trait::async_trait;
use audit_core::{NewFinding, Priority, RuntimeClass, Stage};
use std::collections::HashMap;
use std::sync::Arc;

/// Registration data of a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorSpec {
    pub name: &'static str,
    pub stage: Stage,
    pub priority: Priority,
    /// Relative share of its stage's progress.
    pub weight: u32,
    pub runtime: RuntimeClass,
    pub max_attempts: u32,
    /// Suspends on network I/O (probes) rather than only reading crawl pages.
    pub network: bool,
}

impl DetectorSpec {
    pub const fn new(name: &'static str, stage: Stage, priority: Priority) -> Self {
        DetectorSpec { name, stage, priority, weight: 1, runtime: RuntimeClass::Fast, max_attempts: 3, network: false }
    }

    pub const fn weight(mut self, w: u32) -> Self {
        self.weight = w;
        self
    }

    pub const fn runtime(mut self, r: RuntimeClass) -> Self {
        self.runtime = r;
        self
    }

    pub const fn attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub const fn network(mut self) -> Self {
        self.network = true;
        self
    }
}

/// The crawl is scheduled like a detector but driven by the engine.
pub const CRAWL: DetectorSpec =
    DetectorSpec::new("crawler", Stage::Crawling, Priority::High).weight(10).runtime(RuntimeClass::Slow).network();

#[async_trait]
pub trait Detector: Send + Sync {
    fn spec(&self) -> DetectorSpec;

    async fn run(&self, ctx: &AuditCtx, inputs: &serde_json::Value) -> Result<Vec<NewFinding>, DetectorError>;
}

#[derive(Clone)]
pub struct Catalog {
    detectors: Vec<Arc<dyn Detector>>,
    by_name: HashMap<&'static str, usize>,
}

impl Catalog {
    pub fn new(detectors: Vec<Arc<dyn Detector>>) -> Self {
        let by_name = detectors.iter().enumerate().map(|(i, d)| (d.spec().name, i)).collect();
        Catalog { detectors, by_name }
    }

    /// Every built-in detector.
    pub fn standard() -> Self {
        let mut all: Vec<Arc<dyn Detector>> = Vec::new();
        all.extend(dns::detectors());
        all.extend(transport::detectors());
        all.extend(headers::detectors());
        all.extend(cookies::detectors());
        all.extend(forms::detectors());
        all.extend(javascript::detectors());
        all.extend(files::detectors());
        all.extend(api::detectors());
        all.extend(vulns::detectors());
        Catalog::new(all)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Detector>> {
        self.by_name.get(name).map(|&i| self.detectors[i].clone())
    }

    pub fn spec(&self, name: &str) -> Option<DetectorSpec> {
        if name == CRAWL.name {
            return Some(CRAWL);
        }
        self.get(name).map(|d| d.spec())
    }

    pub fn specs(&self) -> Vec<DetectorSpec> {
        self.detectors.iter().map(|d| d.spec()).collect()
    }

    /// Detectors that need nothing from the crawl.
    pub fn before_crawl(&self) -> Vec<DetectorSpec> {
        self.specs().into_iter().filter(|s| s.stage < Stage::Crawling).collect()
    }

    pub fn after_crawl(&self) -> Vec<DetectorSpec> {
        self.specs().into_iter().filter(|s| s.stage > Stage::Crawling).collect()
    }

    pub fn in_stage(&self, stage: Stage) -> Vec<DetectorSpec> {
        self.specs().into_iter().filter(|s| s.stage == stage).collect()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}
