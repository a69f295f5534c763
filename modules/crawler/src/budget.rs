//! Fetch budget shared by every crawl in the process: one global cap and a
//! per-host cap. Host slots are leases that expire once idle past the TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct HostSlot {
    sem: Arc<Semaphore>,
    last_used: Instant,
}

pub struct CrawlBudget {
    global: Arc<Semaphore>,
    per_host: usize,
    ttl: Duration,
    hosts: Mutex<HashMap<String, HostSlot>>,
}

/// Both permits; dropping it returns them.
pub struct FetchPermit {
    _global: OwnedSemaphorePermit,
    _host: OwnedSemaphorePermit,
}

impl CrawlBudget {
    pub fn new(global_workers: usize, per_host: usize, ttl: Duration) -> Self {
        CrawlBudget {
            global: Arc::new(Semaphore::new(global_workers.max(1))),
            per_host: per_host.max(1),
            ttl,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &audit_core::config::CrawlerConfig) -> Self {
        Self::new(cfg.global_workers, cfg.per_host_concurrency, Duration::from_secs(cfg.host_lease_ttl_secs))
    }

    pub fn per_host(&self) -> usize {
        self.per_host
    }

    fn host_sem(&self, host: &str) -> Arc<Semaphore> {
        let key = host.to_ascii_lowercase();
        let now = Instant::now();
        let mut hosts = match self.hosts.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let per_host = self.per_host;
        let ttl = self.ttl;
        hosts.retain(|h, slot| *h == key || slot.sem.available_permits() < per_host || now.duration_since(slot.last_used) < ttl);
        let slot = hosts
            .entry(key)
            .or_insert_with(|| HostSlot { sem: Arc::new(Semaphore::new(per_host)), last_used: now });
        slot.last_used = now;
        slot.sem.clone()
    }

    pub async fn acquire(&self, host: &str) -> Option<FetchPermit> {
        let host_sem = self.host_sem(host);
        // Host first, so a busy host does not hold global slots while it waits.
        let host_permit = host_sem.acquire_owned().await.ok()?;
        let global_permit = self.global.clone().acquire_owned().await.ok()?;
        Some(FetchPermit { _global: global_permit, _host: host_permit })
    }

    pub fn tracked_hosts(&self) -> usize {
        self.hosts.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn available_global(&self) -> usize {
        self.global.available_permits()
    }
}
