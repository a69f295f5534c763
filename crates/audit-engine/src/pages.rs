//! Parsed crawl pages shared by the detector tasks of an audit. The store
//! read and the HTML parse happen once per audit per process; entries no
//! running task holds are dropped when the cache is over capacity.

use audit_core::PageRecord;
use detectors::PageSet;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

struct Slot {
    pages: Arc<PageSet>,
    last_used: Instant,
}

pub(crate) struct PageCache {
    capacity: usize,
    slots: Mutex<HashMap<String, Slot>>,
}

impl PageCache {
    pub(crate) fn new(capacity: usize) -> Self {
        PageCache { capacity: capacity.max(1), slots: Mutex::new(HashMap::new()) }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        match self.slots.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The page set of `audit_id`. `load` runs only when none is cached; two
    /// racing loads keep whichever lands first.
    pub(crate) fn get_or_load<E>(
        &self,
        audit_id: &str,
        load: impl FnOnce() -> Result<Vec<PageRecord>, E>,
    ) -> Result<Arc<PageSet>, E> {
        if let Some(slot) = self.slots().get_mut(audit_id) {
            slot.last_used = Instant::now();
            return Ok(slot.pages.clone());
        }
        let loaded = Arc::new(PageSet::new(load()?));
        let mut slots = self.slots();
        let pages = slots
            .entry(audit_id.to_string())
            .or_insert_with(|| Slot { pages: loaded, last_used: Instant::now() })
            .pages
            .clone();
        self.evict(&mut slots);
        Ok(pages)
    }

    pub(crate) fn forget(&self, audit_id: &str) {
        self.slots().remove(audit_id);
    }

    fn evict(&self, slots: &mut HashMap<String, Slot>) {
        if slots.len() <= self.capacity {
            return;
        }
        let mut idle: Vec<(Instant, String)> = slots
            .iter()
            .filter(|(_, s)| Arc::strong_count(&s.pages) == 1)
            .map(|(k, s)| (s.last_used, k.clone()))
            .collect();
        idle.sort();
        let excess = slots.len() - self.capacity;
        for (_, key) in idle.into_iter().take(excess) {
            slots.remove(&key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn page(url: &str) -> PageRecord {
        PageRecord {
            url: url.into(),
            status: 200,
            content_type: Some("text/html".into()),
            headers: Default::default(),
            body_hash: String::new(),
            body: "<form action=/login><input type=password></form>".into(),
            links: Vec::new(),
        }
    }

    #[test]
    fn one_load_serves_every_task_of_an_audit() {
        let cache = PageCache::new(4);
        let mut loads = 0;
        let a = cache
            .get_or_load("a1", || {
                loads += 1;
                Ok::<_, Infallible>(vec![page("https://example.com/")])
            })
            .unwrap();
        let b = cache
            .get_or_load("a1", || {
                loads += 1;
                Ok::<_, Infallible>(Vec::new())
            })
            .unwrap();
        assert_eq!(loads, 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.html_documents().next().unwrap().1.forms().len(), 1);
        assert_eq!(b.parsed(), 1);
    }

    #[test]
    fn failed_loads_are_not_cached() {
        let cache = PageCache::new(4);
        assert_eq!(cache.get_or_load("a1", || Err::<Vec<PageRecord>, _>("store down")).err(), Some("store down"));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn over_capacity_drops_only_idle_sets() {
        let cache = PageCache::new(1);
        let held = cache.get_or_load("a1", || Ok::<_, Infallible>(vec![page("https://a.example/")])).unwrap();
        drop(cache.get_or_load("a2", || Ok::<_, Infallible>(vec![page("https://b.example/")])).unwrap());
        assert_eq!(cache.len(), 2);
        drop(cache.get_or_load("a3", || Ok::<_, Infallible>(Vec::new())).unwrap());
        assert_eq!(cache.len(), 2);
        let again = cache.get_or_load("a1", || Ok::<_, Infallible>(Vec::new())).unwrap();
        assert!(Arc::ptr_eq(&held, &again));
        cache.forget("a1");
        assert_eq!(cache.len(), 1);
    }
}
