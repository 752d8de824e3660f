//! Bounded LRU of self-refreshing DNS answers.

mod entry;

use std::num::NonZeroUsize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use hickory_proto::op::{Message, ResponseCode};
use lru::LruCache;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chain::Pipeline;
use crate::clock::now_secs;
use crate::config::CacheConfig;
use crate::proto_utils::cache_key;

use entry::CacheEntry;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

type Entries = Arc<RwLock<LruCache<String, Arc<CacheEntry>>>>;

pub struct QueryCache {
    entries: Entries,
    cfg: Arc<CacheConfig>,
    refresher: Arc<Pipeline>,
    sweep: CancellationToken,
}

impl QueryCache {
    /// Must be called inside a tokio runtime: the sweep task starts here.
    pub fn new(cfg: CacheConfig, refresher: Arc<Pipeline>) -> Self {
        let capacity = NonZeroUsize::new(cfg.size).unwrap_or(NonZeroUsize::MIN);
        let entries: Entries = Arc::new(RwLock::new(LruCache::new(capacity)));
        let sweep = CancellationToken::new();
        if cfg.expired_timeout > 0 {
            tokio::spawn(sweep_loop(Arc::clone(&entries), sweep.clone()));
        }
        Self {
            entries,
            cfg: Arc::new(cfg),
            refresher,
            sweep,
        }
    }

    pub fn find(&self, req: &Message) -> Option<Message> {
        let key = cache_key(req).ok()?;
        let entry = {
            let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            map.get(&key).cloned()
        }?;
        match entry.get_resp() {
            Some(resp) => Some(resp),
            None => {
                self.remove(&key, &entry);
                None
            }
        }
    }

    /// Caches `resp` for `req` unless the question is already cached.
    pub fn store(&self, req: &Message, resp: &Message) {
        let Ok(key) = cache_key(req) else {
            return;
        };
        if !is_cacheable(resp) {
            return;
        }
        let entry = {
            let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if map.contains(&key) {
                return;
            }
            let entry = CacheEntry::new(
                req.clone(),
                resp.clone(),
                Arc::clone(&self.cfg),
                Arc::clone(&self.refresher),
            );
            if let Some((evicted, old)) = map.push(key, Arc::clone(&entry)) {
                old.clear();
                debug!(event = "cache_evict", key = %evicted, "evicted least recently used entry");
            }
            entry
        };
        entry.start();
    }

    fn remove(&self, key: &str, entry: &Arc<CacheEntry>) {
        {
            let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if map.peek(key).is_some_and(|cur| Arc::ptr_eq(cur, entry)) {
                map.pop(key);
            }
        }
        entry.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub async fn shutdown(&self) {
        self.sweep.cancel();
        let drained: Vec<Arc<CacheEntry>> = {
            let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            std::iter::from_fn(|| map.pop_lru().map(|(_, e)| e)).collect()
        };
        for entry in &drained {
            entry.clear();
        }
        debug!(entries = drained.len(), "cache cleared");
        self.refresher.shutdown().await;
    }
}

/// SERVFAIL/REFUSED answers are not worth keeping around.
fn is_cacheable(resp: &Message) -> bool {
    matches!(
        resp.response_code(),
        ResponseCode::NoError | ResponseCode::NXDomain
    )
}

async fn sweep_loop(entries: Entries, token: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                let removed = sweep(&entries, now_secs());
                if removed > 0 {
                    debug!(event = "cache_sweep", removed, "removed idle cache entries");
                }
            }
        }
    }
}

/// Pops visit-expired entries from the LRU tail; returns how many went.
fn sweep(entries: &Entries, now: i64) -> usize {
    {
        let map = entries.read().unwrap_or_else(PoisonError::into_inner);
        match map.peek_lru() {
            Some((_, tail)) if tail.is_visit_expired(now) => {}
            _ => return 0,
        }
    }
    let mut map = entries.write().unwrap_or_else(PoisonError::into_inner);
    let mut removed = 0;
    while map
        .peek_lru()
        .is_some_and(|(_, tail)| tail.is_visit_expired(now))
    {
        if let Some((_, entry)) = map.pop_lru() {
            entry.clear();
            removed += 1;
        }
    }
    removed
}
