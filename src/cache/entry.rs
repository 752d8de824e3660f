use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::chain::{Pipeline, Request};
use crate::clock::now_secs;
use crate::config::CacheConfig;
use crate::proto_utils::{cache_ttl, host, rewrite_ttl};

/// Lowest TTL handed to clients while an entry lives.
pub const MIN_REPLY_TTL: u32 = 15;
/// Prefetch fires this many seconds before the TTL runs out.
const PREFETCH_LEAD_SECS: u32 = 15;
const MIN_REFRESH_INTERVAL_SECS: u64 = 15;
const MULTI_SPEED_CHECK_SAMPLES: u32 = 10;

struct Snapshot {
    response: Message,
    ttl: u32,
    update_time: i64,
}

/// One cached answer plus the task that keeps it fresh.
///
/// The refresh task only holds a [`Weak`] to its entry, so dropping the entry
/// from the cache is enough to end it; [`CacheEntry::clear`] also aborts it
/// right away.
pub struct CacheEntry {
    request: Message,
    state: RwLock<Snapshot>,
    store_time: i64,
    visited_time: AtomicI64,
    refreshes: AtomicU32,
    cleared: AtomicBool,
    updating: AtomicBool,
    task: Mutex<Option<AbortHandle>>,
    cfg: Arc<CacheConfig>,
    refresher: Arc<Pipeline>,
}

/// Resets the `updating` flag however the refresh ends.
struct UpdatingGuard<'a>(&'a AtomicBool);

impl Drop for UpdatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CacheEntry {
    pub fn new(
        request: Message,
        response: Message,
        cfg: Arc<CacheConfig>,
        refresher: Arc<Pipeline>,
    ) -> Arc<Self> {
        let now = now_secs();
        let ttl = cache_ttl(&response);
        Arc::new(Self {
            request,
            state: RwLock::new(Snapshot {
                response,
                ttl,
                update_time: now,
            }),
            store_time: now,
            visited_time: AtomicI64::new(now),
            refreshes: AtomicU32::new(0),
            cleared: AtomicBool::new(false),
            updating: AtomicBool::new(false),
            task: Mutex::new(None),
            cfg,
            refresher,
        })
    }

    /// Spawns the background refresh task.
    pub fn start(self: &Arc<Self>) {
        let handle = tokio::spawn(refresh_loop(Arc::downgrade(self)));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.abort_handle());
        // clear() 可能先于句柄登记发生
        if self.is_cleared() {
            handle.abort();
        }
    }

    /// Marks the entry dead and stops its refresh task.
    pub fn clear(&self) {
        self.cleared.store(true, Ordering::Release);
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }

    #[inline]
    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::Acquire)
    }

    pub fn is_visit_expired(&self, now: i64) -> bool {
        let timeout = self.cfg.expired_timeout;
        timeout > 0 && now - self.visited_time.load(Ordering::Relaxed) > timeout as i64
    }

    pub fn ttl(&self) -> u32 {
        self.read_state().ttl
    }

    /// A TTL-rewritten copy of the cached response, or `None` when the entry
    /// should be dropped by the caller.
    pub fn get_resp(self: &Arc<Self>) -> Option<Message> {
        self.get_resp_at(now_secs())
    }

    fn get_resp_at(self: &Arc<Self>, now: i64) -> Option<Message> {
        if self.is_visit_expired(now) {
            return None;
        }
        self.visited_time.store(now, Ordering::Relaxed);

        let (mut resp, left, expired) = {
            let state = self.read_state();
            let (left, expired) = remaining_ttl(state.ttl, state.update_time, now);
            (state.response.clone(), left, expired)
        };
        let reply_ttl = if expired {
            if !self.cfg.serve_expired {
                return None;
            }
            if !self.cfg.prefetch {
                self.spawn_refresh();
            }
            self.cfg.reply_ttl_when_expired().min(left)
        } else {
            left
        };
        rewrite_ttl(&mut resp, reply_ttl);
        Some(resp)
    }

    /// Starts a one-off refresh in the background unless one is running.
    fn spawn_refresh(self: &Arc<Self>) {
        if self.is_cleared() || !self.begin_refresh() {
            return;
        }
        let entry = Arc::clone(self);
        tokio::spawn(async move { entry.run_refresh().await });
    }

    /// Claims the `updating` flag; false when another refresh holds it.
    fn begin_refresh(&self) -> bool {
        self.updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Delay before the next scheduled refresh, `None` to stop scheduling.
    fn next_refresh_delay(&self) -> Option<Duration> {
        if self.cfg.prefetch {
            let secs = self.ttl().saturating_sub(PREFETCH_LEAD_SECS);
            return Some(Duration::from_secs(
                u64::from(secs).max(MIN_REFRESH_INTERVAL_SECS),
            ));
        }
        if self.cfg.serve_expired {
            let secs = self.cfg.expired_prefetch_interval.max(MIN_REFRESH_INTERVAL_SECS);
            return Some(Duration::from_secs(secs));
        }
        None
    }

    /// Re-resolves the stored request; at most one refresh runs at a time.
    pub async fn refresh(&self) {
        if self.begin_refresh() {
            self.run_refresh().await;
        }
    }

    /// Runs a refresh whose `updating` flag is already claimed.
    async fn run_refresh(&self) {
        let _guard = UpdatingGuard(&self.updating);
        if self.is_cleared() {
            return;
        }

        let samples = if self.cfg.multi_prefetch_speed_check
            && self.refreshes.load(Ordering::Relaxed) > 0
        {
            MULTI_SPEED_CHECK_SAMPLES
        } else {
            1
        };
        let req = Request::with_samples(self.request.clone(), samples);
        match self.refresher.handle(req).await {
            Ok(resp) => {
                let ttl = cache_ttl(&resp);
                let now = now_secs();
                {
                    let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                    *state = Snapshot {
                        response: resp,
                        ttl,
                        update_time: now,
                    };
                }
                self.refreshes.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event = "cache_refresh",
                    qname = %host(&self.request),
                    ttl,
                    samples,
                    age_secs = now - self.store_time,
                    "cache entry refreshed"
                );
            }
            Err(err) => warn!(
                event = "cache_refresh",
                qname = %host(&self.request),
                error = %err,
                "cache refresh failed, keeping previous answer"
            ),
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, secs: i64) {
        self.visited_time.fetch_sub(secs, Ordering::Relaxed);
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .update_time -= secs;
    }
}

/// Seconds left for a response of `ttl` last refreshed at `update_time`,
/// kept within `[min(MIN_REPLY_TTL, ttl), ttl]`, and whether it ran out.
fn remaining_ttl(ttl: u32, update_time: i64, now: i64) -> (u32, bool) {
    let floor = MIN_REPLY_TTL.min(ttl);
    let elapsed = (now - update_time).max(0);
    let expired = elapsed > i64::from(ttl);
    let left = (i64::from(ttl) - elapsed).clamp(i64::from(floor), i64::from(ttl));
    (left as u32, expired)
}

async fn refresh_loop(entry: Weak<CacheEntry>) {
    let Some(strong) = entry.upgrade() else {
        return;
    };
    if strong.is_cleared() {
        return;
    }
    strong.refresh().await;
    drop(strong);

    loop {
        let delay = match entry.upgrade() {
            Some(e) if !e.is_cleared() => match e.next_refresh_delay() {
                Some(delay) => delay,
                None => return,
            },
            _ => return,
        };
        tokio::time::sleep(delay).await;

        let Some(strong) = entry.upgrade() else {
            return;
        };
        if strong.is_cleared() {
            return;
        }
        strong.refresh().await;
    }
}
