//! Coarse process-wide clock.
//!
//! Every TTL comparison in the cache reads `now_secs()` instead of asking the
//! OS. A background thread refreshes the value once per second, so a reading
//! can lag wall-clock time by up to ~1 s; all expiry math tolerates that.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static NOW_SECS: AtomicI64 = AtomicI64::new(0);
static UPDATER: OnceLock<()> = OnceLock::new();

const TICK: Duration = Duration::from_secs(1);

/// Unix time in seconds, at most ~1 s stale.
#[inline]
pub fn now_secs() -> i64 {
    UPDATER.get_or_init(start_updater);
    NOW_SECS.load(Ordering::Relaxed)
}

fn start_updater() {
    store_now();
    // 使用独立线程，避免依赖某个具体的 tokio runtime 生命周期。
    let spawned = thread::Builder::new()
        .name("xdns-clock".to_string())
        .spawn(|| {
            loop {
                thread::sleep(TICK);
                store_now();
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "clock updater thread failed to start, time will not advance");
    }
}

fn store_now() {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    NOW_SECS.store(now, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_tracks_system_time_within_a_tick() {
        let coarse = now_secs();
        let exact = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        assert!(coarse > 0);
        assert!((exact - coarse).abs() <= 2, "coarse={coarse} exact={exact}");
    }
}
