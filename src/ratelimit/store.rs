//! Shared windowed counter store.
//!
//! The store maps keys to [`CounterEntry`] values inside a sharded
//! [`DashMap`]. Each increment runs under the lock of the shard owning the
//! key, which makes the read-modify-write indivisible for that key while
//! leaving every other shard free. Expired entries are treated as absent by
//! timestamp comparison, so the background sweep only bounds memory.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::counter::CounterEntry;
use crate::error::{Result, TurnstileError};

/// Outcome of one reclamation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReclaimStats {
    /// Entries removed because their window had ended
    pub cleaned: usize,
    /// Entries still live after the sweep
    pub remaining: usize,
}

/// Handle to the background sweep task. Dropping it cancels the task.
struct Reclaimer {
    task: JoinHandle<()>,
    interval: Duration,
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Process-wide table of per-key fixed-window counters.
///
/// Construct one per process (or per test), wrap it in an [`Arc`], and hand it
/// to every controller that should share accounting.
pub struct WindowedCounterStore {
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
    reclaimer: Mutex<Option<Reclaimer>>,
}

impl WindowedCounterStore {
    /// Create a store without background reclamation.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            reclaimer: Mutex::new(None),
        }
    }

    /// Create a store and start sweeping expired entries every
    /// `sweep_interval`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(clock: Arc<dyn Clock>, sweep_interval: Duration) -> Result<Arc<Self>> {
        let store = Arc::new(Self::new(clock));
        store.start_reclamation(sweep_interval)?;
        Ok(store)
    }

    /// The clock this store reads "now" from.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Record a request for `key` and return the resulting entry.
    pub fn increment(&self, key: &str, window_ms: u64) -> CounterEntry {
        let now = self.clock.now_ms();
        self.increment_at(key, window_ms, now)
    }

    /// Record a request for `key` as of `now`.
    ///
    /// Callers that need to derive further values from the same instant (such
    /// as a retry-after hint) read the clock once and pass it here.
    pub fn increment_at(&self, key: &str, window_ms: u64, now: u64) -> CounterEntry {
        if let Some(mut entry) = self.entries.get_mut(key) {
            return Self::advance(&mut entry, window_ms, now);
        }

        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => Self::advance(occupied.get_mut(), window_ms, now),
            Entry::Vacant(vacant) => {
                let entry = CounterEntry::open(now, window_ms);
                vacant.insert(entry);
                trace!(key = %key, reset_time = entry.reset_time, "Opened rate limit window");
                entry
            }
        }
    }

    fn advance(entry: &mut CounterEntry, window_ms: u64, now: u64) -> CounterEntry {
        if entry.is_expired(now) {
            *entry = CounterEntry::open(now, window_ms);
        } else {
            entry.hit();
        }
        *entry
    }

    /// Look up the live entry for `key`, if any.
    ///
    /// Expired entries read as absent but are left in place for the sweep.
    pub fn peek(&self, key: &str) -> Option<CounterEntry> {
        let now = self.clock.now_ms();
        self.entries
            .get(key)
            .map(|entry| *entry)
            .filter(|entry| !entry.is_expired(now))
    }

    /// Remove every expired entry.
    ///
    /// Shards are locked one at a time, so concurrent increments on other
    /// shards proceed while the sweep runs.
    pub fn reclaim(&self) -> ReclaimStats {
        let now = self.clock.now_ms();
        let mut stats = ReclaimStats::default();

        self.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                stats.cleaned += 1;
                false
            } else {
                stats.remaining += 1;
                true
            }
        });

        stats
    }

    /// Drop all entries. The store stays usable afterwards.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start (or restart) the background sweep.
    ///
    /// The task holds only a weak reference to the store and ends on its own
    /// once the store is dropped.
    pub fn start_reclamation(self: &Arc<Self>, sweep_interval: Duration) -> Result<()> {
        if sweep_interval.is_zero() {
            return Err(TurnstileError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            TurnstileError::Runtime(format!("cannot start reclamation: {}", e))
        })?;

        let task = runtime.spawn(reclamation_loop(Arc::downgrade(self), sweep_interval));
        let previous = self.reclaimer.lock().replace(Reclaimer {
            task,
            interval: sweep_interval,
        });
        drop(previous);

        info!(
            interval_ms = sweep_interval.as_millis() as u64,
            "Started rate limit reclamation"
        );
        Ok(())
    }

    /// Halt the background sweep. Entries are kept.
    pub fn stop(&self) {
        if let Some(reclaimer) = self.reclaimer.lock().take() {
            info!(
                interval_ms = reclaimer.interval.as_millis() as u64,
                entries = self.entries.len(),
                "Stopped rate limit reclamation"
            );
        }
    }

    /// Whether a background sweep is currently scheduled.
    pub fn is_reclaiming(&self) -> bool {
        self.reclaimer
            .lock()
            .as_ref()
            .is_some_and(|reclaimer| !reclaimer.task.is_finished())
    }

    /// Tie the background sweep to a scope: it is stopped when the returned
    /// guard is dropped, whichever way the scope exits.
    pub fn reclamation_guard(self: &Arc<Self>) -> ReclamationGuard {
        ReclamationGuard {
            store: Arc::clone(self),
        }
    }
}

impl Default for WindowedCounterStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

/// Stops the owning store's background sweep on drop.
#[must_use = "reclamation stops as soon as the guard is dropped"]
pub struct ReclamationGuard {
    store: Arc<WindowedCounterStore>,
}

impl ReclamationGuard {
    /// The guarded store.
    pub fn store(&self) -> &Arc<WindowedCounterStore> {
        &self.store
    }
}

impl Drop for ReclamationGuard {
    fn drop(&mut self) {
        self.store.stop();
    }
}

async fn reclamation_loop(store: Weak<WindowedCounterStore>, sweep_interval: Duration) {
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(store) = store.upgrade() else {
            debug!("Counter store dropped, ending reclamation");
            break;
        };

        let stats = store.reclaim();
        if stats.cleaned > 0 {
            info!(
                cleaned = stats.cleaned,
                remaining = stats.remaining,
                "Reclaimed expired rate limit entries"
            );
        } else {
            debug!(remaining = stats.remaining, "Rate limit sweep found nothing to reclaim");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn manual_store(start_ms: u64) -> (Arc<ManualClock>, WindowedCounterStore) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let store = WindowedCounterStore::new(clock.clone());
        (clock, store)
    }

    #[test]
    fn test_first_increment_opens_window() {
        let (_clock, store) = manual_store(10_000);

        let entry = store.increment("client", 60_000);
        assert_eq!(entry.count, 1);
        assert_eq!(entry.reset_time, 70_000);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_increment_within_window_keeps_reset_time() {
        let (clock, store) = manual_store(0);

        let first = store.increment("client", 1_000);
        clock.advance(400);
        let second = store.increment("client", 1_000);
        clock.advance(400);
        let third = store.increment("client", 1_000);

        assert_eq!(second.count, 2);
        assert_eq!(third.count, 3);
        assert_eq!(first.reset_time, third.reset_time);
    }

    #[test]
    fn test_expired_window_restarts_at_one() {
        let (clock, store) = manual_store(0);

        for _ in 0..25 {
            store.increment("client", 1_000);
        }
        clock.set(1_000);

        let entry = store.increment("client", 1_000);
        assert_eq!(entry.count, 1);
        assert_eq!(entry.reset_time, 2_000);
    }

    #[test]
    fn test_keys_are_independent() {
        let (_clock, store) = manual_store(0);

        store.increment("a", 1_000);
        store.increment("a", 1_000);
        store.increment("b", 1_000);

        assert_eq!(store.peek("a").map(|e| e.count), Some(2));
        assert_eq!(store.peek("b").map(|e| e.count), Some(1));
    }

    #[test]
    fn test_peek_missing_key() {
        let (_clock, store) = manual_store(0);
        assert_eq!(store.peek("nobody"), None);
    }

    #[test]
    fn test_peek_treats_expired_entry_as_absent() {
        let (clock, store) = manual_store(0);

        store.increment("client", 100);
        clock.set(101);

        // Expired by 1ms, no sweep has run.
        assert_eq!(store.peek("client"), None);
        // The read did not remove anything.
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_peek_does_not_count() {
        let (_clock, store) = manual_store(0);

        store.increment("client", 1_000);
        store.peek("client");
        store.peek("client");

        assert_eq!(store.increment("client", 1_000).count, 2);
    }

    #[test]
    fn test_zero_window_never_accumulates() {
        let (_clock, store) = manual_store(5_000);

        assert_eq!(store.increment("client", 0).count, 1);
        assert_eq!(store.increment("client", 0).count, 1);
        assert_eq!(store.peek("client"), None);
    }

    #[test]
    fn test_reclaim_removes_only_expired() {
        let (clock, store) = manual_store(0);

        store.increment("short", 100);
        store.increment("long", 10_000);
        clock.set(500);

        let stats = store.reclaim();
        assert_eq!(
            stats,
            ReclaimStats {
                cleaned: 1,
                remaining: 1
            }
        );
        assert_eq!(store.len(), 1);
        assert!(store.peek("long").is_some());
    }

    #[test]
    fn test_clear_then_reuse() {
        let (_clock, store) = manual_store(0);

        store.increment("client", 1_000);
        store.increment("client", 1_000);
        store.clear();

        assert!(store.is_empty());
        assert_eq!(store.increment("client", 1_000).count, 1);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        const THREADS: usize = 10;
        const PER_THREAD: usize = 100;

        let (_clock, store) = manual_store(0);

        let mut observed: Vec<u64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        (0..PER_THREAD)
                            .map(|_| store.increment("hot", 60_000).count)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        let total = (THREADS * PER_THREAD) as u64;
        assert_eq!(store.peek("hot").map(|e| e.count), Some(total));

        // Every count was handed out exactly once.
        observed.sort_unstable();
        assert_eq!(observed, (1..=total).collect::<Vec<_>>());
    }

    #[test]
    fn test_start_reclamation_requires_runtime() {
        let store = Arc::new(WindowedCounterStore::default());
        let result = store.start_reclamation(Duration::from_millis(10));
        assert!(matches!(result, Err(TurnstileError::Runtime(_))));
        assert!(!store.is_reclaiming());
    }

    #[tokio::test]
    async fn test_zero_sweep_interval_rejected() {
        let result = WindowedCounterStore::spawn(Arc::new(SystemClock), Duration::ZERO);
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[tokio::test]
    async fn test_background_sweep_removes_expired_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let store = WindowedCounterStore::spawn(clock.clone(), Duration::from_millis(10)).unwrap();
        assert!(store.is_reclaiming());

        store.increment("a", 100);
        store.increment("b", 100);
        store.increment("c", 10_000);
        clock.set(200);

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.len(), 1);
        assert!(store.peek("c").is_some());
        store.stop();
    }

    #[tokio::test]
    async fn test_stop_halts_sweeps() {
        let clock = Arc::new(ManualClock::new(0));
        let store = WindowedCounterStore::spawn(clock.clone(), Duration::from_millis(10)).unwrap();

        store.stop();
        assert!(!store.is_reclaiming());

        store.increment("a", 100);
        clock.set(200);
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Still stored, but logically absent.
        assert_eq!(store.len(), 1);
        assert_eq!(store.peek("a"), None);

        // A fresh window is unaffected by the stop.
        assert_eq!(store.increment("a", 100).count, 1);
    }

    #[tokio::test]
    async fn test_guard_stops_reclamation_on_drop() {
        let store =
            WindowedCounterStore::spawn(Arc::new(SystemClock), Duration::from_millis(10)).unwrap();

        {
            let guard = store.reclamation_guard();
            assert!(guard.store().is_reclaiming());
        }

        assert!(!store.is_reclaiming());
    }
}
