//! Capacity and idle-TTL bounded map shared by the in-memory security components.
//!
//! Entries are created lazily on first access and dropped when they sit idle past the
//! TTL or when the store is full. A full store evicts idle entries first, then the
//! least recently touched one, so a flood of unique keys cannot grow memory unbounded.

use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

// A full store evicts `capacity / EVICTION_DIVISOR` entries at once.
const EVICTION_DIVISOR: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreLimits {
    pub capacity: usize,
    pub idle_ttl: Duration,
}

impl StoreLimits {
    #[must_use]
    pub const fn new(capacity: usize, idle_ttl: Duration) -> Self {
        Self { capacity, idle_ttl }
    }

    /// Raise the idle TTL to at least `floor`.
    #[must_use]
    pub fn with_min_idle_ttl(self, floor: Duration) -> Self {
        Self {
            capacity: self.capacity,
            idle_ttl: self.idle_ttl.max(floor),
        }
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(60 * 60))
    }
}

#[derive(Debug)]
struct Slot<V> {
    value: V,
    touched_at: Instant,
}

#[derive(Debug)]
pub struct BoundedStore<V> {
    name: &'static str,
    entries: DashMap<String, Slot<V>>,
    limits: StoreLimits,
}

impl<V> BoundedStore<V> {
    #[must_use]
    pub fn new(name: &'static str, limits: StoreLimits) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            limits: StoreLimits::new(limits.capacity.max(1), limits.idle_ttl),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `update` against the value under `key`, creating it with `init` when the key is
    /// absent or has been idle past the TTL.
    ///
    /// The shard lock for `key` is held for the whole call, so updates to the same key
    /// never interleave.
    pub fn update<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> V,
        update: impl FnOnce(&mut V) -> R,
    ) -> R {
        let now = Instant::now();
        if !self.entries.contains_key(key) {
            self.make_room(now);
        }

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if self.is_idle(slot, now) {
                    slot.value = init();
                }
                slot.touched_at = now;
                update(&mut slot.value)
            }
            Entry::Vacant(vacant) => {
                let mut slot = vacant.insert(Slot {
                    value: init(),
                    touched_at: now,
                });
                update(&mut slot.value)
            }
        }
    }

    /// Store `value` under `key`, replacing whatever was there.
    pub fn insert(&self, key: &str, value: V) {
        let now = Instant::now();
        if !self.entries.contains_key(key) {
            self.make_room(now);
        }
        self.entries.insert(
            key.to_string(),
            Slot {
                value,
                touched_at: now,
            },
        );
    }

    /// Read the value under `key` without touching it. Idle entries read as absent.
    pub fn read<R>(&self, key: &str, read: impl FnOnce(&V) -> R) -> Option<R> {
        let now = Instant::now();
        let slot = self.entries.get(key)?;
        if self.is_idle(&slot, now) {
            return None;
        }
        Some(read(&slot.value))
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, slot)| slot.value)
    }

    /// Drop every idle entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| !self.is_idle(slot, now));
        before.saturating_sub(self.entries.len())
    }

    fn is_idle(&self, slot: &Slot<V>, now: Instant) -> bool {
        now.saturating_duration_since(slot.touched_at) >= self.limits.idle_ttl
    }

    // A full store drops idle entries, then evicts least recently touched ones until a
    // tenth of the capacity is free again. Concurrent inserters can overshoot the capacity
    // by at most one entry each.
    fn make_room(&self, now: Instant) {
        if self.entries.len() < self.limits.capacity {
            return;
        }

        let purged = self.purge_expired_at(now);
        if purged > 0 {
            debug!(store = self.name, purged, "purged idle entries at capacity");
        }

        let target = self.limits.capacity - self.limits.capacity.div_ceil(EVICTION_DIVISOR);
        let len = self.entries.len();
        if len <= target {
            return;
        }

        let excess = len - target;
        let mut by_age: Vec<(Instant, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().touched_at, entry.key().clone()))
            .collect();
        if excess < by_age.len() {
            by_age.select_nth_unstable_by_key(excess, |(touched_at, _)| *touched_at);
            by_age.truncate(excess);
        }
        for (_, key) in &by_age {
            self.entries.remove(key);
        }
        warn!(
            store = self.name,
            evicted = by_age.len(),
            "store at capacity, evicted least recently used entries"
        );
    }
}

impl<V: Send + Sync + 'static> BoundedStore<V> {
    /// Periodically purge idle entries until the store is dropped or the handle aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let every = every.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(store = store.name, purged, "sweeper purged idle entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use tokio::time::advance;

    fn store(capacity: usize, idle_secs: u64) -> BoundedStore<u32> {
        BoundedStore::new(
            "test",
            StoreLimits::new(capacity, Duration::from_secs(idle_secs)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn update_creates_then_mutates() {
        let store = store(10, 60);
        assert_eq!(store.update("a", || 0, |v| { *v += 1; *v }), 1);
        assert_eq!(store.update("a", || 0, |v| { *v += 1; *v }), 2);
        assert_eq!(store.read("a", |v| *v), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entries_read_as_absent_and_reinitialize() {
        let store = store(10, 60);
        store.update("a", || 5, |_| ());
        advance(Duration::from_secs(61)).await;

        assert_eq!(store.read("a", |v| *v), None);
        assert_eq!(store.update("a", || 0, |v| *v), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn update_refreshes_idle_clock() {
        let store = store(10, 60);
        store.update("a", || 1, |_| ());
        advance(Duration::from_secs(40)).await;
        store.update("a", || 0, |_| ());
        advance(Duration::from_secs(40)).await;

        assert_eq!(store.read("a", |v| *v), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn full_store_evicts_idle_entries_first() {
        let store = store(2, 60);
        store.insert("old", 1);
        advance(Duration::from_secs(61)).await;
        store.insert("fresh", 2);
        store.insert("new", 3);

        assert_eq!(store.len(), 2);
        assert_eq!(store.read("old", |v| *v), None);
        assert_eq!(store.read("fresh", |v| *v), Some(2));
        assert_eq!(store.read("new", |v| *v), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn full_store_evicts_least_recently_touched() {
        let store = store(2, 600);
        store.insert("first", 1);
        advance(Duration::from_secs(1)).await;
        store.insert("second", 2);
        advance(Duration::from_secs(1)).await;
        store.update("first", || 0, |_| ());
        advance(Duration::from_secs(1)).await;
        store.insert("third", 3);

        assert_eq!(store.len(), 2);
        assert_eq!(store.read("second", |v| *v), None);
        assert_eq!(store.read("first", |v| *v), Some(1));
        assert_eq!(store.read("third", |v| *v), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn full_store_evicts_a_batch_and_keeps_headroom() {
        let store = store(100, 3600);
        for i in 0..100 {
            store.insert(&format!("key-{i}"), i);
            advance(Duration::from_millis(10)).await;
        }
        assert_eq!(store.len(), 100);

        store.insert("overflow", 100);
        assert_eq!(store.len(), 91);
        for i in 0..10 {
            assert_eq!(store.read(&format!("key-{i}"), |v| *v), None);
        }
        assert_eq!(store.read("key-10", |v| *v), Some(10));

        // The freed tenth absorbs new keys without another eviction.
        for i in 0..9 {
            store.insert(&format!("late-{i}"), i);
        }
        assert_eq!(store.len(), 100);
        assert_eq!(store.read("key-10", |v| *v), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_counts_removed_entries() {
        let store = store(10, 60);
        store.insert("a", 1);
        store.insert("b", 2);
        advance(Duration::from_secs(30)).await;
        store.insert("c", 3);
        advance(Duration::from_secs(31)).await;

        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.remove("c"), Some(3));
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_updates_on_one_key_do_not_interleave() {
        let store = store(10, 600);
        let threads = 8;
        let per_thread = 1_000;
        let barrier = Barrier::new(threads);

        std::thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    barrier.wait();
                    for _ in 0..per_thread {
                        store.update("shared", || 0, |v| *v += 1);
                    }
                });
            }
        });

        assert_eq!(
            store.read("shared", |v| *v),
            Some(u32::try_from(threads * per_thread).unwrap_or(u32::MAX))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_and_stops_when_store_dropped() {
        let store = Arc::new(store(10, 60));
        store.insert("a", 1);
        let handle = store.spawn_sweeper(Duration::from_secs(30));

        advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert!(store.is_empty());

        drop(store);
        let finished = tokio::time::timeout(Duration::from_secs(3600), handle).await;
        assert!(matches!(finished, Ok(Ok(()))));
    }
}
