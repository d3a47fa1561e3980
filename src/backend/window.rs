use crate::backend::Decision;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;

/// The admission times still counted against a single caller key, oldest first.
#[derive(Debug, Clone)]
pub struct CallerWindow {
    timestamps: VecDeque<Instant>,
    /// The window of the policy this caller was last evaluated against.
    window: Duration,
}

impl CallerWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            timestamps: VecDeque::new(),
            window,
        }
    }

    /// Drop every timestamp that is older than the window.
    pub fn prune(&mut self, now: Instant) {
        let expired = self.expired(now, self.window);
        self.timestamps.drain(..expired);
    }

    /// Prune against `window`, then record `now` if fewer than `ceiling` requests remain.
    pub fn admit(&mut self, now: Instant, window: Duration, ceiling: u64) -> Decision {
        self.window = window;
        self.prune(now);
        if self.count() >= ceiling {
            return Decision::Denied;
        }
        self.timestamps.push_back(now);
        Decision::Allowed
    }

    /// Number of timestamps within `window` of `now`, without pruning anything.
    pub fn count_within(&self, now: Instant, window: Duration) -> u64 {
        (self.timestamps.len() - self.expired(now, window)) as u64
    }

    /// Requests left under `limit` (burst excluded), floored at zero.
    pub fn remaining(&self, now: Instant, window: Duration, limit: u64) -> u64 {
        limit.saturating_sub(self.count_within(now, window))
    }

    /// Forget a single admission, returning whether it was still being counted.
    pub fn forget(&mut self, admitted_at: Instant) -> bool {
        match self.timestamps.iter().rposition(|t| *t == admitted_at) {
            Some(index) => self.timestamps.remove(index).is_some(),
            None => false,
        }
    }

    pub fn count(&self) -> u64 {
        self.timestamps.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    // Timestamps are chronological, so the expired ones form a prefix.
    fn expired(&self, now: Instant, window: Duration) -> usize {
        self.timestamps
            .partition_point(|t| now.saturating_duration_since(*t) > window)
    }
}

/// Concurrent map from caller key to [CallerWindow].
///
/// All locking happens in here. The map is sharded, so a read-modify-write of one key holds
/// the lock of that key's shard for its whole duration, and the sweep takes each shard's
/// lock in turn. Neither ever runs against a key while the other holds it.
#[derive(Debug, Default)]
pub struct WindowStore {
    map: DashMap<String, CallerWindow>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a caller's window under a shared lock.
    pub fn get<R>(&self, key: &str, f: impl FnOnce(&CallerWindow) -> R) -> Option<R> {
        self.map.get(key).map(|window| f(&window))
    }

    /// Modify a caller's window under an exclusive lock, creating it first if absent.
    pub fn upsert<R>(
        &self,
        key: &str,
        window: Duration,
        f: impl FnOnce(&mut CallerWindow) -> R,
    ) -> R {
        let mut entry = self
            .map
            .entry(key.to_owned())
            .or_insert_with(|| CallerWindow::new(window));
        f(&mut entry)
    }

    /// Modify a caller's window only if it already exists.
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut CallerWindow) -> R) -> Option<R> {
        self.map.get_mut(key).map(|mut window| f(&mut window))
    }

    pub fn delete(&self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    /// Prune every caller by its own window and remove those left empty.
    ///
    /// Returns the number of callers removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.map.retain(|_key, window| {
            window.prune(now);
            let keep = !window.is_empty();
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
