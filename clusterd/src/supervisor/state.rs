//! Supervisor-owned pool state
//!
//! Everything here is mutated only by the supervisor task, one event at a time.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::messages::{PoolStatus, WorkerId, WorkerStatus};

/// Lifecycle phase of a single worker as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerPhase {
    Forked,
    Listening,
    Ready,
    Disconnected,
}

/// Supervisor-side record of one live child process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub pid: Option<u32>,
    /// Forked with the primary hint
    pub primary_candidate: bool,
    pub phase: WorkerPhase,
    /// The supervisor asked this worker to terminate
    pub terminating: bool,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, pid: Option<u32>, primary_candidate: bool) -> Self {
        Self {
            id,
            pid,
            primary_candidate,
            phase: WorkerPhase::Forked,
            terminating: false,
        }
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            id: self.id,
            pid: self.pid,
            phase: self.phase,
            primary_candidate: self.primary_candidate,
            terminating: self.terminating,
        }
    }
}

/// One propagated artifact: the bundle plus its companion
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub payload: Value,
    pub auxiliary: Value,
}

impl CacheEntry {
    /// An entry only exists when a payload was actually sent
    pub fn from_parts(payload: Value, auxiliary: Value) -> Option<Self> {
        if payload.is_null() {
            None
        } else {
            Some(Self { payload, auxiliary })
        }
    }
}

/// The two most recently propagated artifacts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStore {
    pub js: Option<CacheEntry>,
    pub css: Option<CacheEntry>,
}

/// Workers slated for termination during a rolling restart
///
/// FIFO: the oldest queued worker is terminated first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownQueue {
    ids: VecDeque<WorkerId>,
}

impl ShutdownQueue {
    /// Queue an id unless it is already queued
    pub fn enqueue(&mut self, id: WorkerId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        self.ids.push_back(id);
        true
    }

    pub fn pop_next(&mut self) -> Option<WorkerId> {
        self.ids.pop_front()
    }

    /// Drop an id that exited before its turn
    pub fn remove(&mut self, id: WorkerId) -> bool {
        let before = self.ids.len();
        self.ids.retain(|&queued| queued != id);
        self.ids.len() != before
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.ids.iter().copied().collect()
    }
}

/// Crash-loop counter with a quiet-period reset window
///
/// Every crash re-arms the window; when it elapses with no further crash the
/// count drops back to zero.
#[derive(Debug, Clone)]
pub struct CrashCounter {
    count: usize,
    window: Duration,
    reset_at: Option<Instant>,
}

impl CrashCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            count: 0,
            window,
            reset_at: None,
        }
    }

    /// Record a crash at `now` and return the running total
    ///
    /// A window that already elapsed is reset first, even if its timer has
    /// not fired yet.
    pub fn record(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.count += 1;
        self.reset_at = Some(now + self.window);
        debug!(count = self.count, window = ?self.window, "CrashCounter::record");
        self.count
    }

    /// When the pending reset fires, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.reset_at
    }

    /// Reset the count if the window has elapsed at `now`
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.reset_at {
            Some(deadline) if now >= deadline => {
                debug!(count = self.count, "CrashCounter::expire: quiet window elapsed, resetting");
                self.count = 0;
                self.reset_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// All coordination state of the pool, owned by the supervisor task
#[derive(Debug, Clone)]
pub struct PoolState {
    pub workers: BTreeMap<WorkerId, WorkerHandle>,
    /// The worker that announced itself as primary, if still alive
    pub primary: Option<WorkerId>,
    pub shutdown_queue: ShutdownQueue,
    pub cache: CacheStore,
    pub crashes: CrashCounter,
    next_id: WorkerId,
}

impl PoolState {
    pub fn new(crash_window: Duration) -> Self {
        Self {
            workers: BTreeMap::new(),
            primary: None,
            shutdown_queue: ShutdownQueue::default(),
            cache: CacheStore::default(),
            crashes: CrashCounter::new(crash_window),
            next_id: 1,
        }
    }

    /// Hand out the next worker id; ids are never reused
    pub fn allocate_id(&mut self) -> WorkerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn is_live(&self, id: WorkerId) -> bool {
        self.workers.contains_key(&id)
    }

    pub fn live_ids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            workers: self.workers.values().map(WorkerHandle::status).collect(),
            primary: self.primary,
            shutdown_queue: self.shutdown_queue.ids(),
            crash_count: self.crashes.count(),
            js_cached: self.cache.js.is_some(),
            css_cached: self.cache.css.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shutdown_queue_is_fifo() {
        let mut queue = ShutdownQueue::default();
        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);
        assert_eq!(queue.pop_next(), Some(1));
        assert_eq!(queue.pop_next(), Some(2));
        assert_eq!(queue.pop_next(), Some(3));
        assert_eq!(queue.pop_next(), None);
    }

    #[test]
    fn test_shutdown_queue_ignores_duplicates() {
        let mut queue = ShutdownQueue::default();
        assert!(queue.enqueue(4));
        assert!(!queue.enqueue(4));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_shutdown_queue_remove() {
        let mut queue = ShutdownQueue::default();
        queue.enqueue(1);
        queue.enqueue(2);
        assert!(queue.remove(1));
        assert!(!queue.remove(1));
        assert!(!queue.contains(1));
        assert_eq!(queue.ids(), vec![2]);
    }

    #[test]
    fn test_crash_counter_resets_after_quiet_window() {
        let start = Instant::now();
        let mut counter = CrashCounter::new(Duration::from_secs(10));

        assert_eq!(counter.record(start), 1);
        assert_eq!(counter.record(start + Duration::from_secs(5)), 2);

        // Second crash re-armed the window
        assert!(!counter.expire(start + Duration::from_secs(12)));
        assert_eq!(counter.count(), 2);

        assert!(counter.expire(start + Duration::from_secs(15)));
        assert_eq!(counter.count(), 0);
        assert!(counter.deadline().is_none());
    }

    #[test]
    fn test_crash_after_elapsed_window_starts_a_new_count() {
        let start = Instant::now();
        let mut counter = CrashCounter::new(Duration::from_secs(10));
        counter.record(start);
        counter.record(start + Duration::from_secs(1));

        // Deadline passed but nobody called expire
        assert_eq!(counter.record(start + Duration::from_secs(20)), 1);
        assert_eq!(counter.deadline(), Some(start + Duration::from_secs(30)));
    }

    #[test]
    fn test_crash_counter_without_crash_never_expires() {
        let mut counter = CrashCounter::new(Duration::from_secs(1));
        assert!(!counter.expire(Instant::now() + Duration::from_secs(60)));
    }

    #[test]
    fn test_cache_entry_requires_payload() {
        assert!(CacheEntry::from_parts(Value::Null, json!("map")).is_none());
        let entry = CacheEntry::from_parts(json!("bundle"), Value::Null).unwrap();
        assert_eq!(entry.payload, json!("bundle"));
        assert!(entry.auxiliary.is_null());
    }

    #[test]
    fn test_allocate_id_is_monotonic() {
        let mut state = PoolState::new(Duration::from_secs(10));
        assert_eq!(state.allocate_id(), 1);
        assert_eq!(state.allocate_id(), 2);
        assert_eq!(state.allocate_id(), 3);
    }
}
