use std::collections::{BTreeSet, HashMap, VecDeque};

use log::trace;
use parking_lot::Mutex;

use crate::common::types::FrameId;

/// LRU-K page replacement policy.
///
/// Evicts the frame whose backward K-distance (time since the Kth most
/// recent access) is largest. Frames with fewer than K recorded accesses
/// have infinite distance and are preferred as victims, ordered by their
/// first access (classical LRU tiebreak).
pub struct LruKReplacer {
    k: usize,
    num_frames: usize,
    inner: Mutex<ReplacerInner>,
}

struct ReplacerInner {
    /// Logical clock; every recorded access gets the next tick
    clock: u64,
    entries: HashMap<FrameId, AccessEntry>,
    /// Frames with fewer than K accesses, in first-insertion order
    history_queue: VecDeque<FrameId>,
    /// Frames with K accesses, keyed by the oldest timestamp in the K-window
    cache_queue: BTreeSet<(u64, FrameId)>,
    evictable_count: usize,
}

struct AccessEntry {
    /// Last K access timestamps, oldest first
    history: VecDeque<u64>,
    evictable: bool,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            k,
            num_frames,
            inner: Mutex::new(ReplacerInner {
                clock: 0,
                entries: HashMap::new(),
                history_queue: VecDeque::new(),
                cache_queue: BTreeSet::new(),
                evictable_count: 0,
            }),
        }
    }

    /// Record an access to a frame at the current logical time.
    ///
    /// Panics if the frame id is outside `[0, num_frames)` - that is a bug
    /// in the calling buffer pool, not a recoverable condition.
    pub fn record_access(&self, frame_id: FrameId) {
        self.check_frame_id(frame_id);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.clock += 1;
        let now = inner.clock;

        let k = self.k;
        let entry = inner.entries.entry(frame_id).or_insert_with(|| AccessEntry {
            history: VecDeque::with_capacity(k),
            evictable: true,
        });
        let is_new = entry.history.is_empty();
        let was_cached = entry.history.len() == k;
        let old_window_start = entry.history.front().copied();

        entry.history.push_back(now);
        if entry.history.len() > k {
            entry.history.pop_front();
        }
        let reached_k = entry.history.len() == k;
        let new_window_start = entry.history.front().copied();
        let evictable = entry.evictable;

        if is_new {
            if evictable {
                inner.evictable_count += 1;
            }
            inner.history_queue.push_back(frame_id);
        }

        if reached_k {
            if was_cached {
                // Re-order within the cache pool under its new K-window
                inner
                    .cache_queue
                    .remove(&(old_window_start.unwrap(), frame_id));
            } else {
                // Promotion from the history pool
                inner.history_queue.retain(|&f| f != frame_id);
            }
            inner.cache_queue.insert((new_window_start.unwrap(), frame_id));
        }
    }

    /// Toggle whether a frame may be chosen as an eviction victim.
    /// Unknown frames are ignored.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        self.check_frame_id(frame_id);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.entries.get_mut(&frame_id) else {
            return;
        };
        match (entry.evictable, evictable) {
            (false, true) => {
                entry.evictable = true;
                inner.evictable_count += 1;
            }
            (true, false) => {
                entry.evictable = false;
                inner.evictable_count -= 1;
            }
            _ => {}
        }
    }

    /// Choose and remove the eviction victim: the first evictable frame of
    /// the history pool, else the frontmost evictable frame of the cache
    /// pool. Returns `None` when no frame is evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.evictable_count == 0 {
            return None;
        }

        let entries = &inner.entries;
        let victim = inner
            .history_queue
            .iter()
            .copied()
            .find(|f| entries[f].evictable)
            .or_else(|| {
                inner
                    .cache_queue
                    .iter()
                    .copied()
                    .find(|(_, f)| entries[f].evictable)
                    .map(|(_, f)| f)
            })?;

        Self::drop_frame(inner, victim);
        trace!("lru-k evicted frame {}", victim);
        Some(victim)
    }

    /// Drop all tracking state for a frame regardless of its K-distance.
    /// A no-op for untracked frames; panics if the frame is not evictable.
    pub fn remove(&self, frame_id: FrameId) {
        self.check_frame_id(frame_id);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.entries.get(&frame_id) else {
            return;
        };
        assert!(
            entry.evictable,
            "removed frame {} while it was not evictable",
            frame_id
        );
        Self::drop_frame(inner, frame_id);
    }

    /// Number of currently evictable frames
    pub fn size(&self) -> usize {
        self.inner.lock().evictable_count
    }

    fn drop_frame(inner: &mut ReplacerInner, frame_id: FrameId) {
        let entry = inner.entries.remove(&frame_id).expect("tracked frame");
        if entry.evictable {
            inner.evictable_count -= 1;
        }
        inner.history_queue.retain(|&f| f != frame_id);
        if let Some(&window_start) = entry.history.front() {
            inner.cache_queue.remove(&(window_start, frame_id));
        }
    }

    fn check_frame_id(&self, frame_id: FrameId) {
        assert!(
            frame_id < self.num_frames,
            "frame id {} out of range (pool size {})",
            frame_id,
            self.num_frames
        );
    }
}
