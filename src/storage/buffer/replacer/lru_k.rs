use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::common::types::FrameId;

/// Per-frame access record: up to K most recent access timestamps.
#[derive(Debug, Clone)]
struct FrameRecord {
    history: VecDeque<u64>,
    valid: bool,
    evictable: bool,
}

impl FrameRecord {
    fn new(k: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(k),
            valid: false,
            evictable: false,
        }
    }

    /// A frame is full once K accesses have been recorded; frames with fewer
    /// samples have effectively infinite backward K-distance.
    fn full(&self, k: usize) -> bool {
        self.history.len() >= k
    }

    /// Oldest retained timestamp: the K-th most recent access for full
    /// frames, the earliest recorded access otherwise.
    fn timestamp(&self) -> u64 {
        *self.history.front().expect("accessed frame has history")
    }

    fn reset(&mut self) {
        self.history.clear();
        self.valid = false;
        self.evictable = false;
    }
}

struct ReplacerState {
    frames: Vec<FrameRecord>,
    current_timestamp: u64,
    evictable_count: usize,
}

/// Backward K-distance page replacement policy.
///
/// Among evictable frames, any frame with fewer than K recorded accesses
/// beats any frame with K of them; within a class the frame whose oldest
/// retained access is smallest is the victim.
pub struct LruKReplacer {
    k: usize,
    num_frames: usize,
    state: Mutex<ReplacerState>,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k > 0, "k must be positive");
        Self {
            k,
            num_frames,
            state: Mutex::new(ReplacerState {
                frames: vec![FrameRecord::new(k); num_frames],
                current_timestamp: 0,
                evictable_count: 0,
            }),
        }
    }

    /// Pick and remove the eviction victim, or return None when no frame is
    /// evictable. The victim's access history is cleared.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();
        let mut victim: Option<usize> = None;
        for i in 0..self.num_frames {
            if !state.frames[i].evictable {
                continue;
            }
            victim = match victim {
                None => Some(i),
                Some(v) if self.comes_before(&state.frames[i], &state.frames[v]) => Some(i),
                keep => keep,
            };
        }
        let v = victim?;
        state.frames[v].reset();
        state.evictable_count -= 1;
        Some(v as FrameId)
    }

    fn comes_before(&self, a: &FrameRecord, b: &FrameRecord) -> bool {
        if a.full(self.k) == b.full(self.k) {
            a.timestamp() < b.timestamp()
        } else {
            !a.full(self.k)
        }
    }

    /// Record an access to the frame, marking it valid and evictable on its
    /// first access.
    pub fn record_access(&self, frame_id: FrameId) {
        assert!((frame_id as usize) < self.num_frames, "frame id out of range");
        let mut state = self.state.lock();
        let ts = state.current_timestamp;
        state.current_timestamp += 1;
        if !state.frames[frame_id as usize].valid {
            state.frames[frame_id as usize].valid = true;
            state.frames[frame_id as usize].evictable = true;
            state.evictable_count += 1;
        }
        let k = self.k;
        let frame = &mut state.frames[frame_id as usize];
        frame.history.push_back(ts);
        if frame.history.len() > k {
            frame.history.pop_front();
        }
    }

    /// Toggle evictability. No-op on frames that were never accessed.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        assert!((frame_id as usize) < self.num_frames, "frame id out of range");
        let mut state = self.state.lock();
        let frame = &mut state.frames[frame_id as usize];
        if !frame.valid {
            return;
        }
        if frame.evictable != evictable {
            frame.evictable = evictable;
            if evictable {
                state.evictable_count += 1;
            } else {
                state.evictable_count -= 1;
            }
        }
    }

    /// Forcibly drop a frame from the replacer, clearing its history. The
    /// frame must be evictable.
    pub fn remove(&self, frame_id: FrameId) {
        if frame_id as usize >= self.num_frames {
            return;
        }
        let mut state = self.state.lock();
        let frame = &mut state.frames[frame_id as usize];
        if !frame.valid {
            return;
        }
        assert!(frame.evictable, "cannot remove a non-evictable frame");
        frame.reset();
        state.evictable_count -= 1;
    }

    /// Number of evictable frames
    pub fn size(&self) -> usize {
        self.state.lock().evictable_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evict_prefers_infinite_k_distance() {
        let replacer = LruKReplacer::new(8, 2);
        // Access order: 1, 2, 3, 1, 2. Frame 3 has a single sample, frames
        // 1 and 2 are full with oldest timestamps 0 and 1.
        for frame in [1, 2, 3, 1, 2] {
            replacer.record_access(frame);
        }
        assert_eq!(replacer.size(), 3);
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_set_evictable_guards_frames() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(0, false);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);
        replacer.set_evictable(0, true);
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn test_set_evictable_ignores_unknown_frame() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.set_evictable(3, true);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_remove_clears_history() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(2);
        replacer.record_access(2);
        replacer.remove(2);
        assert_eq!(replacer.size(), 0);
        // A fresh access starts a new history rather than extending the old
        replacer.record_access(2);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(2));
    }

    #[test]
    fn test_history_keeps_k_most_recent() {
        let replacer = LruKReplacer::new(4, 2);
        // Frame 0 accessed three times: its K-th most recent access is newer
        // than frame 1's, so frame 1 goes first.
        replacer.record_access(0);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.record_access(1);
        replacer.record_access(0);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(0));
    }
}
