use std::cmp::Reverse;

use priority_queue::PriorityQueue;

use super::buffer_pool::FrameId;

/// Orders the frames that are eligible for eviction. "Least recently used"
/// here means least recently made evictable: a frame that sat pinned for a
/// long stretch and is then released goes to the back of the line.
pub struct LruReplacer {
    // Saves each evictable frame with the tick at which it became evictable.
    current_frames: PriorityQueue<FrameId, Reverse<u64>>,
    next_tick: u64,
}

impl LruReplacer {
    /// Allocates a new LruReplacer with a given capacity.
    pub fn new(capacity: usize) -> LruReplacer {
        LruReplacer {
            current_frames: PriorityQueue::with_capacity(capacity),
            next_tick: 0,
        }
    }

    /// Returns the current number of evictable frames.
    pub fn current_size(&self) -> usize {
        self.current_frames.len()
    }

    /// Marks a frame as evictable. Re-adding a frame that is already tracked
    /// refreshes its position, so it becomes the youngest candidate again.
    pub fn add_frame(&mut self, frame_id: FrameId) {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.current_frames.push(frame_id, Reverse(tick));
    }

    /// Removes a frame from the evictable set, typically because it was
    /// re-pinned or deleted. Returns whether the frame was present.
    pub fn drop_frame(&mut self, frame_id: FrameId) -> bool {
        self.current_frames.remove(&frame_id).is_some()
    }

    pub fn drop_all_frames(&mut self) {
        self.current_frames.clear();
    }

    /// Removes and returns the frame that has been evictable the longest.
    /// If no frame is evictable, [None] is returned.
    pub fn pop_least_recently_used(&mut self) -> Option<FrameId> {
        self.current_frames.pop().map(|(frame_id, _)| frame_id)
    }
}

#[cfg(test)]
mod lru_tests {
    use super::LruReplacer;

    #[test]
    fn drop_nonexisting() {
        let mut lru_replacer = LruReplacer::new(10);

        assert!(!lru_replacer.drop_frame(0));
    }

    #[test]
    fn drop_existing() {
        let mut lru_replacer = LruReplacer::new(10);
        lru_replacer.add_frame(0);

        assert!(lru_replacer.drop_frame(0));
        assert_eq!(lru_replacer.current_size(), 0);
    }

    #[test]
    fn usual_get_victim() {
        let mut lru_replacer = LruReplacer::new(10);

        lru_replacer.add_frame(0);
        lru_replacer.add_frame(2);
        lru_replacer.add_frame(1);

        assert_eq!(lru_replacer.pop_least_recently_used(), Some(0));
        assert_eq!(lru_replacer.pop_least_recently_used(), Some(2));
        assert_eq!(lru_replacer.pop_least_recently_used(), Some(1));
        assert_eq!(lru_replacer.pop_least_recently_used(), None);
    }

    #[test]
    fn single_frame_is_its_own_victim() {
        let mut lru_replacer = LruReplacer::new(10);

        lru_replacer.add_frame(4);
        assert_eq!(lru_replacer.pop_least_recently_used(), Some(4));
    }

    #[test]
    fn re_adding_refreshes_position() {
        let mut lru_replacer = LruReplacer::new(10);

        lru_replacer.add_frame(0);
        lru_replacer.add_frame(1);
        lru_replacer.add_frame(0);

        assert_eq!(lru_replacer.pop_least_recently_used(), Some(1));
        assert_eq!(lru_replacer.pop_least_recently_used(), Some(0));
    }

    #[test]
    fn dropped_frame_is_never_a_victim() {
        let mut lru_replacer = LruReplacer::new(10);

        lru_replacer.add_frame(0);
        lru_replacer.add_frame(1);
        lru_replacer.add_frame(2);
        assert!(lru_replacer.drop_frame(1));

        assert_eq!(lru_replacer.pop_least_recently_used(), Some(0));
        assert_eq!(lru_replacer.pop_least_recently_used(), Some(2));
        assert_eq!(lru_replacer.pop_least_recently_used(), None);
    }
}
