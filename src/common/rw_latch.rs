use std::sync::{Condvar, Mutex};

/// Reader/writer latch with explicit lock and unlock calls.
///
/// Unlike [`std::sync::RwLock`] there is no guard tied to a borrow, so a page
/// can be latched during a tree descent and released much later out of a
/// transaction's page set. Waiting writers block new readers, which keeps a
/// stream of readers from starving a structural change.
pub struct RwLatch {
    state: Mutex<LatchState>,
    state_changed: Condvar,
}

#[derive(Default)]
struct LatchState {
    /// Number of active readers, or -1 while a writer holds the latch.
    active: i32,
    waiting_writers: u32,
}

impl RwLatch {
    pub fn new() -> RwLatch {
        RwLatch {
            state: Mutex::new(LatchState::default()),
            state_changed: Condvar::new(),
        }
    }

    pub fn r_lock(&self) {
        let mut state = self.state.lock().expect("latch state poisoned");
        while state.active < 0 || state.waiting_writers > 0 {
            state = self
                .state_changed
                .wait(state)
                .expect("latch state poisoned");
        }
        state.active += 1;
    }

    pub fn r_unlock(&self) {
        let mut state = self.state.lock().expect("latch state poisoned");
        state.active -= 1;
        if state.active == 0 {
            self.state_changed.notify_all();
        }
    }

    pub fn w_lock(&self) {
        let mut state = self.state.lock().expect("latch state poisoned");
        state.waiting_writers += 1;
        while state.active != 0 {
            state = self
                .state_changed
                .wait(state)
                .expect("latch state poisoned");
        }
        state.waiting_writers -= 1;
        state.active = -1;
    }

    pub fn w_unlock(&self) {
        let mut state = self.state.lock().expect("latch state poisoned");
        state.active = 0;
        self.state_changed.notify_all();
    }
}

impl Default for RwLatch {
    fn default() -> RwLatch {
        RwLatch::new()
    }
}

#[cfg(test)]
mod rw_latch_tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::RwLatch;

    #[test]
    fn readers_share_the_latch() {
        let latch = RwLatch::new();
        latch.r_lock();
        latch.r_lock();
        latch.r_unlock();
        latch.r_unlock();
    }

    #[test]
    fn writer_excludes_readers() {
        let latch = Arc::new(RwLatch::new());
        let counter = Arc::new(AtomicU32::new(0));

        latch.w_lock();
        let reader = {
            let latch = latch.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                latch.r_lock();
                counter.fetch_add(1, Ordering::SeqCst);
                latch.r_unlock();
            })
        };
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        latch.w_unlock();
        reader.join().expect("reader thread panicked");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writers_are_serialized() {
        let latch = Arc::new(RwLatch::new());
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let latch = latch.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    latch.w_lock();
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                    latch.w_unlock();
                }
            }));
        }
        for handle in handles {
            handle.join().expect("writer thread panicked");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4000);
    }
}
