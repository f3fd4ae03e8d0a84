use parking_lot::{Condvar, Mutex};

/// Counting semaphore with strict arrival-order (FIFO) wakeup.
///
/// Two properties the standard library cannot offer here:
/// - `release()` may run on a different thread than the matching
///   `acquire()` (the `SharedMutex` resource permit is taken by the first
///   reader and dropped by the last one);
/// - waiters are served strictly in arrival order, which `SharedMutex`
///   relies on for writer fairness.
pub struct Semaphore {
    state: Mutex<SemState>,
    cv: Condvar,
}

struct SemState {
    /// Permits currently held.
    in_use: usize,
    /// Maximum concurrent permits.
    max: usize,
    /// Next ticket to hand out.
    next_ticket: u64,
    /// Ticket currently allowed to take a permit.
    now_serving: u64,
}

impl Semaphore {
    pub fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(SemState {
                in_use: 0,
                max,
                next_ticket: 0,
                now_serving: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Blocks until a permit is available and every earlier arrival has
    /// been served.
    pub fn acquire(&self) {
        let mut s = self.state.lock();
        let ticket = s.next_ticket;
        s.next_ticket += 1;
        while ticket != s.now_serving || s.in_use >= s.max {
            self.cv.wait(&mut s);
        }
        s.now_serving += 1;
        s.in_use += 1;
        // the next ticket holder may be admissible right away when
        // capacity remains
        if s.in_use < s.max {
            self.cv.notify_all();
        }
    }

    /// Takes a permit only if one is free and nobody is queued.
    pub fn try_acquire(&self) -> bool {
        let mut s = self.state.lock();
        if s.next_ticket != s.now_serving || s.in_use >= s.max {
            return false;
        }
        s.next_ticket += 1;
        s.now_serving += 1;
        s.in_use += 1;
        true
    }

    /// Returns a permit. May be called from any thread.
    pub fn release(&self) {
        let mut s = self.state.lock();
        debug_assert!(s.in_use > 0, "release without matching acquire");
        s.in_use -= 1;
        self.cv.notify_all();
    }

    /// RAII convenience for same-thread acquire/release pairs.
    pub fn access(&self) -> SemaphoreGuard<'_> {
        self.acquire();
        SemaphoreGuard { sem: self }
    }

    /// Number of permits currently held.
    pub fn count(&self) -> usize {
        self.state.lock().in_use
    }

    /// Maximum concurrent permits.
    pub fn max(&self) -> usize {
        self.state.lock().max
    }

    /// Changes the permit ceiling. Growing wakes waiters immediately;
    /// shrinking blocks until usage has drained below the new ceiling.
    pub fn set_max(&self, new_max: usize) {
        let mut s = self.state.lock();
        while s.in_use > new_max {
            self.cv.wait(&mut s);
        }
        s.max = new_max;
        self.cv.notify_all();
    }
}

/// Releases its permit on drop.
pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}
