use parking_lot::Mutex;

use crate::sync::semaphore::Semaphore;

/// Reader/writer mutex with both a fair-queued and a readers-priority
/// entry point, unlike the standard shared locks which leave the policy
/// to the OS.
///
/// Construction: writers take `queue` then `resource`; normal readers
/// take `queue`, bump the reader count and take `resource` only on the
/// 0→1 transition; priority readers skip `queue` entirely and race
/// directly for the reader-count transition.
///
/// The priority mode exists for one caller: a worker spawned from inside
/// a shared-mode holder (a readahead thread spawned mid-read). If that
/// worker queued fairly behind a waiting writer, the spawning reader
/// could never release and the writer could never run.
///
/// One quirk carried over from the construction: when the queue is all
/// writers, a priority reader skips to second place rather than first,
/// because the writer at the head of the queue is already waiting on
/// `resource` rather than `queue`.
pub struct SharedMutex {
    /// Current count of shared holders.
    readers: Mutex<usize>,
    /// Held for the whole write, or by the reader group (taken on 0→1,
    /// dropped on 1→0). A semaphore because the release can happen on a
    /// different thread than the acquire.
    resource: Semaphore,
    /// FIFO turnstile preserving arrival order of fair acquires.
    queue: Semaphore,
}

impl SharedMutex {
    pub fn new() -> Self {
        Self {
            readers: Mutex::new(0),
            resource: Semaphore::new(1),
            queue: Semaphore::new(1),
        }
    }

    /// Exclusive write lock, fair-queued.
    pub fn lock_write(&self) -> SharedLockW<'_> {
        self.queue.acquire();
        self.resource.acquire();
        self.queue.release();
        SharedLockW { mutex: self }
    }

    /// Exclusive write lock without blocking.
    pub fn try_lock_write(&self) -> Option<SharedLockW<'_>> {
        if !self.queue.try_acquire() {
            return None;
        }
        let got = self.resource.try_acquire();
        self.queue.release();
        if got {
            Some(SharedLockW { mutex: self })
        } else {
            None
        }
    }

    /// Shared read lock, fair-queued.
    pub fn lock_read(&self) -> SharedLockR<'_> {
        self.queue.acquire();
        self.enter_shared();
        self.queue.release();
        SharedLockR { mutex: self }
    }

    /// Shared read lock that skips the fairness queue. Only for helpers
    /// spawned from inside another shared-mode holder.
    pub fn lock_read_priority(&self) -> SharedLockRP<'_> {
        self.enter_shared();
        SharedLockRP { mutex: self }
    }

    fn enter_shared(&self) {
        let mut readers = self.readers.lock();
        *readers += 1;
        if *readers == 1 {
            self.resource.acquire();
        }
    }

    fn exit_shared(&self) {
        let mut readers = self.readers.lock();
        debug_assert!(*readers > 0);
        *readers -= 1;
        if *readers == 0 {
            self.resource.release();
        }
    }
}

impl Default for SharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability marker for operations that require any shared read lock,
/// fair or priority.
pub trait ReadLock: sealed::Sealed {}

mod sealed {
    pub trait Sealed {}
}

/// RAII shared read lock (fair).
#[must_use]
pub struct SharedLockR<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for SharedLockR<'_> {
    fn drop(&mut self) {
        self.mutex.exit_shared();
    }
}

impl sealed::Sealed for SharedLockR<'_> {}
impl ReadLock for SharedLockR<'_> {}

/// RAII shared read lock (priority, queue-skipping).
#[must_use]
pub struct SharedLockRP<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for SharedLockRP<'_> {
    fn drop(&mut self) {
        self.mutex.exit_shared();
    }
}

impl sealed::Sealed for SharedLockRP<'_> {}
impl ReadLock for SharedLockRP<'_> {}

/// RAII exclusive write lock.
#[must_use]
pub struct SharedLockW<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for SharedLockW<'_> {
    fn drop(&mut self) {
        self.mutex.resource.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_multiple_readers() {
        let m = Arc::new(SharedMutex::new());
        let r1 = m.lock_read();
        let r2 = m.lock_read();
        assert!(m.try_lock_write().is_none());
        drop(r1);
        assert!(m.try_lock_write().is_none());
        drop(r2);
        assert!(m.try_lock_write().is_some());
    }

    #[test]
    fn test_writer_excludes_readers() {
        let m = Arc::new(SharedMutex::new());
        let w = m.lock_write();

        let m2 = Arc::clone(&m);
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = Arc::clone(&done);
        let h = thread::spawn(move || {
            let _r = m2.lock_read();
            done2.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(done.load(Ordering::SeqCst), 0);

        drop(w);
        h.join().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_writers_run_in_arrival_order() {
        let m = Arc::new(SharedMutex::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = m.lock_write();

        let mut handles = Vec::new();
        for i in 0..3 {
            let m = Arc::clone(&m);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let _w = m.lock_write();
                order.lock().push(i);
            }));
            thread::sleep(Duration::from_millis(50));
        }

        drop(gate);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    /// The scenario the priority mode exists for: reader R holds shared,
    /// writer W queues, then a helper spawned by R needs shared access.
    /// A fair acquire would park the helper behind W forever.
    #[test]
    fn test_priority_reader_bypasses_queued_writer() {
        let m = Arc::new(SharedMutex::new());
        let r = m.lock_read();

        let m2 = Arc::clone(&m);
        let writer = thread::spawn(move || {
            let _w = m2.lock_write();
        });
        thread::sleep(Duration::from_millis(50)); // let W reach the queue

        // helper: must get shared access immediately despite W waiting
        let helper_done = Arc::new(AtomicUsize::new(0));
        let helper_done2 = Arc::clone(&helper_done);
        let m3 = Arc::clone(&m);
        let helper = thread::spawn(move || {
            let _p = m3.lock_read_priority();
            helper_done2.fetch_add(1, Ordering::SeqCst);
        });
        helper.join().unwrap();
        assert_eq!(helper_done.load(Ordering::SeqCst), 1);

        drop(r);
        writer.join().unwrap();
    }

    #[test]
    fn test_reader_group_coalesces() {
        // while one fair reader holds the lock, further fair readers get
        // in without waiting for the resource
        let m = Arc::new(SharedMutex::new());
        let _r1 = m.lock_read();
        let start = std::time::Instant::now();
        let _r2 = m.lock_read();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_concurrent_stress() {
        let m = Arc::new(SharedMutex::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for i in 0..8 {
            let m = Arc::clone(&m);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    if i % 2 == 0 {
                        let _r = m.lock_read();
                        counter.load(Ordering::SeqCst);
                    } else {
                        let _w = m.lock_write();
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4 * 200);
    }
}
