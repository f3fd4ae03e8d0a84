use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::filedata::allocator::CachingAllocator;
use crate::filedata::bandwidth::BandwidthMeasure;
use crate::filedata::page_manager::{backend_io, PageManager};
use crate::sync::OrderedMap;

/// Lower bound on the bandwidth-driven dirty limit.
const DIRTY_LIMIT_FLOOR: u64 = 1024 * 1024;

/// Tunables for the cache. Sizes are bytes.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Size of pages handed to new files; the effective per-file value
    /// is rounded up to the filesystem chunk size.
    pub page_size: usize,

    /// Maximum total page memory before the cleanup thread evicts.
    /// Larger values cost memory but make multi-page readahead far more
    /// effective; even small values beat zero by a wide margin.
    pub memory_limit: u64,

    /// Fraction of `memory_limit` used as the eviction margin: cleanup
    /// starts within `memory_limit / evict_size_frac` of the limit.
    pub evict_size_frac: usize,

    /// Target transfer time for one flush; bandwidth measurement turns
    /// this into the dirty byte limit. Larger values coalesce more but
    /// risk losing more on a crash.
    pub max_dirty_time: Duration,

    /// Cap on a single readahead window as a fraction of `memory_limit`.
    pub read_max_cache_frac: usize,

    /// Process-wide bound on concurrent backend I/O operations.
    pub io_concurrency: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            page_size: 128 * 1024,
            memory_limit: 256 * 1024 * 1024,
            evict_size_frac: 16,
            max_dirty_time: Duration::from_secs(1),
            read_max_cache_frac: 4,
            io_concurrency: 4,
        }
    }
}

/// Point-in-time counters, mostly for tests and debugging.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub current_memory: u64,
    pub current_dirty: u64,
    pub dirty_limit: u64,
    pub resident_pages: usize,
    pub dirty_pages: usize,
}

/// A page's identity in the queues: (manager id, page index). Keying by
/// identity rather than address lets entries outlive the pages they
/// describe; a stale entry is detected when its manager fails to
/// upgrade.
type PageKey = (u64, u64);

#[derive(Clone)]
struct PageInfo {
    mgr: Weak<PageManager>,
    index: u64,
    size: usize,
}

struct CacheState {
    /// LRU by touch recency, oldest at the front.
    page_queue: OrderedMap<PageKey, PageInfo>,
    /// Same order, restricted to dirty pages.
    dirty_queue: OrderedMap<PageKey, PageInfo>,
    current_memory: u64,
    current_dirty: u64,
    /// Bandwidth-driven cap on dirty bytes; adapts every flush.
    dirty_limit: u64,
    /// Manager whose waiting informers must proceed because the cleanup
    /// thread needs that manager's write lock.
    skip_memory_wait: Option<u64>,
    run_cleanup: bool,
}

impl CacheState {
    #[cfg(debug_assertions)]
    fn audit(&self) {
        let mem: u64 = self.page_queue.iter().map(|(_, i)| i.size as u64).sum();
        let dirty: u64 = self.dirty_queue.iter().map(|(_, i)| i.size as u64).sum();
        assert_eq!(mem, self.current_memory, "memory tracking diverged");
        assert_eq!(dirty, self.current_dirty, "dirty tracking diverged");
    }

    #[cfg(not(debug_assertions))]
    fn audit(&self) {}

    fn remove_entry(&mut self, key: PageKey) {
        if let Some(info) = self.page_queue.erase(&key) {
            self.current_memory -= info.size as u64;
        }
        if let Some(info) = self.dirty_queue.erase(&key) {
            self.current_dirty -= info.size as u64;
        }
    }

    /// Rotates a problematic entry to the recently-used end so other
    /// victims are tried before it comes around again.
    fn touch(&mut self, key: PageKey) {
        if let Some(info) = self.page_queue.erase(&key) {
            self.page_queue.enqueue_back(key, info);
        }
        if let Some(info) = self.dirty_queue.erase(&key) {
            self.dirty_queue.enqueue_back(key, info);
        }
    }
}

struct CacheShared {
    options: CacheOptions,
    memory_margin: u64,
    state: Mutex<CacheState>,
    /// Wakes the cleanup thread.
    thread_cv: Condvar,
    /// Wakes informers blocked on the memory budget.
    memory_cv: Condvar,
}

/// Process-wide memory and dirty-byte budget over every open file's
/// pages, enforced by a background cleanup thread.
///
/// The manager holds only `(manager, index)` identities plus `Weak`
/// references; pages may vanish between any two of its operations, so
/// every dereference goes through `Weak::upgrade` (the scope-lock: an
/// upgrade failure means the manager is mid-destruction and the entry is
/// simply dropped).
pub struct CacheManager {
    shared: Arc<CacheShared>,
    allocator: Arc<CachingAllocator>,
    thread: Option<JoinHandle<()>>,
}

impl CacheManager {
    pub fn new(options: CacheOptions) -> Arc<Self> {
        if options.io_concurrency != backend_io().max() {
            backend_io().set_max(options.io_concurrency);
        }

        let memory_margin = options.memory_limit / options.evict_size_frac.max(1) as u64;
        let shared = Arc::new(CacheShared {
            options,
            memory_margin,
            state: Mutex::new(CacheState {
                page_queue: OrderedMap::new(),
                dirty_queue: OrderedMap::new(),
                current_memory: 0,
                current_dirty: 0,
                dirty_limit: DIRTY_LIMIT_FLOOR,
                skip_memory_wait: None,
                run_cleanup: true,
            }),
            thread_cv: Condvar::new(),
            memory_cv: Condvar::new(),
        });

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("cache-cleanup".into())
                .spawn(move || cleanup_loop(shared))
                .expect("spawn cache cleanup thread")
        };

        Arc::new(Self {
            shared,
            allocator: Arc::new(CachingAllocator::new()),
            thread: Some(thread),
        })
    }

    pub fn options(&self) -> &CacheOptions {
        &self.shared.options
    }

    pub(crate) fn allocator(&self) -> &Arc<CachingAllocator> {
        &self.allocator
    }

    pub fn stats(&self) -> CacheStats {
        let st = self.shared.state.lock();
        CacheStats {
            current_memory: st.current_memory,
            current_dirty: st.current_dirty,
            dirty_limit: st.dirty_limit,
            resident_pages: st.page_queue.len(),
            dirty_pages: st.dirty_queue.len(),
        }
    }

    /// Records a page touch (read, write or fetch), moving it to the
    /// recently-used end of the queues and updating the budgets.
    ///
    /// With `can_wait` set and the budgets exceeded by this insertion,
    /// blocks until the cleanup thread makes room. Exception: when
    /// cleanup has published this manager in `skip_memory_wait` it is
    /// waiting for a lock our caller holds, and we must get out of its
    /// way by returning.
    pub(crate) fn inform_page(
        &self,
        mgr: &Arc<PageManager>,
        index: u64,
        size: usize,
        dirty: bool,
        can_wait: bool,
    ) {
        let mgr_id = mgr.manager_id();
        let key = (mgr_id, index);
        let limit = self.shared.options.memory_limit;
        let info = PageInfo {
            mgr: Arc::downgrade(mgr),
            index,
            size,
        };

        let mut st = self.shared.state.lock();
        let old_size = st
            .page_queue
            .enqueue_back(key, info.clone())
            .map_or(0, |old| old.size);
        st.current_memory = st.current_memory - old_size as u64 + size as u64;

        if dirty {
            let old = st.dirty_queue.enqueue_back(key, info).map_or(0, |o| o.size);
            st.current_dirty = st.current_dirty - old as u64 + size as u64;
        } else if let Some(old) = st.dirty_queue.erase(&key) {
            st.current_dirty -= old.size as u64;
        }
        st.audit();
        trace!(
            mgr = mgr_id,
            index,
            memory = st.current_memory,
            dirty_bytes = st.current_dirty,
            "page informed"
        );

        if st.current_memory > limit || st.current_dirty > st.dirty_limit {
            self.shared.thread_cv.notify_one();
        }

        if can_wait && size > old_size {
            while st.run_cleanup
                && st.skip_memory_wait != Some(mgr_id)
                && (st.current_memory > limit || (dirty && st.current_dirty > st.dirty_limit))
            {
                self.shared.memory_cv.wait(&mut st);
            }
        }
    }

    /// Updates a page's size in both queues without changing position.
    pub(crate) fn resize_page(&self, mgr_id: u64, index: u64, new_size: usize) {
        let key = (mgr_id, index);
        let mut st = self.shared.state.lock();
        if let Some(info) = st.page_queue.get_mut(&key) {
            let old = info.size;
            info.size = new_size;
            st.current_memory = st.current_memory - old as u64 + new_size as u64;
        }
        if let Some(info) = st.dirty_queue.get_mut(&key) {
            let old = info.size;
            info.size = new_size;
            st.current_dirty = st.current_dirty - old as u64 + new_size as u64;
        }
        st.audit();
    }

    /// Drops a page from both queues (evicted, truncated away, or its
    /// file closed).
    pub(crate) fn remove_page(&self, mgr_id: u64, index: u64) {
        let mut st = self.shared.state.lock();
        st.remove_entry((mgr_id, index));
        st.audit();
        self.shared.memory_cv.notify_all();
    }

    /// Drops a page from the dirty queue only (flushed but resident).
    pub(crate) fn remove_dirty(&self, mgr_id: u64, index: u64) {
        let mut st = self.shared.state.lock();
        if let Some(info) = st.dirty_queue.erase(&(mgr_id, index)) {
            st.current_dirty -= info.size as u64;
        }
        st.audit();
        self.shared.memory_cv.notify_all();
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock();
            st.run_cleanup = false;
        }
        self.shared.thread_cv.notify_all();
        self.shared.memory_cv.notify_all();
        if let Some(handle) = self.thread.take() {
            // the last reference can die on the cleanup thread itself
            // (it holds manager Arcs transiently); joining would then
            // self-deadlock, and the thread exits on its own anyway
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// The background loop: wait until a budget is exceeded, then evict from
/// the cold end of the page queue and flush from the cold end of the
/// dirty queue, one page per pass.
///
/// The cache lock is never held across an evict or flush: taking a
/// manager's data lock means queueing behind its user threads, and those
/// threads call back into `inform_page`.
fn cleanup_loop(shared: Arc<CacheShared>) {
    let mut bandwidth = BandwidthMeasure::new(shared.options.max_dirty_time);
    let limit = shared.options.memory_limit;
    let margin = shared.memory_margin;

    loop {
        let mut victim: Option<(Arc<PageManager>, u64)> = None;
        {
            let mut st = shared.state.lock();
            while st.run_cleanup
                && st.current_dirty <= st.dirty_limit
                && st.current_memory + margin <= limit
            {
                shared.thread_cv.wait(&mut st);
            }
            if !st.run_cleanup {
                break;
            }

            while victim.is_none() && st.current_memory + margin > limit {
                let Some((&key, info)) = st.page_queue.front() else {
                    break;
                };
                match info.mgr.upgrade() {
                    None => {
                        // manager mid-destruction; entry is stale
                        st.remove_entry(key);
                    }
                    Some(mgr) => {
                        let index = info.index;
                        // informers on this manager may hold the lock we
                        // are about to take: release them
                        st.skip_memory_wait = Some(key.0);
                        shared.memory_cv.notify_all();
                        victim = Some((mgr, index));
                    }
                }
            }
        }

        if let Some((mgr, index)) = victim {
            debug!(mgr = mgr.manager_id(), index, "cleanup: evicting");
            let key = (mgr.manager_id(), index);
            let lock = mgr.write_lock();
            shared.state.lock().skip_memory_wait = None;
            let result = mgr.evict_page(index, &lock);
            drop(lock);

            let mut st = shared.state.lock();
            if let Err(e) = result {
                // page stays resident and dirty; rotate it so other
                // victims get tried before the retry
                warn!(mgr = key.0, index, error = %e, "background eviction failed");
                st.touch(key);
            }
            shared.memory_cv.notify_all();
        }

        let mut flush: Option<(Arc<PageManager>, u64)> = None;
        {
            let mut st = shared.state.lock();
            while flush.is_none() && st.current_dirty > st.dirty_limit {
                let Some((&key, info)) = st.dirty_queue.front() else {
                    break;
                };
                match info.mgr.upgrade() {
                    None => {
                        st.remove_entry(key);
                    }
                    Some(mgr) => {
                        let index = info.index;
                        st.skip_memory_wait = Some(key.0);
                        shared.memory_cv.notify_all();
                        flush = Some((mgr, index));
                    }
                }
            }
        }

        if let Some((mgr, index)) = flush {
            debug!(mgr = mgr.manager_id(), index, "cleanup: flushing");
            let key = (mgr.manager_id(), index);
            // flush only needs read consistency; priority mode because
            // this thread must not queue behind the very writers that
            // are waiting on the dirty budget
            let lock = mgr.read_priority_lock();
            shared.state.lock().skip_memory_wait = None;
            let started = Instant::now();
            let result = mgr.flush_page(index, &lock);
            drop(lock);

            let mut st = shared.state.lock();
            match result {
                Ok(written) => {
                    let target = bandwidth.update(written, started.elapsed());
                    st.dirty_limit = target.max(DIRTY_LIMIT_FLOOR);
                    trace!(dirty_limit = st.dirty_limit, "dirty limit adapted");
                }
                Err(e) => {
                    warn!(mgr = key.0, index, error = %e, "background flush failed");
                    st.touch(key);
                }
            }
            shared.memory_cv.notify_all();
        }
    }
    debug!("cache cleanup thread exiting");
}
