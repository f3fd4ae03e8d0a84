use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{FsError, Result};
use crate::filedata::allocator::CachingAllocator;
use crate::filedata::cache_manager::CacheManager;
use crate::filedata::page::Page;
use crate::filedata::page_backend::PageBackend;
use crate::filesystem::fs_config::WriteMode;
use crate::sync::{ReadLock, Semaphore, SharedLockR, SharedLockRP, SharedLockW, SharedMutex};

/// Process-wide bound on concurrent backend I/O, so a readahead storm
/// cannot exhaust the transport's connection pool.
static BACKEND_IO: Lazy<Semaphore> = Lazy::new(|| Semaphore::new(4));

pub(crate) fn backend_io() -> &'static Semaphore {
    &BACKEND_IO
}

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Initial readahead window, in pages.
const FETCH_SIZE_START: usize = 4;
/// Sanity ceiling on the readahead window, in pages.
const FETCH_SIZE_MAX: usize = 256;

/// Per-file core of the cache: owns the page map, dispatches readahead,
/// serves reader/writer requests and carries out eviction and flush
/// requests from the [`CacheManager`].
///
/// Locking: `state` (the pages mutex) protects the map structure and the
/// pending-fetch set for brief critical sections; `data_mutex` guards
/// page *content* and must be held (shared for reads and flushes,
/// exclusive for writes, eviction, truncate and remote reconciliation)
/// across every operation, passed in as a guard parameter.
///
/// The data mutex must offer a reader-priority mode: `read_page` under a
/// shared lock spawns a background fetch thread which also takes a
/// shared lock for the duration of the readahead. If a writer queued in
/// between, a fair acquire would deadlock the fetch behind the writer
/// and the writer behind the original reader.
pub struct PageManager {
    id: u64,
    page_size: usize,
    write_mode: WriteMode,
    read_only: bool,
    /// Cap on one readahead window, derived from the cache budget.
    max_fetch_pages: usize,
    state: Mutex<PageState>,
    pages_cv: Condvar,
    data_mutex: SharedMutex,
    backend: PageBackend,
    cache: Arc<CacheManager>,
    alloc: Arc<CachingAllocator>,
    deleted: AtomicBool,
}

struct PageState {
    pages: BTreeMap<u64, Page>,
    /// Disjoint (start index, page count) ranges being fetched.
    pending: Vec<(u64, usize)>,
    /// Size advertised to userspace, including unflushed dirty writes.
    file_size: u64,
    /// Current adaptive readahead window, in pages.
    fetch_size: usize,
    /// Error parked by a failed fetch for the thread waiting on it.
    fetch_error: Option<FsError>,
}

fn is_pending(pending: &[(u64, usize)], index: u64) -> bool {
    pending
        .iter()
        .any(|&(s, c)| index >= s && index < s + c as u64)
}

/// Pages complete in order from the front of their range.
fn remove_pending(pending: &mut Vec<(u64, usize)>, index: u64) -> bool {
    for i in 0..pending.len() {
        let (s, c) = pending[i];
        if s == index {
            if c <= 1 {
                pending.remove(i);
            } else {
                pending[i] = (s + 1, c - 1);
            }
            return true;
        }
    }
    false
}

/// Drops whatever is left of the range that started at `index`.
fn remove_pending_range(pending: &mut Vec<(u64, usize)>, index: u64, count: usize) {
    pending.retain(|&(s, _)| s < index || s >= index + count as u64);
}

impl PageManager {
    pub fn new(
        backend: PageBackend,
        cache: Arc<CacheManager>,
        file_size: u64,
        page_size: usize,
        write_mode: WriteMode,
        read_only: bool,
    ) -> Arc<Self> {
        let options = cache.options();
        let max_fetch_bytes = options.memory_limit / options.read_max_cache_frac as u64;
        let max_fetch_pages =
            ((max_fetch_bytes / page_size as u64) as usize).clamp(1, FETCH_SIZE_MAX);
        let alloc = Arc::clone(cache.allocator());

        Arc::new(Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            page_size,
            write_mode,
            read_only,
            max_fetch_pages,
            state: Mutex::new(PageState {
                pages: BTreeMap::new(),
                pending: Vec::new(),
                file_size,
                fetch_size: FETCH_SIZE_START,
                fetch_error: None,
            }),
            pages_cv: Condvar::new(),
            data_mutex: SharedMutex::new(),
            backend,
            cache,
            alloc,
            deleted: AtomicBool::new(false),
        })
    }

    pub(crate) fn manager_id(&self) -> u64 {
        self.id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Size including dirty writes not yet on the backend.
    pub fn file_size(&self) -> u64 {
        self.state.lock().file_size
    }

    /// Size the backend has confirmed.
    pub fn backend_size(&self) -> u64 {
        self.backend.backend_size()
    }

    pub fn is_dirty(&self, index: u64) -> bool {
        self.state
            .lock()
            .pages
            .get(&index)
            .is_some_and(|p| p.is_dirty())
    }

    pub(crate) fn page_backend(&self) -> &PageBackend {
        &self.backend
    }

    /// Stops the drop-time flush; used when the file has been deleted.
    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn read_lock(&self) -> SharedLockR<'_> {
        self.data_mutex.lock_read()
    }

    pub fn write_lock(&self) -> SharedLockW<'_> {
        self.data_mutex.lock_write()
    }

    /// Queue-skipping shared lock for the cleanup thread's flushes.
    pub fn read_priority_lock(&self) -> SharedLockRP<'_> {
        self.data_mutex.lock_read_priority()
    }

    /// Fills `buf` with the bytes at `[index·pageSize + offset ..)`.
    /// Blocks on backend I/O on a miss; readahead may be scheduled.
    pub fn read_page(
        self: &Arc<Self>,
        buf: &mut [u8],
        index: u64,
        offset: usize,
        _lock: &impl ReadLock,
    ) -> Result<()> {
        debug_assert!(offset + buf.len() <= self.page_size);

        let mut st = self.state.lock();
        let mut dispatched = false;
        loop {
            if let Some(page) = st.pages.get(&index) {
                buf.copy_from_slice(&page.data()[offset..offset + buf.len()]);
                let (size, dirty) = (page.size(), page.is_dirty());
                drop(st);
                self.cache.inform_page(self, index, size, dirty, true);
                return Ok(());
            }
            if !is_pending(&st.pending, index) {
                if dispatched {
                    // our fetch died without delivering the page
                    return Err(st
                        .fetch_error
                        .take()
                        .unwrap_or_else(|| FsError::Transport("page fetch failed".into())));
                }
                st.fetch_error = None;
                let count = self.fetch_window(&st, index);
                debug!(mgr = self.id, index, count, "page miss, scheduling fetch");
                st.pending.push((index, count));
                self.spawn_fetch(index, count);
                dispatched = true;
            }
            self.pages_cv.wait(&mut st);
        }
    }

    /// Writes `buf` at `[index·pageSize + offset ..)`, marking the page
    /// dirty and growing the advertised file size as needed. Interior
    /// pages between the previous end of file and this index are padded
    /// to full size.
    pub fn write_page(
        self: &Arc<Self>,
        buf: &[u8],
        index: u64,
        offset: usize,
        _lock: &SharedLockW<'_>,
    ) -> Result<()> {
        debug_assert!(offset + buf.len() <= self.page_size);
        if self.read_only {
            return Err(FsError::ReadOnly("filesystem is read-only".into()));
        }

        let ps = self.page_size as u64;
        let page_start = index * ps;
        let mut st = self.state.lock();

        match self.write_mode {
            WriteMode::None => {
                return Err(FsError::WriteType("filesystem does not allow writes".into()))
            }
            WriteMode::Append => {
                // legal iff appending exactly at a page boundary, or
                // extending a page that is already dirty
                let byte_off = page_start + offset as u64;
                let page_dirty = st.pages.get(&index).is_some_and(|p| p.is_dirty());
                if !(byte_off == st.file_size && byte_off % ps == 0) && !page_dirty {
                    return Err(FsError::WriteType("append-only filesystem".into()));
                }
            }
            WriteMode::Random => {}
        }

        st.file_size = st.file_size.max(page_start + (offset + buf.len()) as u64);
        let expected = (st.file_size - page_start).min(ps) as usize;

        let mut resized: Vec<u64> = Vec::new();
        let mut dispatched = false;
        loop {
            if st.pages.contains_key(&index) {
                break;
            }
            if is_pending(&st.pending, index) {
                self.pages_cv.wait(&mut st);
                continue;
            }
            if dispatched {
                return Err(st
                    .fetch_error
                    .take()
                    .unwrap_or_else(|| FsError::Transport("page fetch failed".into())));
            }
            let backend_size = self.backend.backend_size();
            if backend_size > page_start && (offset != 0 || buf.len() < expected) {
                // partial overwrite of a page the backend already has:
                // bring it in first. The fetch runs without taking the
                // data mutex; our exclusive lock covers it.
                debug!(mgr = self.id, index, "partial write, fetching single page");
                st.fetch_error = None;
                st.pending.push((index, 1));
                self.spawn_fetch(index, 1);
                dispatched = true;
                continue;
            }
            // brand new page: grow undersized predecessors back to the
            // old end of file so the run of pages between it and this
            // write stays contiguous and correctly sized
            for cur in backend_size / ps..index {
                if let Some(page) = st.pages.get_mut(&cur) {
                    if page.size() != self.page_size {
                        page.resize(self.page_size);
                        resized.push(cur);
                    }
                }
            }
            st.pages
                .insert(index, Page::from_buffer(self.alloc.alloc(expected)));
            break;
        }

        let page = st.pages.get_mut(&index).expect("present or created above");
        page.resize(expected);
        page.data_mut()[offset..offset + buf.len()].copy_from_slice(buf);
        page.set_dirty(true);
        let size = page.size();
        drop(st);

        for idx in resized {
            self.cache.resize_page(self.id, idx, self.page_size);
        }
        self.cache.inform_page(self, index, size, true, true);
        Ok(())
    }

    /// Removes the page, flushing it first if dirty. On flush failure
    /// the page stays resident and the error propagates.
    pub fn evict_page(&self, index: u64, _lock: &SharedLockW<'_>) -> Result<()> {
        let dirty = {
            let st = self.state.lock();
            match st.pages.get(&index) {
                Some(page) => page.is_dirty(),
                None => return Ok(()),
            }
        };
        if dirty {
            self.flush_run_containing(index)?;
        }

        let mut st = self.state.lock();
        if let Some(page) = st.pages.remove(&index) {
            drop(st);
            debug!(mgr = self.id, index, "evicted page");
            self.cache.remove_page(self.id, index);
            self.alloc.recycle(page.into_buffer());
        }
        Ok(())
    }

    /// Flushes the page if dirty, coalesced with the contiguous dirty
    /// run containing it. Returns the bytes written, which feeds the
    /// cache manager's bandwidth estimate.
    pub fn flush_page(&self, index: u64, _lock: &impl ReadLock) -> Result<u64> {
        self.flush_run_containing(index)
    }

    /// Writes back every dirty page, grouped into maximal contiguous
    /// runs. With `nothrow` set, per-run failures are logged and
    /// swallowed.
    pub fn flush_all(&self, _lock: &impl ReadLock, nothrow: bool) -> Result<()> {
        let run_starts: Vec<u64> = {
            let st = self.state.lock();
            let mut starts = Vec::new();
            let mut last_dirty: Option<u64> = None;
            for (&i, page) in st.pages.iter() {
                if page.is_dirty() {
                    if last_dirty.is_none() || i.checked_sub(1) != last_dirty {
                        starts.push(i);
                    }
                    last_dirty = Some(i);
                }
            }
            starts
        };

        for start in run_starts {
            match self.flush_run_containing(start) {
                Ok(_) => {}
                Err(e) if nothrow => {
                    warn!(mgr = self.id, start, error = %e, "ignoring flush failure")
                }
                Err(e) => return Err(e),
            }
        }

        // an fsync of a never-flushed file must still create the object
        if !self.backend.exists() {
            match self.backend.flush_create() {
                Ok(_) => {}
                Err(e) if nothrow => {
                    warn!(mgr = self.id, error = %e, "ignoring create failure")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Sends the truncation to the backend first (so failures leave the
    /// cache untouched), then drops pages past the new end, resizes a
    /// straddling page, and discards outstanding fetches.
    pub fn truncate(&self, new_size: u64, _lock: &SharedLockW<'_>) -> Result<()> {
        debug!(mgr = self.id, new_size, "truncate");
        self.backend.truncate(new_size)?;

        let ps = self.page_size as u64;
        let mut st = self.state.lock();
        st.pending.clear();
        st.file_size = new_size;

        let mut removed: Vec<(u64, Page)> = Vec::new();
        let mut straddler = None;
        if new_size == 0 {
            removed.extend(std::mem::take(&mut st.pages));
        } else {
            let last_keep = (new_size - 1) / ps;
            removed.extend(st.pages.split_off(&(last_keep + 1)));
            if let Some(page) = st.pages.get_mut(&last_keep) {
                let keep = (new_size - last_keep * ps) as usize;
                if page.size() > keep {
                    page.resize(keep);
                    straddler = Some((last_keep, keep));
                }
            }
        }
        drop(st);

        for (i, page) in removed {
            self.cache.remove_page(self.id, i);
            self.alloc.recycle(page.into_buffer());
        }
        if let Some((i, size)) = straddler {
            self.cache.resize_page(self.id, i, size);
        }
        Ok(())
    }

    /// Reconciles with a size observed on the backend: every non-dirty
    /// page is dropped (its content may be stale), dirty pages are kept
    /// and the advertised size covers whichever is larger.
    pub fn remote_changed(&self, backend_size: u64, _lock: &SharedLockW<'_>) {
        debug!(mgr = self.id, backend_size, "remote size change");
        let ps = self.page_size as u64;
        let mut st = self.state.lock();
        st.pending.clear();

        let mut removed: Vec<(u64, Page)> = Vec::new();
        let mut max_dirty = 0u64;
        let indices: Vec<u64> = st.pages.keys().copied().collect();
        for i in indices {
            if st.pages[&i].is_dirty() {
                max_dirty = max_dirty.max(i * ps + st.pages[&i].size() as u64);
            } else {
                let page = st.pages.remove(&i).expect("listed above");
                removed.push((i, page));
            }
        }
        st.file_size = backend_size.max(max_dirty);
        drop(st);

        self.backend.set_remote_size(backend_size);
        for (i, page) in removed {
            self.cache.remove_page(self.id, i);
            self.alloc.recycle(page.into_buffer());
        }
    }

    /// Readahead window for a miss at `index`: bounded by the adaptive
    /// window, the cache budget, the last page the backend holds, the
    /// next resident page and the next pending range.
    fn fetch_window(&self, st: &PageState, index: u64) -> usize {
        let ps = self.page_size as u64;
        let backend_size = self.backend.backend_size();

        // past the last page the backend holds: the page is materialized
        // locally from zeros, nothing worth prefetching
        if backend_size == 0 || index > (backend_size - 1) / ps {
            return 1;
        }
        let last_valid = (backend_size - 1) / ps;

        let mut count = st
            .fetch_size
            .min(self.max_fetch_pages)
            .min((last_valid - index + 1) as usize);

        if let Some((&next, _)) = st.pages.range(index + 1..).next() {
            count = count.min((next - index) as usize);
        }
        for i in 1..count as u64 {
            if is_pending(&st.pending, index + i) {
                count = i as usize;
                break;
            }
        }
        count.max(1)
    }

    fn spawn_fetch(self: &Arc<Self>, index: u64, count: usize) {
        let mgr = Arc::clone(self);
        std::thread::spawn(move || mgr.fetch_worker(index, count));
    }

    /// Background fetch: reads `count` pages starting at `index` and
    /// publishes them one at a time. Results for indices no longer
    /// pending (truncate or remote reconciliation ran) are discarded.
    fn fetch_worker(self: Arc<Self>, index: u64, count: usize) {
        let _permit = BACKEND_IO.access();
        // multi-page fetches hold their own shared lock for the whole
        // readahead; a single-page fetch is covered by its waiter's lock
        let _data_lock = (count > 1).then(|| self.data_mutex.lock_read_priority());

        let file_size = self.state.lock().file_size;
        let started = Instant::now();
        let alloc = Arc::clone(&self.alloc);

        let result = self
            .backend
            .fetch_pages(index, count, file_size, &alloc, &mut |idx, page| {
                let size = page.size();
                let mut st = self.state.lock();
                if remove_pending(&mut st.pending, idx) {
                    st.pages.insert(idx, page);
                    drop(st);
                    self.cache.inform_page(&self, idx, size, false, false);
                } else {
                    drop(st);
                    debug!(mgr = self.id, idx, "stale fetch result discarded");
                    self.alloc.recycle(page.into_buffer());
                }
                self.pages_cv.notify_all();
            });

        match result {
            Ok(bytes) => {
                if count > 1 {
                    // adapt the window to the observed fetch time
                    let elapsed = started.elapsed();
                    let target = self.cache.options().max_dirty_time;
                    let mut st = self.state.lock();
                    if elapsed <= target {
                        st.fetch_size = (st.fetch_size * 2).min(FETCH_SIZE_MAX);
                    } else if elapsed > target * 2 {
                        st.fetch_size = (st.fetch_size / 2).max(1);
                    }
                    debug!(
                        mgr = self.id,
                        bytes,
                        elapsed_ms = elapsed.as_millis() as u64,
                        fetch_size = st.fetch_size,
                        "fetch complete"
                    );
                }
            }
            Err(e) => {
                warn!(mgr = self.id, index, count, error = %e, "page fetch failed");
                let mut st = self.state.lock();
                remove_pending_range(&mut st.pending, index, count);
                st.fetch_error = Some(e);
                drop(st);
                self.pages_cv.notify_all();
            }
        }
    }

    /// Flushes the maximal contiguous dirty run containing `index` with
    /// one backend write. Returns the total bytes written (0 when the
    /// page is absent or clean).
    fn flush_run_containing(&self, index: u64) -> Result<u64> {
        let (start, end, data) = {
            let st = self.state.lock();
            if !st.pages.get(&index).is_some_and(|p| p.is_dirty()) {
                return Ok(0);
            }
            let mut start = index;
            while start > 0 && st.pages.get(&(start - 1)).is_some_and(|p| p.is_dirty()) {
                start -= 1;
            }
            let mut end = index;
            while st.pages.get(&(end + 1)).is_some_and(|p| p.is_dirty()) {
                end += 1;
            }
            let mut buf = BytesMut::new();
            for i in start..=end {
                buf.extend_from_slice(st.pages[&i].data());
            }
            (start, end, buf)
        };

        let total = data.len() as u64;
        {
            let _permit = BACKEND_IO.access();
            self.backend.flush_range(start, data.freeze())?;
        }

        let mut st = self.state.lock();
        for i in start..=end {
            if let Some(page) = st.pages.get_mut(&i) {
                page.set_dirty(false);
            }
        }
        drop(st);
        for i in start..=end {
            self.cache.remove_dirty(self.id, i);
        }
        debug!(mgr = self.id, start, end, total, "flushed dirty run");
        Ok(total)
    }

    /// Indices of resident pages, in order. Debug/introspection surface.
    pub fn resident_indices(&self) -> Vec<u64> {
        self.state.lock().pages.keys().copied().collect()
    }

    /// Size of the resident page at `index`, if any.
    pub fn resident_page_size(&self, index: u64) -> Option<usize> {
        self.state.lock().pages.get(&index).map(|p| p.size())
    }
}

impl Drop for PageManager {
    /// Runs only once no user thread, fetch worker or cleanup pass holds
    /// a reference, which is what makes the teardown safe: the cleanup
    /// thread's `Weak` upgrade fails from here on.
    fn drop(&mut self) {
        if !self.deleted.load(Ordering::Acquire) {
            let lock = self.data_mutex.lock_read_priority();
            // nothrow: close-time data loss is logged, not surfaced
            let _ = self.flush_all(&lock, true);
            drop(lock);
        }

        let st = self.state.get_mut();
        let pages = std::mem::take(&mut st.pages);
        for (i, page) in pages {
            self.cache.remove_page(self.id, i);
            self.alloc.recycle(page.into_buffer());
        }
    }
}
