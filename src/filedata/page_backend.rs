use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{Backend, ItemMetadata};
use crate::error::{FsError, Result};
use crate::filedata::allocator::CachingAllocator;
use crate::filedata::page::Page;

/// Translates page-index requests into backend byte ranges.
///
/// Not responsible for any locking: callers coordinate through the
/// owning manager's data lock. `backend_size` is the file size the
/// backend has confirmed; dirty extension can push the advertised file
/// size past it until the next flush.
pub struct PageBackend {
    backend: Arc<dyn Backend>,
    page_size: usize,
    ids: Mutex<BackendIds>,
    backend_size: AtomicU64,
    /// False while the file lives only in memory (delayed creation).
    backend_exists: AtomicBool,
}

struct BackendIds {
    file_id: Option<String>,
    parent_id: String,
    name: String,
}

impl PageBackend {
    /// For a file that already exists on the backend.
    pub fn new_existing(
        backend: Arc<dyn Backend>,
        page_size: usize,
        file_id: String,
        backend_size: u64,
    ) -> Self {
        Self {
            backend,
            page_size,
            ids: Mutex::new(BackendIds {
                file_id: Some(file_id),
                parent_id: String::new(),
                name: String::new(),
            }),
            backend_size: AtomicU64::new(backend_size),
            backend_exists: AtomicBool::new(true),
        }
    }

    /// For a file born in memory; the remote object is created lazily by
    /// [`PageBackend::flush_create`].
    pub fn new_pending(
        backend: Arc<dyn Backend>,
        page_size: usize,
        parent_id: String,
        name: String,
    ) -> Self {
        Self {
            backend,
            page_size,
            ids: Mutex::new(BackendIds {
                file_id: None,
                parent_id,
                name,
            }),
            backend_size: AtomicU64::new(0),
            backend_exists: AtomicBool::new(false),
        }
    }

    pub fn backend_size(&self) -> u64 {
        self.backend_size.load(Ordering::Acquire)
    }

    pub fn exists(&self) -> bool {
        self.backend_exists.load(Ordering::Acquire)
    }

    /// Records a size observed from a remote metadata refresh.
    pub fn set_remote_size(&self, size: u64) {
        self.backend_size.store(size, Ordering::Release);
        self.backend_exists.store(true, Ordering::Release);
    }

    pub fn file_id(&self) -> Result<String> {
        self.ids
            .lock()
            .file_id
            .clone()
            .ok_or_else(|| FsError::NotFound("file not yet created on the backend".into()))
    }

    /// Updates the pending name (a not-yet-created file being renamed).
    pub fn set_name(&self, name: &str) {
        self.ids.lock().name = name.to_string();
    }

    /// Updates the pending parent (a not-yet-created file being moved).
    pub fn set_parent(&self, parent: &str) {
        self.ids.lock().parent_id = parent.to_string();
    }

    /// Reads `count` pages starting at `index` with a single backend
    /// call, handing each completed page to `handler` in index order.
    ///
    /// Pages the backend cannot serve (short read, or a window reaching
    /// past `backend_size`) are produced zero-filled at the size implied
    /// by `file_size`. Returns the bytes actually read from the backend.
    pub fn fetch_pages(
        &self,
        index: u64,
        count: usize,
        file_size: u64,
        alloc: &CachingAllocator,
        handler: &mut dyn FnMut(u64, Page),
    ) -> Result<u64> {
        let ps = self.page_size as u64;
        let page_start = index * ps;
        let backend_size = self.backend_size();
        let read_size = if page_start >= backend_size {
            0
        } else {
            (backend_size - page_start).min(ps * count as u64)
        };

        debug!(index, count, page_start, read_size, "fetching pages");

        let mut cur_index = index;
        let mut cur_page: Option<Page> = None;
        let mut cur_fill = 0usize;
        let mut total = 0u64;

        if read_size > 0 {
            let id = self.file_id()?;
            total = self
                .backend
                .read_file(&id, page_start, read_size, &mut |mut chunk| {
                    while !chunk.is_empty() {
                        if cur_page.is_none() {
                            let start = cur_index * ps;
                            debug_assert!(start < file_size);
                            let size = file_size.saturating_sub(start).min(ps) as usize;
                            cur_page = Some(Page::from_buffer(alloc.alloc(size)));
                            cur_fill = 0;
                        }
                        let page = cur_page.as_mut().expect("created above");
                        let n = (page.size() - cur_fill).min(chunk.len());
                        page.data_mut()[cur_fill..cur_fill + n].copy_from_slice(&chunk[..n]);
                        cur_fill += n;
                        chunk = &chunk[n..];
                        if cur_fill == page.size() {
                            handler(cur_index, cur_page.take().expect("filled"));
                            cur_index += 1;
                        }
                    }
                })?;
        }

        // a partially filled page keeps its zeroed tail; anything past
        // the backend end is zero-filled outright
        while cur_index < index + count as u64 {
            let page = cur_page.take().unwrap_or_else(|| {
                let start = cur_index * ps;
                let size = file_size.saturating_sub(start).min(ps) as usize;
                Page::from_buffer(alloc.alloc(size))
            });
            handler(cur_index, page);
            cur_index += 1;
        }

        Ok(total)
    }

    /// Writes one contiguous run of page data (already concatenated by
    /// the caller) starting at `start_index`, creating the remote object
    /// first if this file has never been flushed.
    pub fn flush_range(&self, start_index: u64, data: Bytes) -> Result<()> {
        if !self.exists() {
            self.flush_create()?;
        }
        let offset = start_index * self.page_size as u64;
        let len = data.len() as u64;
        let id = self.file_id()?;

        debug!(offset, len, "flushing page run");
        self.backend.write_file(&id, offset, data)?;
        self.backend_size.fetch_max(offset + len, Ordering::AcqRel);
        Ok(())
    }

    /// Creates the remote object for a delayed-creation file and records
    /// its ID. No-op if the file already exists on the backend.
    pub fn flush_create(&self) -> Result<Option<ItemMetadata>> {
        let mut ids = self.ids.lock();
        if self.backend_exists.load(Ordering::Acquire) {
            return Ok(None);
        }
        let meta = self.backend.create_file(&ids.parent_id, &ids.name)?;
        ids.file_id = Some(meta.id.clone());
        self.backend_exists.store(true, Ordering::Release);
        debug!(id = %meta.id, "created file on backend");
        Ok(Some(meta))
    }

    /// Forwards a truncation. For a file not yet on the backend only the
    /// local size notion is clamped.
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        if self.exists() {
            let id = self.file_id()?;
            self.backend.truncate_file(&id, new_size)?;
            self.backend_size.store(new_size, Ordering::Release);
        } else {
            let cur = self.backend_size.load(Ordering::Acquire);
            self.backend_size.store(cur.min(new_size), Ordering::Release);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, ROOT_ID};

    fn setup(content: &[u8], page_size: usize) -> (Arc<MemoryBackend>, PageBackend) {
        let backend = Arc::new(MemoryBackend::new());
        let meta = backend.seed_file(ROOT_ID, "f", content);
        let pb = PageBackend::new_existing(
            Arc::clone(&backend) as Arc<dyn Backend>,
            page_size,
            meta.id,
            content.len() as u64,
        );
        (backend, pb)
    }

    #[test]
    fn test_fetch_demultiplexes_pages() {
        let (_b, pb) = setup(b"0123456789", 4);
        let alloc = CachingAllocator::new();
        let mut got = Vec::new();
        let read = pb
            .fetch_pages(0, 3, 10, &alloc, &mut |i, p| got.push((i, p.data().to_vec())))
            .unwrap();
        assert_eq!(read, 10);
        assert_eq!(
            got,
            vec![
                (0, b"0123".to_vec()),
                (1, b"4567".to_vec()),
                (2, b"89".to_vec()),
            ]
        );
    }

    #[test]
    fn test_fetch_window_subset() {
        let (_b, pb) = setup(b"0123456789", 4);
        let alloc = CachingAllocator::new();
        let mut got = Vec::new();
        pb.fetch_pages(1, 1, 10, &alloc, &mut |i, p| got.push((i, p.data().to_vec())))
            .unwrap();
        assert_eq!(got, vec![(1, b"4567".to_vec())]);
    }

    #[test]
    fn test_fetch_zero_fills_dirty_extension() {
        // file advertises 10 bytes but the backend only has 6: the last
        // page of the window comes back zero-padded
        let (_b, pb) = setup(b"012345", 4);
        let alloc = CachingAllocator::new();
        let mut got = Vec::new();
        let read = pb
            .fetch_pages(0, 2, 10, &alloc, &mut |i, p| got.push((i, p.data().to_vec())))
            .unwrap();
        assert_eq!(read, 6);
        assert_eq!(
            got,
            vec![(0, b"0123".to_vec()), (1, vec![b'4', b'5', 0, 0])]
        );
    }

    #[test]
    fn test_fetch_past_backend_is_local_zeroes() {
        let (_b, pb) = setup(b"0123", 4);
        let alloc = CachingAllocator::new();
        let mut got = Vec::new();
        let read = pb
            .fetch_pages(2, 1, 12, &alloc, &mut |i, p| got.push((i, p.data().to_vec())))
            .unwrap();
        assert_eq!(read, 0);
        assert_eq!(got, vec![(2, vec![0; 4])]);
    }

    #[test]
    fn test_flush_advances_backend_size() {
        let (b, pb) = setup(b"01234567", 4);
        pb.flush_range(2, Bytes::from_static(b"abcd")).unwrap();
        assert_eq!(pb.backend_size(), 12);
        let id = pb.file_id().unwrap();
        assert_eq!(&b.contents(&id).unwrap()[8..], b"abcd");
    }

    #[test]
    fn test_delayed_creation() {
        let backend = Arc::new(MemoryBackend::new());
        let pb = PageBackend::new_pending(
            Arc::clone(&backend) as Arc<dyn Backend>,
            4,
            ROOT_ID.to_string(),
            "fresh".to_string(),
        );
        assert!(!pb.exists());
        assert!(pb.file_id().is_err());

        pb.flush_range(0, Bytes::from_static(b"data")).unwrap();
        assert!(pb.exists());
        let id = pb.file_id().unwrap();
        assert_eq!(backend.contents(&id).unwrap(), b"data");
        assert_eq!(pb.backend_size(), 4);

        // second flush does not re-create
        assert!(pb.flush_create().unwrap().is_none());
    }

    #[test]
    fn test_truncate_forwards() {
        let (b, pb) = setup(b"abcdef", 4);
        pb.truncate(2).unwrap();
        assert_eq!(pb.backend_size(), 2);
        let id = pb.file_id().unwrap();
        assert_eq!(b.contents(&id).unwrap(), b"ab");
    }

    #[test]
    fn test_truncate_before_creation_is_local() {
        let backend = Arc::new(MemoryBackend::new());
        let pb = PageBackend::new_pending(
            backend as Arc<dyn Backend>,
            4,
            ROOT_ID.to_string(),
            "x".to_string(),
        );
        pb.truncate(8).unwrap();
        assert!(!pb.exists());
        assert_eq!(pb.backend_size(), 0);
    }
}
