use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{Backend, ItemMetadata};
use crate::error::{FsError, Result};
use crate::filedata::cache_manager::CacheManager;
use crate::filedata::page_backend::PageBackend;
use crate::filedata::page_manager::PageManager;
use crate::filesystem::fs_config::{FsConfig, WriteMode};

/// One open file: owns its [`PageManager`] and splits byte-range
/// operations into page-aligned sub-ranges.
pub struct File {
    meta: Mutex<ItemMetadata>,
    fs_config: FsConfig,
    pm: Arc<PageManager>,
    backend: Arc<dyn Backend>,
}

/// Pages are sized to a whole multiple of the filesystem chunk so the
/// backend never splits one page across two storage units.
fn choose_page_size(config_page_size: usize, fs_chunk: usize) -> usize {
    if fs_chunk > 0 {
        config_page_size.div_ceil(fs_chunk) * fs_chunk
    } else {
        config_page_size
    }
}

impl File {
    /// Opens a file that exists on the backend.
    pub fn open(
        backend: Arc<dyn Backend>,
        cache: &Arc<CacheManager>,
        meta: ItemMetadata,
        fs_config: FsConfig,
    ) -> Self {
        let page_size = choose_page_size(cache.options().page_size, fs_config.chunk_size);
        debug!(id = %meta.id, name = %meta.name, size = meta.size, page_size, "opening file");

        let pb = PageBackend::new_existing(
            Arc::clone(&backend),
            page_size,
            meta.id.clone(),
            meta.size,
        );
        let pm = PageManager::new(
            pb,
            Arc::clone(cache),
            meta.size,
            page_size,
            fs_config.write_mode,
            fs_config.read_only,
        );
        Self {
            meta: Mutex::new(meta),
            fs_config,
            pm,
            backend,
        }
    }

    /// Creates a file that exists only in memory until its first flush
    /// reaches the backend (delayed creation).
    pub fn create(
        backend: Arc<dyn Backend>,
        cache: &Arc<CacheManager>,
        parent: &str,
        name: &str,
        fs_config: FsConfig,
    ) -> Result<Self> {
        if fs_config.read_only {
            return Err(FsError::ReadOnly("filesystem is read-only".into()));
        }
        let page_size = choose_page_size(cache.options().page_size, fs_config.chunk_size);
        debug!(parent, name, page_size, "creating file (delayed)");

        let pb = PageBackend::new_pending(
            Arc::clone(&backend),
            page_size,
            parent.to_string(),
            name.to_string(),
        );
        let pm = PageManager::new(
            pb,
            Arc::clone(cache),
            0,
            page_size,
            fs_config.write_mode,
            fs_config.read_only,
        );
        Ok(Self {
            meta: Mutex::new(ItemMetadata {
                id: String::new(),
                name: name.to_string(),
                size: 0,
                created: 0,
                modified: 0,
                fs_id: String::new(),
            }),
            fs_config,
            pm,
            backend,
        })
    }

    /// Size reported to userspace, including dirty data not yet flushed.
    pub fn size(&self) -> u64 {
        self.pm.file_size()
    }

    /// Metadata snapshot with the current size.
    pub fn metadata(&self) -> ItemMetadata {
        let mut meta = self.meta.lock().clone();
        if meta.id.is_empty() {
            if let Ok(id) = self.pm.page_backend().file_id() {
                meta.id = id;
            }
        }
        meta.size = self.pm.file_size();
        meta
    }

    pub fn page_manager(&self) -> &Arc<PageManager> {
        &self.pm
    }

    /// Effective write mode: the filesystem's, clamped to append when
    /// the transport cannot write at arbitrary offsets.
    pub fn write_mode(&self) -> WriteMode {
        let mode = self.fs_config.write_mode;
        if mode >= WriteMode::Random && !self.backend.can_random_write() {
            WriteMode::Append
        } else {
            mode
        }
    }

    /// Reads up to `buf.len()` bytes at `offset`; returns the count,
    /// zero at or past the end of file.
    pub fn read_bytes(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let lock = self.pm.read_lock();
        let size = self.pm.file_size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let length = ((size - offset) as usize).min(buf.len());
        let page_size = self.pm.page_size() as u64;

        let mut byte = offset;
        let mut done = 0usize;
        while byte < offset + length as u64 {
            let index = byte / page_size;
            let poffset = (byte - index * page_size) as usize;
            let plength = ((offset + length as u64 - byte) as usize)
                .min(self.pm.page_size() - poffset);

            self.pm
                .read_page(&mut buf[done..done + plength], index, poffset, &lock)?;
            byte += plength as u64;
            done += plength;
        }
        Ok(length)
    }

    /// Writes all of `buf` at `offset`, growing the file as needed.
    pub fn write_bytes(&self, buf: &[u8], offset: u64) -> Result<()> {
        if self.fs_config.read_only {
            return Err(FsError::ReadOnly("filesystem is read-only".into()));
        }
        if self.write_mode() == WriteMode::None {
            return Err(FsError::WriteType("filesystem does not allow writes".into()));
        }

        let lock = self.pm.write_lock();
        let page_size = self.pm.page_size() as u64;

        let mut byte = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let index = byte / page_size;
            let poffset = (byte - index * page_size) as usize;
            let plength = (buf.len() - done).min(self.pm.page_size() - poffset);

            self.pm
                .write_page(&buf[done..done + plength], index, poffset, &lock)?;
            byte += plength as u64;
            done += plength;
        }
        Ok(())
    }

    /// Truncates to `new_size`; requires random-write capability.
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        if self.fs_config.read_only {
            return Err(FsError::ReadOnly("filesystem is read-only".into()));
        }
        if self.write_mode() < WriteMode::Random {
            return Err(FsError::WriteType("truncate needs random writes".into()));
        }
        let lock = self.pm.write_lock();
        self.pm.truncate(new_size, &lock)
    }

    /// fsync: writes back every dirty page.
    pub fn flush(&self) -> Result<()> {
        let lock = self.pm.read_lock();
        self.pm.flush_all(&lock, false)
    }

    /// Reconciles with freshly fetched backend metadata. Dirty local
    /// state wins over the remote size until the next flush.
    pub fn refresh(&self, new_meta: &ItemMetadata) {
        {
            let mut meta = self.meta.lock();
            meta.name = new_meta.name.clone();
            meta.created = new_meta.created;
            meta.modified = new_meta.modified;
        }
        if new_meta.size != self.pm.backend_size() {
            debug!(
                id = %new_meta.id,
                old = self.pm.backend_size(),
                new = new_meta.size,
                "backend size changed"
            );
            let lock = self.pm.write_lock();
            self.pm.remote_changed(new_meta.size, &lock);
        }
    }

    /// Deletes the remote object (if it was ever created) and discards
    /// dirty state instead of flushing it on close.
    pub fn delete(&self) -> Result<()> {
        if self.fs_config.read_only {
            return Err(FsError::ReadOnly("filesystem is read-only".into()));
        }
        if self.pm.page_backend().exists() {
            let id = self.pm.page_backend().file_id()?;
            self.backend.delete_file(&id)?;
        }
        self.pm.mark_deleted();
        Ok(())
    }

    pub fn rename(&self, new_name: &str, overwrite: bool) -> Result<()> {
        if self.fs_config.read_only {
            return Err(FsError::ReadOnly("filesystem is read-only".into()));
        }
        if self.pm.page_backend().exists() {
            let id = self.pm.page_backend().file_id()?;
            self.backend.rename_file(&id, new_name, overwrite)?;
        } else {
            self.pm.page_backend().set_name(new_name);
        }
        self.meta.lock().name = new_name.to_string();
        Ok(())
    }

    pub fn move_to(&self, new_parent: &str, overwrite: bool) -> Result<()> {
        if self.fs_config.read_only {
            return Err(FsError::ReadOnly("filesystem is read-only".into()));
        }
        if self.pm.page_backend().exists() {
            let id = self.pm.page_backend().file_id()?;
            self.backend.move_file(&id, new_parent, overwrite)?;
        } else {
            self.pm.page_backend().set_parent(new_parent);
        }
        Ok(())
    }
}
