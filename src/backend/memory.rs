use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::backend::{Backend, ItemMetadata};
use crate::error::{FsError, Result};
use crate::filesystem::fs_config::FsConfig;

/// Chunk size used when streaming reads through the sink, so consumers
/// see the same multi-callback shape a network transport produces.
const STREAM_CHUNK: usize = 64 * 1024;

/// In-memory [`Backend`]: a complete implementation over a flat item
/// table, used by the test suite and usable as a scratch filesystem.
///
/// Supports failure injection: `fail_reads(n)` / `fail_writes(n)` make
/// the next `n` read or write calls return a transport error.
pub struct MemoryBackend {
    state: Mutex<MemState>,
    fail_reads: AtomicU32,
    fail_writes: AtomicU32,
}

struct MemState {
    items: HashMap<String, MemItem>,
    fs_config: FsConfig,
    next_id: u64,
}

struct MemItem {
    meta: ItemMetadata,
    data: Vec<u8>,
    folder: bool,
    parent: String,
}

/// ID of the always-present root folder.
pub const ROOT_ID: &str = "root";

impl MemoryBackend {
    pub fn new() -> Self {
        let mut items = HashMap::new();
        items.insert(
            ROOT_ID.to_string(),
            MemItem {
                meta: ItemMetadata {
                    id: ROOT_ID.into(),
                    name: String::new(),
                    size: 0,
                    created: 0,
                    modified: 0,
                    fs_id: "fs0".into(),
                },
                data: Vec::new(),
                folder: true,
                parent: String::new(),
            },
        );
        Self {
            state: Mutex::new(MemState {
                items,
                fs_config: FsConfig::default(),
                next_id: 1,
            }),
            fail_reads: AtomicU32::new(0),
            fail_writes: AtomicU32::new(0),
        }
    }

    pub fn with_fs_config(fs_config: FsConfig) -> Self {
        let backend = Self::new();
        backend.state.lock().fs_config = fs_config;
        backend
    }

    /// Makes the next `n` read calls fail with a transport error.
    pub fn fail_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` write calls fail with a transport error.
    pub fn fail_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Seeds a file with content, returning its metadata.
    pub fn seed_file(&self, parent: &str, name: &str, content: &[u8]) -> ItemMetadata {
        let meta = self.create_file(parent, name).expect("seed create");
        let mut state = self.state.lock();
        let item = state.items.get_mut(&meta.id).expect("seeded item");
        item.data = content.to_vec();
        item.meta.size = content.len() as u64;
        item.meta.clone()
    }

    /// Current content of a file; test observation hook.
    pub fn contents(&self, id: &str) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let item = Self::file(&state, id)?;
        Ok(item.data.clone())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn file<'a>(state: &'a MemState, id: &str) -> Result<&'a MemItem> {
        match state.items.get(id) {
            Some(item) if !item.folder => Ok(item),
            Some(_) => Err(FsError::Invalid(format!("{id} is a folder"))),
            None => Err(FsError::NotFound(id.to_string())),
        }
    }

    fn file_mut<'a>(state: &'a mut MemState, id: &str) -> Result<&'a mut MemItem> {
        match state.items.get_mut(id) {
            Some(item) if !item.folder => Ok(item),
            Some(_) => Err(FsError::Invalid(format!("{id} is a folder"))),
            None => Err(FsError::NotFound(id.to_string())),
        }
    }

    fn create_item(&self, parent: &str, name: &str, folder: bool) -> Result<ItemMetadata> {
        let mut state = self.state.lock();
        if !state.items.get(parent).is_some_and(|p| p.folder) {
            return Err(FsError::NotFound(format!("parent {parent}")));
        }
        let duplicate = state
            .items
            .values()
            .any(|i| i.parent == parent && i.meta.name == name);
        if duplicate {
            return Err(FsError::Conflict(name.to_string()));
        }

        let id = format!("{}{}", if folder { "d" } else { "f" }, state.next_id);
        state.next_id += 1;
        let meta = ItemMetadata {
            id: id.clone(),
            name: name.to_string(),
            size: 0,
            created: 0,
            modified: 0,
            fs_id: "fs0".into(),
        };
        state.items.insert(
            id,
            MemItem {
                meta: meta.clone(),
                data: Vec::new(),
                folder,
                parent: parent.to_string(),
            },
        );
        Ok(meta)
    }

    fn rename_item(&self, id: &str, new_name: &str, overwrite: bool) -> Result<()> {
        let mut state = self.state.lock();
        if !state.items.contains_key(id) {
            return Err(FsError::NotFound(id.to_string()));
        }
        let parent = state.items[id].parent.clone();
        let clash: Option<String> = state
            .items
            .values()
            .find(|i| i.meta.id != id && i.parent == parent && i.meta.name == new_name)
            .map(|i| i.meta.id.clone());
        if let Some(clash) = clash {
            if !overwrite {
                return Err(FsError::Conflict(new_name.to_string()));
            }
            state.items.remove(&clash);
        }
        let item = state.items.get_mut(id).expect("checked above");
        item.meta.name = new_name.to_string();
        Ok(())
    }

    fn move_item(&self, id: &str, new_parent: &str, overwrite: bool) -> Result<()> {
        let mut state = self.state.lock();
        if !state.items.get(new_parent).is_some_and(|p| p.folder) {
            return Err(FsError::NotFound(format!("parent {new_parent}")));
        }
        if !state.items.contains_key(id) {
            return Err(FsError::NotFound(id.to_string()));
        }
        let name = state.items[id].meta.name.clone();
        let clash: Option<String> = state
            .items
            .values()
            .find(|i| i.meta.id != id && i.parent == new_parent && i.meta.name == name)
            .map(|i| i.meta.id.clone());
        if let Some(clash) = clash {
            if !overwrite {
                return Err(FsError::Conflict(name));
            }
            state.items.remove(&clash);
        }
        let item = state.items.get_mut(id).expect("checked above");
        item.parent = new_parent.to_string();
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn read_file(
        &self,
        id: &str,
        offset: u64,
        length: u64,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<u64> {
        if Self::take_failure(&self.fail_reads) {
            return Err(FsError::Transport("injected read failure".into()));
        }
        let state = self.state.lock();
        let item = Self::file(&state, id)?;

        let len = item.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let end = (offset + length).min(len);
        let slice = &item.data[offset as usize..end as usize];
        for chunk in slice.chunks(STREAM_CHUNK) {
            sink(chunk);
        }
        Ok(slice.len() as u64)
    }

    fn write_file(&self, id: &str, offset: u64, data: Bytes) -> Result<()> {
        if Self::take_failure(&self.fail_writes) {
            return Err(FsError::Transport("injected write failure".into()));
        }
        let mut state = self.state.lock();
        let item = Self::file_mut(&mut state, id)?;

        let end = offset as usize + data.len();
        if item.data.len() < end {
            item.data.resize(end, 0);
        }
        item.data[offset as usize..end].copy_from_slice(&data);
        item.meta.size = item.data.len() as u64;
        Ok(())
    }

    fn truncate_file(&self, id: &str, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        let item = Self::file_mut(&mut state, id)?;
        item.data.resize(size as usize, 0);
        item.meta.size = size;
        Ok(())
    }

    fn create_file(&self, parent: &str, name: &str) -> Result<ItemMetadata> {
        self.create_item(parent, name, false)
    }

    fn delete_file(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let folder = match state.items.get(id) {
            Some(item) => item.folder,
            None => return Err(FsError::NotFound(id.to_string())),
        };
        if folder {
            return Err(FsError::Invalid(format!("{id} is a folder")));
        }
        state.items.remove(id);
        Ok(())
    }

    fn rename_file(&self, id: &str, new_name: &str, overwrite: bool) -> Result<()> {
        self.rename_item(id, new_name, overwrite)
    }

    fn move_file(&self, id: &str, new_parent: &str, overwrite: bool) -> Result<()> {
        self.move_item(id, new_parent, overwrite)
    }

    fn get_file(&self, id: &str) -> Result<ItemMetadata> {
        let state = self.state.lock();
        Ok(Self::file(&state, id)?.meta.clone())
    }

    fn create_folder(&self, parent: &str, name: &str) -> Result<ItemMetadata> {
        self.create_item(parent, name, true)
    }

    fn delete_folder(&self, id: &str) -> Result<()> {
        if id == ROOT_ID {
            return Err(FsError::Unsupported("cannot delete the root".into()));
        }
        let mut state = self.state.lock();
        if !state.items.get(id).is_some_and(|i| i.folder) {
            return Err(FsError::NotFound(id.to_string()));
        }
        if state.items.values().any(|i| i.parent == id) {
            return Err(FsError::Conflict("folder not empty".into()));
        }
        state.items.remove(id);
        Ok(())
    }

    fn rename_folder(&self, id: &str, new_name: &str, overwrite: bool) -> Result<()> {
        self.rename_item(id, new_name, overwrite)
    }

    fn move_folder(&self, id: &str, new_parent: &str, overwrite: bool) -> Result<()> {
        self.move_item(id, new_parent, overwrite)
    }

    fn get_fs_config(&self, _fs_id: &str) -> Result<FsConfig> {
        Ok(self.state.lock().fs_config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_read_back() {
        let b = MemoryBackend::new();
        let meta = b.seed_file(ROOT_ID, "a.txt", b"hello world");
        assert_eq!(meta.size, 11);

        let mut out = Vec::new();
        let n = b
            .read_file(&meta.id, 6, 100, &mut |chunk| out.extend_from_slice(chunk))
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"world");
    }

    #[test]
    fn test_read_past_end() {
        let b = MemoryBackend::new();
        let meta = b.seed_file(ROOT_ID, "a", b"abc");
        let mut out = Vec::new();
        let n = b
            .read_file(&meta.id, 10, 5, &mut |c| out.extend_from_slice(c))
            .unwrap();
        assert_eq!(n, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_write_extends_with_zeros() {
        let b = MemoryBackend::new();
        let meta = b.create_file(ROOT_ID, "a").unwrap();
        b.write_file(&meta.id, 4, Bytes::from_static(b"xy")).unwrap();
        assert_eq!(b.contents(&meta.id).unwrap(), vec![0, 0, 0, 0, b'x', b'y']);
    }

    #[test]
    fn test_truncate() {
        let b = MemoryBackend::new();
        let meta = b.seed_file(ROOT_ID, "a", b"abcdef");
        b.truncate_file(&meta.id, 2).unwrap();
        assert_eq!(b.contents(&meta.id).unwrap(), b"ab");
        b.truncate_file(&meta.id, 4).unwrap();
        assert_eq!(b.contents(&meta.id).unwrap(), vec![b'a', b'b', 0, 0]);
    }

    #[test]
    fn test_duplicate_create_conflicts() {
        let b = MemoryBackend::new();
        b.create_file(ROOT_ID, "a").unwrap();
        assert!(matches!(
            b.create_file(ROOT_ID, "a"),
            Err(FsError::Conflict(_))
        ));
    }

    #[test]
    fn test_rename_overwrite() {
        let b = MemoryBackend::new();
        let a = b.create_file(ROOT_ID, "a").unwrap();
        let c = b.create_file(ROOT_ID, "c").unwrap();
        assert!(matches!(
            b.rename_file(&a.id, "c", false),
            Err(FsError::Conflict(_))
        ));
        b.rename_file(&a.id, "c", true).unwrap();
        assert_eq!(b.get_file(&a.id).unwrap().name, "c");
        assert!(matches!(b.get_file(&c.id), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_move_between_folders() {
        let b = MemoryBackend::new();
        let dir = b.create_folder(ROOT_ID, "sub").unwrap();
        let f = b.create_file(ROOT_ID, "a").unwrap();
        b.move_file(&f.id, &dir.id, false).unwrap();
        // now the same name can exist in the root again
        b.create_file(ROOT_ID, "a").unwrap();
    }

    #[test]
    fn test_delete_folder_rules() {
        let b = MemoryBackend::new();
        let dir = b.create_folder(ROOT_ID, "sub").unwrap();
        let f = b.create_file(&dir.id, "a").unwrap();
        assert!(matches!(
            b.delete_folder(&dir.id),
            Err(FsError::Conflict(_))
        ));
        b.delete_file(&f.id).unwrap();
        b.delete_folder(&dir.id).unwrap();
    }

    #[test]
    fn test_failure_injection() {
        let b = MemoryBackend::new();
        let meta = b.seed_file(ROOT_ID, "a", b"abc");
        b.fail_writes(1);
        assert!(matches!(
            b.write_file(&meta.id, 0, Bytes::from_static(b"x")),
            Err(FsError::Transport(_))
        ));
        b.write_file(&meta.id, 0, Bytes::from_static(b"x")).unwrap();
    }

    #[test]
    fn test_streaming_chunks() {
        let b = MemoryBackend::new();
        let content = vec![7u8; STREAM_CHUNK * 2 + 17];
        let meta = b.seed_file(ROOT_ID, "big", &content);
        let mut calls = 0;
        let mut total = 0;
        b.read_file(&meta.id, 0, content.len() as u64, &mut |c| {
            calls += 1;
            total += c.len();
        })
        .unwrap();
        assert_eq!(calls, 3);
        assert_eq!(total, content.len());
    }
}
