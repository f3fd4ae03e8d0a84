//! The backend facade: the only view the core has of remote storage.
//!
//! The transport (HTTP, subprocess) lives behind [`Backend`] and is
//! responsible for translating protocol failures into the closed
//! [`crate::FsError`] taxonomy before they reach the cache.

pub mod memory;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::filesystem::fs_config::FsConfig;

pub use memory::MemoryBackend;

/// Metadata for one stored item (file or folder), as the backend
/// serializes it on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub modified: u64,
    /// ID of the filesystem holding the item.
    #[serde(default)]
    pub fs_id: String,
}

/// Operations the core requires of a storage backend.
///
/// `read_file` streams the payload through `sink` in order and returns
/// the byte count actually served, which may be short of `length` when
/// the range runs past the end of the object.
pub trait Backend: Send + Sync {
    fn read_file(
        &self,
        id: &str,
        offset: u64,
        length: u64,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<u64>;

    fn write_file(&self, id: &str, offset: u64, data: Bytes) -> Result<()>;

    fn truncate_file(&self, id: &str, size: u64) -> Result<()>;

    fn create_file(&self, parent: &str, name: &str) -> Result<ItemMetadata>;

    fn delete_file(&self, id: &str) -> Result<()>;

    fn rename_file(&self, id: &str, new_name: &str, overwrite: bool) -> Result<()>;

    fn move_file(&self, id: &str, new_parent: &str, overwrite: bool) -> Result<()>;

    fn get_file(&self, id: &str) -> Result<ItemMetadata>;

    fn create_folder(&self, parent: &str, name: &str) -> Result<ItemMetadata>;

    fn delete_folder(&self, id: &str) -> Result<()>;

    fn rename_folder(&self, id: &str, new_name: &str, overwrite: bool) -> Result<()>;

    fn move_folder(&self, id: &str, new_parent: &str, overwrite: bool) -> Result<()>;

    fn get_fs_config(&self, fs_id: &str) -> Result<FsConfig>;

    /// Whether the transport supports random-offset writes; append-only
    /// transports clamp the effective write mode.
    fn can_random_write(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_json_round_trip() {
        let meta = ItemMetadata {
            id: "f1".into(),
            name: "report.txt".into(),
            size: 512,
            created: 1_700_000_000,
            modified: 1_700_000_100,
            fs_id: "fs0".into(),
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: ItemMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "f1");
        assert_eq!(back.size, 512);
    }

    #[test]
    fn test_metadata_defaults() {
        let meta: ItemMetadata =
            serde_json::from_str(r#"{"id":"f2","name":"x"}"#).unwrap();
        assert_eq!(meta.size, 0);
        assert_eq!(meta.fs_id, "");
    }
}
