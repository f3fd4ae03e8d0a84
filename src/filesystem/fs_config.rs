use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Overwrite capability advertised by a filesystem, in increasing order
/// of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    None,
    Append,
    Random,
}

/// Per-filesystem configuration the core consumes read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    /// Storage chunk size in bytes; 0 means unconstrained. Pages are
    /// sized to a multiple of this so one page never straddles two
    /// storage units.
    #[serde(default)]
    pub chunk_size: usize,

    #[serde(default = "FsConfig::default_write_mode")]
    pub write_mode: WriteMode,

    #[serde(default)]
    pub read_only: bool,
}

impl FsConfig {
    fn default_write_mode() -> WriteMode {
        WriteMode::Random
    }

    /// Decodes the backend's JSON representation.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            write_mode: WriteMode::Random,
            read_only: false,
        }
    }
}
