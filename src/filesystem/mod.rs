//! The thin filesystem surface over the page cache: per-file handles and
//! the per-filesystem configuration they consume.

pub mod file;
pub mod fs_config;

pub use file::File;
pub use fs_config::{FsConfig, WriteMode};
