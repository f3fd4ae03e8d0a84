//! # nimbusfs
//!
//! Page-cached I/O engine for exposing a remote object-storage account
//! as a local filesystem. The FUSE glue and the wire transport live
//! elsewhere; this crate is the core between them:
//!
//! - per-file page management with readahead and write-behind
//!   ([`filedata::PageManager`]);
//! - a process-wide memory and dirty-byte budget enforced by a
//!   background cleanup thread ([`filedata::CacheManager`]), with the
//!   dirty window sized by live bandwidth measurement;
//! - the concurrency primitives those need ([`sync::SharedMutex`] with
//!   a reader-priority mode, a FIFO [`sync::Semaphore`], and the
//!   insertion-ordered [`sync::OrderedMap`] behind the LRU queues);
//! - the [`backend::Backend`] facade the transport implements, plus an
//!   in-memory implementation for tests and embedding.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use nimbusfs::backend::{Backend, MemoryBackend, memory::ROOT_ID};
//! use nimbusfs::filedata::{CacheManager, CacheOptions};
//! use nimbusfs::filesystem::{File, FsConfig};
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let cache = CacheManager::new(CacheOptions::default());
//! let meta = backend.seed_file(ROOT_ID, "hello.txt", b"hello world");
//!
//! let file = File::open(
//!     Arc::clone(&backend) as Arc<dyn Backend>,
//!     &cache,
//!     meta,
//!     FsConfig::default(),
//! );
//! let mut buf = [0u8; 5];
//! file.read_bytes(&mut buf, 6).unwrap();
//! assert_eq!(&buf, b"world");
//! ```

pub mod backend;
pub mod error;
pub mod filedata;
pub mod filesystem;
pub mod sync;

pub use backend::{Backend, ItemMetadata, MemoryBackend};
pub use error::{FsError, Result};
pub use filedata::{CacheManager, CacheOptions, PageManager};
pub use filesystem::{File, FsConfig, WriteMode};
