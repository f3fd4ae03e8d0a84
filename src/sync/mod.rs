//! Concurrency primitives underlying the page cache.
//!
//! These exist because the standard library does not provide them in the
//! shape the I/O engine needs: a counting semaphore with arrival-order
//! fairness and cross-thread release, and a reader/writer mutex with an
//! explicit reader-priority entry point for self-spawned helpers.

pub mod ordered_map;
pub mod semaphore;
pub mod shared_mutex;

pub use ordered_map::OrderedMap;
pub use semaphore::{Semaphore, SemaphoreGuard};
pub use shared_mutex::{ReadLock, SharedLockR, SharedLockRP, SharedLockW, SharedMutex};
