use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::sync::OrderedMap;

/// Default budget of recycled bytes kept around (100 MiB).
const DEFAULT_MAX_FREE: usize = 100 * 1024 * 1024;

/// Recycles retired page buffers to keep a long-running mount from
/// fragmenting the heap.
///
/// Buffers are bucketed by capacity; `alloc` reuses a cached buffer of
/// the exact capacity when one exists, otherwise it allocates fresh.
/// Buckets are kept in least-recently-stocked order so trimming under
/// the free-bytes budget drops the stalest sizes first.
pub struct CachingAllocator {
    state: Mutex<AllocState>,
    max_free: usize,
    allocs: AtomicU64,
    recycles: AtomicU64,
}

struct AllocState {
    /// capacity -> stack of free buffers with that capacity
    buckets: OrderedMap<usize, Vec<Vec<u8>>>,
    free_bytes: usize,
}

impl CachingAllocator {
    pub fn new() -> Self {
        Self::with_max_free(DEFAULT_MAX_FREE)
    }

    pub fn with_max_free(max_free: usize) -> Self {
        Self {
            state: Mutex::new(AllocState {
                buckets: OrderedMap::new(),
                free_bytes: 0,
            }),
            max_free,
            allocs: AtomicU64::new(0),
            recycles: AtomicU64::new(0),
        }
    }

    /// Returns a zeroed buffer of exactly `len` bytes.
    pub fn alloc(&self, len: usize) -> Vec<u8> {
        if len > 0 {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let reused = match state.buckets.get_mut(&len) {
                Some(bucket) => {
                    let buf = bucket.pop();
                    let empty = bucket.is_empty();
                    if buf.is_some() {
                        state.free_bytes -= len;
                    }
                    if empty {
                        state.buckets.erase(&len);
                    }
                    buf
                }
                None => None,
            };
            drop(guard);
            if let Some(mut buf) = reused {
                self.recycles.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.resize(len, 0);
                return buf;
            }
        }
        self.allocs.fetch_add(1, Ordering::Relaxed);
        vec![0u8; len]
    }

    /// Returns a retired buffer to the cache.
    pub fn recycle(&self, buf: Vec<u8>) {
        let cap = buf.capacity();
        if cap == 0 {
            return;
        }
        let mut state = self.state.lock();
        if let Some(bucket) = state.buckets.get_mut(&cap) {
            bucket.push(buf);
        } else {
            state.buckets.enqueue_back(cap, vec![buf]);
        }
        state.free_bytes += cap;

        while state.free_bytes > self.max_free {
            let Some((cap, bucket)) = state.buckets.pop_front() else {
                break;
            };
            state.free_bytes -= cap * bucket.len();
        }
    }

    /// (fresh allocations, recycled allocations, bytes cached)
    pub fn stats(&self) -> (u64, u64, usize) {
        (
            self.allocs.load(Ordering::Relaxed),
            self.recycles.load(Ordering::Relaxed),
            self.state.lock().free_bytes,
        )
    }
}

impl Default for CachingAllocator {
    fn default() -> Self {
        Self::new()
    }
}
