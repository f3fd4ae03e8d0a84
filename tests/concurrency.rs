//! Concurrency properties: parallel readers agree, mixed workloads make
//! progress under a tight memory budget, and the cleanup thread never
//! wedges against user threads.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use nimbusfs::backend::memory::ROOT_ID;
use nimbusfs::{
    Backend, CacheManager, CacheOptions, File, FsConfig, MemoryBackend,
};

const PS: usize = 16;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn open_file(
    backend: &Arc<MemoryBackend>,
    cache: &Arc<CacheManager>,
    name: &str,
    content: &[u8],
) -> File {
    init_logging();
    let meta = backend.seed_file(ROOT_ID, name, content);
    File::open(
        Arc::clone(backend) as Arc<dyn Backend>,
        cache,
        meta,
        FsConfig::default(),
    )
}

#[test]
fn parallel_readers_agree() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = CacheManager::new(CacheOptions {
        page_size: PS,
        ..CacheOptions::default()
    });
    let content: Vec<u8> = (0..255u8).cycle().take(PS * 64).collect();
    let file = Arc::new(open_file(&backend, &cache, "shared", &content));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let file = Arc::clone(&file);
        let expected = content.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..50 {
                let mut buf = vec![0u8; 100];
                let n = file.read_bytes(&mut buf, 37).unwrap();
                assert_eq!(n, 100);
                assert_eq!(&buf[..n], &expected[37..137]);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn readers_and_writer_disjoint_pages() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = CacheManager::new(CacheOptions {
        page_size: PS,
        ..CacheOptions::default()
    });
    let content = vec![1u8; PS * 32];
    let file = Arc::new(open_file(&backend, &cache, "split", &content));

    // readers live in the first half, the writer in the second
    let mut handles = Vec::new();
    for _ in 0..4 {
        let file = Arc::clone(&file);
        handles.push(thread::spawn(move || {
            for _ in 0..100 {
                let mut buf = vec![0u8; PS];
                file.read_bytes(&mut buf, 0).unwrap();
                assert!(buf.iter().all(|&b| b == 1));
            }
        }));
    }
    {
        let file = Arc::clone(&file);
        handles.push(thread::spawn(move || {
            for i in 0..100u64 {
                let payload = vec![2u8; PS];
                file.write_bytes(&payload, (16 + (i % 16)) * PS as u64)
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    file.flush().unwrap();
    let id = file.metadata().id;
    let stored = backend.contents(&id).unwrap();
    assert!(stored[..PS].iter().all(|&b| b == 1));
    assert!(stored[16 * PS..17 * PS].iter().all(|&b| b == 2));
}

/// Many writers over many files under a memory budget small enough that
/// the cleanup thread must evict and flush continuously. The property is
/// progress: everything completes and the data is intact.
#[test]
fn progress_under_memory_pressure() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = CacheManager::new(CacheOptions {
        page_size: PS,
        memory_limit: (PS * 8) as u64,
        evict_size_frac: 4,
        ..CacheOptions::default()
    });

    let files: Vec<Arc<File>> = (0..4)
        .map(|i| Arc::new(open_file(&backend, &cache, &format!("file{i}"), b"")))
        .collect();

    let start = Instant::now();
    let mut handles = Vec::new();
    for (fi, file) in files.iter().enumerate() {
        let file = Arc::clone(file);
        handles.push(thread::spawn(move || {
            for i in 0..64u64 {
                let payload = vec![fi as u8 + 1; PS];
                file.write_bytes(&payload, i * PS as u64).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert!(
        start.elapsed() < Duration::from_secs(60),
        "writers took implausibly long; cleanup likely wedged"
    );

    for (fi, file) in files.iter().enumerate() {
        file.flush().unwrap();
        let id = file.metadata().id;
        let stored = backend.contents(&id).unwrap();
        assert_eq!(stored.len(), 64 * PS);
        assert!(stored.iter().all(|&b| b == fi as u8 + 1));
    }

    // budgets settled and accounting is consistent
    let stats = cache.stats();
    assert_eq!(stats.current_dirty, 0);
}

/// Random single-threaded operation sequences against a model vector.
#[test]
fn randomized_ops_match_model() {
    let mut rng = rand::rng();
    for round in 0..10 {
        let backend = Arc::new(MemoryBackend::new());
        let cache = CacheManager::new(CacheOptions {
            page_size: PS,
            ..CacheOptions::default()
        });
        let file = open_file(&backend, &cache, &format!("m{round}"), b"");
        let mut model: Vec<u8> = Vec::new();

        for _ in 0..60 {
            match rng.random_range(0..10u32) {
                // write at a random offset near the current end
                0..=4 => {
                    let offset = rng.random_range(0..model.len() as u64 + 40);
                    let len = rng.random_range(1..60usize);
                    let val = rng.random_range(1..=255u8);
                    let payload = vec![val; len];
                    file.write_bytes(&payload, offset).unwrap();

                    let end = offset as usize + len;
                    if model.len() < end {
                        model.resize(end, 0);
                    }
                    model[offset as usize..end].copy_from_slice(&payload);
                }
                // read a random range and compare
                5..=7 => {
                    let offset = rng.random_range(0..model.len() as u64 + 10);
                    let want = rng.random_range(1..80usize);
                    let mut buf = vec![0u8; want];
                    let n = file.read_bytes(&mut buf, offset).unwrap();
                    let expect: &[u8] = if (offset as usize) < model.len() {
                        &model[offset as usize..(offset as usize + want).min(model.len())]
                    } else {
                        &[]
                    };
                    assert_eq!(n, expect.len());
                    assert_eq!(&buf[..n], expect);
                }
                // truncate to a random size at or below the current end
                8 => {
                    let new_size = if model.is_empty() {
                        0
                    } else {
                        rng.random_range(0..=model.len() as u64)
                    };
                    file.truncate(new_size).unwrap();
                    model.truncate(new_size as usize);
                }
                // fsync
                _ => {
                    file.flush().unwrap();
                    let id = file.metadata().id;
                    assert_eq!(backend.contents(&id).unwrap(), model);
                }
            }
            assert_eq!(file.size(), model.len() as u64);
        }
    }
}

/// Hammer one file from readers, writers and fsyncs at once; afterwards
/// the accounting invariants hold and a final flush converges.
#[test]
fn mixed_workload_stress() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = CacheManager::new(CacheOptions {
        page_size: PS,
        memory_limit: (PS * 16) as u64,
        evict_size_frac: 4,
        ..CacheOptions::default()
    });
    let content = vec![9u8; PS * 32];
    let file = Arc::new(open_file(&backend, &cache, "hammer", &content));

    let mut handles = Vec::new();
    for t in 0..3 {
        let file = Arc::clone(&file);
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            for _ in 0..40 {
                let offset = rng.random_range(0..(PS * 32) as u64);
                match t {
                    0 => {
                        let mut buf = vec![0u8; PS];
                        file.read_bytes(&mut buf, offset).unwrap();
                    }
                    1 => {
                        let payload = vec![7u8; PS / 2];
                        file.write_bytes(&payload, offset).unwrap();
                    }
                    _ => {
                        file.flush().unwrap();
                    }
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    file.flush().unwrap();
    let stats = cache.stats();
    assert_eq!(stats.current_dirty, 0);
    assert_eq!(file.size(), file.page_manager().backend_size());
}
