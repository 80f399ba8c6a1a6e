//! End-to-end scenarios lifted from spec.md §8: self-contained, with no
//! external test harness, keyed off PID + a counter to avoid path collisions
//! between concurrent test runs.

use slotcache::{Cache, OpenOptions, ScanOptions, SlotCacheError, WritebackMode};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn scratch_path(tag: &str) -> PathBuf {
    let pid = std::process::id();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("slotcache_e2e_{tag}_{pid}_{n}.slc"))
}

fn cleanup(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
    let mut lock = path.clone().into_os_string();
    lock.push(".lock");
    let _ = std::fs::remove_file(lock);
}

#[test]
fn scenario_a_happy_path() {
    let path = scratch_path("a");
    {
        let cache = Cache::open(OpenOptions::new(&path, 8, 4, 64)).unwrap();
        {
            let mut w = cache.writer().unwrap();
            w.put(b"AAAAAAAA", 1, &0x01020304u32.to_le_bytes()).unwrap();
            w.commit().unwrap();
        }
        let got = cache.get(b"AAAAAAAA").unwrap().expect("key present");
        assert_eq!(got.revision, 1);
        assert_eq!(got.index, 0x01020304u32.to_le_bytes());
        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.scan(&ScanOptions::new()).unwrap().len(), 1);
    }
    {
        let cache = Cache::open(OpenOptions::new(&path, 8, 4, 64)).unwrap();
        let scanned = cache.scan(&ScanOptions::new()).unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].key, b"AAAAAAAA");
    }
    cleanup(&path);
}

#[test]
fn scenario_b_delete_and_rehash_stress() {
    let path = scratch_path("b");
    let cache = Cache::open(OpenOptions::new(&path, 4, 4, 8)).unwrap();

    {
        let mut w = cache.writer().unwrap();
        for i in 1u32..=6 {
            w.put(&i.to_be_bytes(), i as i64, &i.to_le_bytes()).unwrap();
        }
        w.commit().unwrap();
    }

    {
        let mut w = cache.writer().unwrap();
        for i in 1u32..=5 {
            assert!(w.delete(&i.to_be_bytes()).unwrap());
        }
        w.commit().unwrap();
    }

    assert_eq!(cache.len().unwrap(), 1);
    assert!(cache.get(&1u32.to_be_bytes()).unwrap().is_none());
    let six = cache.get(&6u32.to_be_bytes()).unwrap().expect("6 survives");
    assert_eq!(six.revision, 6);

    {
        let mut w = cache.writer().unwrap();
        w.put(&7u32.to_be_bytes(), 100, &7u32.to_le_bytes()).unwrap();
        w.commit().unwrap();
    }

    assert_eq!(cache.len().unwrap(), 2);
    let mut keys: Vec<_> = cache
        .scan(&ScanOptions::new())
        .unwrap()
        .into_iter()
        .map(|e| u32::from_be_bytes(e.key.try_into().unwrap()))
        .collect();
    keys.sort();
    assert_eq!(keys, vec![6, 7]);

    cleanup(&path);
}

#[test]
fn scenario_c_ordered_keys_monotonicity() {
    let path = scratch_path("c");
    let cache = Cache::open(OpenOptions::new(&path, 8, 0, 16).ordered_keys(true)).unwrap();

    {
        let mut w = cache.writer().unwrap();
        w.put(b"bbbbbbbb", 1, &[]).unwrap();
        w.put(b"cccccccc", 2, &[]).unwrap();
        w.commit().unwrap();
    }

    {
        let mut w = cache.writer().unwrap();
        w.put(b"bbbbbbbb", 99, &[]).unwrap();
        w.put(b"aaaaaaaa", 3, &[]).unwrap();
        let err = w.commit().unwrap_err();
        assert!(matches!(err, SlotCacheError::OutOfOrderInsert));
    }

    let mut scanned = cache.scan(&ScanOptions::new()).unwrap();
    scanned.sort_by(|a, b| a.key.cmp(&b.key));
    assert_eq!(scanned.len(), 2);
    assert_eq!(scanned[0].key, b"bbbbbbbb");
    assert_eq!(scanned[0].revision, 1);
    assert_eq!(scanned[1].key, b"cccccccc");
    assert_eq!(scanned[1].revision, 2);

    cleanup(&path);
}

#[test]
fn scenario_d_capacity_preflight() {
    let path = scratch_path("d");
    let cache = Cache::open(OpenOptions::new(&path, 4, 0, 2)).unwrap();

    {
        let mut w = cache.writer().unwrap();
        w.put(b"k001", 1, &[]).unwrap();
        w.put(b"k002", 2, &[]).unwrap();
        w.commit().unwrap();
    }

    {
        let mut w = cache.writer().unwrap();
        w.put(b"k003", 3, &[]).unwrap();
        let err = w.commit().unwrap_err();
        assert!(matches!(err, SlotCacheError::Full));
    }

    assert_eq!(cache.len().unwrap(), 2);
    cleanup(&path);
}

#[test]
fn scenario_e_invalidation_is_terminal() {
    let path = scratch_path("e");
    {
        let cache = Cache::open(OpenOptions::new(&path, 8, 0, 64)).unwrap();
        {
            let mut w = cache.writer().unwrap();
            w.put(b"kkkkkkkk", 1, &[]).unwrap();
            w.commit().unwrap();
        }
        cache.invalidate().unwrap();

        assert!(matches!(cache.get(b"kkkkkkkk"), Err(SlotCacheError::Invalidated)));
        assert!(matches!(
            cache.scan(&ScanOptions::new()),
            Err(SlotCacheError::Invalidated)
        ));
        assert!(matches!(cache.writer(), Err(SlotCacheError::Invalidated)));
        assert!(matches!(cache.user_header(), Err(SlotCacheError::Invalidated)));
        assert!(matches!(cache.generation(), Err(SlotCacheError::Invalidated)));
    }
    {
        let err = Cache::open(OpenOptions::new(&path, 8, 0, 64)).unwrap_err();
        assert!(matches!(err, SlotCacheError::Invalidated));
    }
    cleanup(&path);
}

#[test]
fn writer_is_exclusive_per_cache() {
    let path = scratch_path("writer_exclusive");
    let cache = Cache::open(OpenOptions::new(&path, 4, 0, 8)).unwrap();
    let w1 = cache.writer().unwrap();
    let err = cache.writer().unwrap_err();
    assert!(matches!(err, SlotCacheError::Busy(_)));
    drop(w1);
    assert!(cache.writer().is_ok());
    cleanup(&path);
}

#[test]
fn user_header_roundtrips_through_commit() {
    let path = scratch_path("user_header");
    let cache = Cache::open(OpenOptions::new(&path, 4, 0, 8)).unwrap();
    {
        let mut w = cache.writer().unwrap();
        w.set_user_header_flags(0xDEADBEEF).unwrap();
        let mut data = [0u8; 64];
        data[0] = 7;
        w.set_user_header_data(data).unwrap();
        w.commit().unwrap();
    }
    let (flags, data) = cache.user_header().unwrap();
    assert_eq!(flags, 0xDEADBEEF);
    assert_eq!(data[0], 7);
    cleanup(&path);
}

#[test]
fn reopen_with_mismatched_key_size_is_incompatible() {
    let path = scratch_path("incompatible");
    {
        let _cache = Cache::open(OpenOptions::new(&path, 4, 0, 8)).unwrap();
    }
    let err = Cache::open(OpenOptions::new(&path, 8, 0, 8)).unwrap_err();
    assert!(matches!(err, SlotCacheError::Incompatible(_)));
    cleanup(&path);
}

#[test]
fn scan_prefix_and_match_agree_with_filtered_scan() {
    let path = scratch_path("prefix");
    let cache = Cache::open(OpenOptions::new(&path, 4, 0, 32)).unwrap();
    {
        let mut w = cache.writer().unwrap();
        w.put(b"aaaa", 1, &[]).unwrap();
        w.put(b"aabb", 2, &[]).unwrap();
        w.put(b"bbbb", 3, &[]).unwrap();
        w.commit().unwrap();
    }

    let prefixed = cache.scan_prefix(b"aa", &ScanOptions::new()).unwrap();
    let mut expected: Vec<_> = cache
        .scan(&ScanOptions::new())
        .unwrap()
        .into_iter()
        .filter(|e| e.key.starts_with(b"aa"))
        .collect();
    let mut actual = prefixed;
    actual.sort_by(|a, b| a.key.cmp(&b.key));
    expected.sort_by(|a, b| a.key.cmp(&b.key));
    assert_eq!(actual, expected);
    assert_eq!(actual.len(), 2);

    cleanup(&path);
}

#[test]
fn scan_range_requires_ordered_keys() {
    let path = scratch_path("range_unordered");
    let cache = Cache::open(OpenOptions::new(&path, 4, 0, 8)).unwrap();
    let err = cache.scan_range(None, None, &ScanOptions::new()).unwrap_err();
    assert!(matches!(err, SlotCacheError::InvalidInput(_)));
    cleanup(&path);
}

#[test]
fn writeback_none_still_commits_in_memory() {
    let path = scratch_path("writeback_none");
    let cache = Cache::open(OpenOptions::new(&path, 4, 0, 8).writeback(WritebackMode::None)).unwrap();
    let mut w = cache.writer().unwrap();
    w.put(b"abcd", 42, &[]).unwrap();
    w.commit().unwrap();
    assert_eq!(cache.get(b"abcd").unwrap().unwrap().revision, 42);
    cleanup(&path);
}

#[test]
fn embedder_can_install_a_tracing_subscriber() {
    // slotcache never installs a subscriber itself (see lib.rs docs); an
    // embedder wires one up, typically once in `main`.
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let path = scratch_path("tracing_embedder");
    let cache = Cache::open(OpenOptions::new(&path, 4, 0, 4)).unwrap();
    {
        let mut w = cache.writer().unwrap();
        w.put(b"abcd", 1, &[]).unwrap();
        w.commit().unwrap();
    }
    cache.invalidate().unwrap();
    cleanup(&path);
}

#[test]
fn put_then_delete_in_same_session_allocates_no_slot() {
    let path = scratch_path("put_delete_same_session");
    let cache = Cache::open(OpenOptions::new(&path, 4, 0, 1)).unwrap();
    {
        let mut w = cache.writer().unwrap();
        w.put(b"abcd", 1, &[]).unwrap();
        assert!(w.delete(b"abcd").unwrap());
        w.commit().unwrap();
    }
    assert_eq!(cache.len().unwrap(), 0);
    // Capacity of 1 is still available: the reduced buffer dropped both ops.
    let mut w = cache.writer().unwrap();
    w.put(b"efgh", 2, &[]).unwrap();
    w.commit().unwrap();
    assert_eq!(cache.len().unwrap(), 1);
    cleanup(&path);
}
