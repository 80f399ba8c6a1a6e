//! Process-wide handle registry (spec.md §4.5, §9).
//!
//! A mapping from canonical file identity to a refcounted entry holding the
//! in-process single-writer guard. This exists because multiple `Cache`
//! handles on the *same* file can exist within one process, and they all
//! need to agree on whether a writer is currently active.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Canonical identity of a cache file: device + inode. Stable under
/// renames/symlinks, unlike the path string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    pub fn of(file: &File) -> io::Result<Self> {
        let meta = file.metadata()?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

/// Per-file registry entry: a handle refcount and the single-in-process-writer
/// guard. The "active writer" in spec.md §9 is modeled as a flag rather than
/// a weak pointer to the `Writer` itself, since the only thing any other
/// code needs to know is whether a writer is currently live.
pub struct RegistryEntry {
    refcount: AtomicUsize,
    writer_active: AtomicBool,
}

impl RegistryEntry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            refcount: AtomicUsize::new(0),
            writer_active: AtomicBool::new(false),
        })
    }

    /// Attempts to claim the single in-process writer slot.
    /// Returns `true` if claimed, `false` if already held.
    pub fn try_claim_writer(&self) -> bool {
        self.writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_writer(&self) {
        self.writer_active.store(false, Ordering::Release);
    }

    pub fn has_active_writer(&self) -> bool {
        self.writer_active.load(Ordering::Acquire)
    }
}

type RegistryMap = HashMap<FileId, Arc<RegistryEntry>>;

fn registry() -> &'static Mutex<RegistryMap> {
    static REGISTRY: OnceLock<Mutex<RegistryMap>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers a handle on `id`, incrementing its refcount (creating the
/// entry on first use).
pub fn acquire(id: FileId) -> Arc<RegistryEntry> {
    let mut map = registry().lock().unwrap_or_else(|e| e.into_inner());
    let entry = map.entry(id).or_insert_with(RegistryEntry::new).clone();
    entry.refcount.fetch_add(1, Ordering::AcqRel);
    entry
}

/// Decrements `id`'s refcount, pruning the entry from the registry once it
/// reaches zero.
pub fn release(id: FileId, entry: &Arc<RegistryEntry>) {
    let mut map = registry().lock().unwrap_or_else(|e| e.into_inner());
    if entry.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
        // We were the last handle; drop the map entry if nobody raced in
        // with a fresh `acquire` in between (refcount would be > 0 again).
        if let Some(current) = map.get(&id) {
            if Arc::ptr_eq(current, entry) && current.refcount.load(Ordering::Acquire) == 0 {
                map.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file() -> File {
        let path = std::env::temp_dir().join(format!(
            "slotcache_registry_test_{}_{}",
            std::process::id(),
            std::sync::atomic::AtomicU64::new(0).fetch_add(1, Ordering::Relaxed)
        ));
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        f.write_all(b"x").unwrap();
        f
    }

    #[test]
    fn writer_slot_is_exclusive_per_file() {
        let file = temp_file();
        let id = FileId::of(&file).unwrap();
        let entry = acquire(id);

        assert!(entry.try_claim_writer());
        assert!(!entry.try_claim_writer(), "second claim must fail");

        entry.release_writer();
        assert!(entry.try_claim_writer(), "writer slot is free again");

        release(id, &entry);
    }

    #[test]
    fn refcount_prunes_entry_on_last_release() {
        let file = temp_file();
        let id = FileId::of(&file).unwrap();
        let a = acquire(id);
        let b = acquire(id);
        assert!(Arc::ptr_eq(&a, &b));

        release(id, &a);
        release(id, &b);

        // A subsequent acquire should build a brand new entry (old one
        // pruned), not reuse stale writer state.
        let c = acquire(id);
        assert!(c.try_claim_writer());
        release(id, &c);
    }
}
