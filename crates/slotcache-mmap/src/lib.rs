//! `slotcache-mmap`: POSIX file + mmap primitives for `slotcache`.
//!
//! This crate is deliberately thin: it owns the `File`/`mmap` lifetime,
//! file creation/sizing, `msync` (via [`memmap2`]'s flush calls), and a
//! cross-process advisory write lock. It has no notion of the slotcache
//! file format — that lives entirely in the `slotcache` crate.

use fs4::FileExt;
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// A read-write memory-mapped file.
///
/// Owns the underlying [`File`] alongside the mapping so the mapping stays
/// valid for as long as the handle is alive.
pub struct MmapFileMut {
    file: File,
    mmap: MmapMut,
}

/// A read-only memory-mapped file.
pub struct MmapFile {
    _file: File,
    mmap: Mmap,
}

impl MmapFileMut {
    /// Creates a new file of exactly `total_len` bytes and maps it `MAP_SHARED`
    /// read-write.
    ///
    /// Fsyncs the file and its containing directory before returning, so a
    /// freshly created cache file is durable even if the process crashes
    /// immediately after `create_sized` returns.
    pub fn create_sized<P: AsRef<Path>>(path: P, total_len: u64) -> io::Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), total_len, "creating mmap file");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_len)?;
        file.sync_all()?;
        fsync_parent_dir(path)?;

        // SAFETY: `file` was just created by us and sized to `total_len`;
        // no other process can be concurrently mutating it through a stale
        // mapping of the same inode because the path is fresh.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { file, mmap })
    }

    /// Opens an existing file and maps it `MAP_SHARED` read-write. Does not
    /// truncate or resize the file.
    pub fn open_existing<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // SAFETY: the file is opened read-write by this process; concurrent
        // mutation from other handles/processes is coordinated above this
        // layer by the seqlock + advisory lock protocol.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { file, mmap })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Synchronously flushes `[offset, offset+len)` to the backing file
    /// (`msync(MS_SYNC)`).
    pub fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        self.mmap.flush_range(offset, len).inspect_err(|e| {
            tracing::warn!(offset, len, error = %e, "flush_range failed");
        })
    }

    /// Asynchronously schedules `[offset, offset+len)` for flush
    /// (`msync(MS_ASYNC)`); returns without waiting for the write to land.
    pub fn flush_async_range(&self, offset: usize, len: usize) -> io::Result<()> {
        self.mmap.flush_async_range(offset, len).inspect_err(|e| {
            tracing::warn!(offset, len, error = %e, "flush_async_range failed");
        })
    }

    /// Synchronously flushes the whole mapping.
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }

    /// Returns the underlying file, e.g. to query metadata for the handle
    /// registry's canonical file identity.
    pub fn file(&self) -> &File {
        &self.file
    }
}

impl MmapFile {
    /// Opens an existing file and maps it `MAP_SHARED` read-only.
    pub fn open_ro<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        // SAFETY: file is opened read-only; writers elsewhere coordinate
        // visibility through the seqlock generation counter.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { _file: file, mmap })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }
}

fn fsync_parent_dir(path: &Path) -> io::Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    let dir = File::open(parent)?;
    dir.sync_all()
}

/// A non-blocking, cross-process exclusive advisory lock backed by a
/// sidecar file (conventionally `<path>.lock`). Carries no data of its own.
pub struct AdvisoryLock {
    file: File,
    locked: bool,
}

impl AdvisoryLock {
    /// Opens (creating if necessary) the lock file at `lock_path` without
    /// acquiring the lock.
    pub fn open<P: AsRef<Path>>(lock_path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(lock_path)?;
        Ok(Self {
            file,
            locked: false,
        })
    }

    /// Attempts to acquire the exclusive lock without blocking.
    ///
    /// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if another
    /// holder has it (the caller should surface this as a busy condition,
    /// never block waiting for the OS to grant it).
    pub fn try_acquire(&mut self) -> io::Result<bool> {
        match self.file.try_lock_exclusive() {
            Ok(()) => {
                self.locked = true;
                Ok(true)
            }
            Err(e) if is_would_block(&e) => {
                tracing::debug!("advisory lock contended");
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(error = %e, "advisory lock acquisition failed");
                Err(e)
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Releases the lock if held. Idempotent.
    pub fn release(&mut self) -> io::Result<()> {
        if self.locked {
            self.file.unlock()?;
            self.locked = false;
        }
        Ok(())
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn is_would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::PermissionDenied
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn scratch_path(tag: &str) -> std::path::PathBuf {
        let pid = std::process::id();
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("slotcache_mmap_test_{tag}_{pid}_{n}"))
    }

    #[test]
    fn mmap_roundtrip_bytes() {
        let path = scratch_path("roundtrip");
        {
            let mut mm = MmapFileMut::create_sized(&path, 4096).unwrap();
            unsafe {
                let p = mm.as_mut_ptr();
                *p.add(0) = 0xAB;
                *p.add(1) = 0xCD;
            }
            mm.flush().unwrap();
        }
        {
            let mm = MmapFile::open_ro(&path).unwrap();
            unsafe {
                let p = mm.as_ptr();
                assert_eq!(*p.add(0), 0xAB);
                assert_eq!(*p.add(1), 0xCD);
            }
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn open_existing_sees_prior_writes() {
        let path = scratch_path("open_existing");
        {
            let mut mm = MmapFileMut::create_sized(&path, 64).unwrap();
            unsafe { *mm.as_mut_ptr().add(10) = 0x42 };
            mm.flush().unwrap();
        }
        {
            let mm = MmapFileMut::open_existing(&path).unwrap();
            assert_eq!(mm.len(), 64);
            unsafe { assert_eq!(*mm.as_ptr().add(10), 0x42) };
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn advisory_lock_is_exclusive_across_handles() {
        let path = scratch_path("lock");
        let mut a = AdvisoryLock::open(&path).unwrap();
        let mut b = AdvisoryLock::open(&path).unwrap();

        assert!(a.try_acquire().unwrap());
        assert!(!b.try_acquire().unwrap(), "second holder must not acquire");

        a.release().unwrap();
        assert!(b.try_acquire().unwrap(), "lock is free after release");

        let _ = fs::remove_file(&path);
    }
}
