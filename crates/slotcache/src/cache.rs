//! `Cache` lifecycle (`Open`/`Close`/`Invalidate`) and the seqlock-protected
//! read surface (spec.md §4.1, §4.2, §4.3, §4.4).

use crate::entry::{Entry, PrefixSpec, ScanOptions};
use crate::error::{Result, SlotCacheError};
use crate::format::{self, HEADER_SIZE};
use crate::header::HeaderRaw;
use crate::layout::{Layout, SlotView};
use crate::options::OpenOptions;
use crate::probe;
use crate::registry::{self, FileId, RegistryEntry};
use crate::seqlock::read_seqlocked;
use crate::writer::Writer;
use slotcache_mmap::{AdvisoryLock, MmapFileMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// An open handle on a slotcache file.
///
/// `Cache` is `Sync`: every read method goes through the seqlock protocol
/// and never requires `&mut self`. Only one `Writer` may be live per handle
/// at a time (enforced by the process-wide registry), and a `Writer` is
/// bound to the thread that created it (spec.md §5).
pub struct Cache {
    mm: MmapFileMut,
    base: *mut u8,
    pub(crate) layout: Layout,
    pub(crate) options: OpenOptions,
    file_id: FileId,
    registry_entry: Arc<RegistryEntry>,
    pub(crate) lock: Mutex<AdvisoryLock>,
    own_writer_active: AtomicBool,
    closed: AtomicBool,
}

// SAFETY: all access to `base` goes through the seqlock protocol for reads
// and through the single-writer guard (registry + advisory lock) for
// writes; the mapping itself is `MAP_SHARED` and safe to touch from any
// thread once those protocols are respected.
unsafe impl Send for Cache {}
unsafe impl Sync for Cache {}

impl Cache {
    /// Opens (creating if necessary) the cache file named by `options.path`.
    pub fn open(options: OpenOptions) -> Result<Self> {
        options.validate()?;

        let exists_nonempty = std::fs::metadata(&options.path)
            .map(|m| m.len() > 0)
            .unwrap_or(false);

        let (mm, layout) = if exists_nonempty {
            tracing::debug!(path = %options.path.display(), "opening existing cache file");
            Self::open_existing(&options)?
        } else {
            tracing::debug!(path = %options.path.display(), "creating new cache file");
            Self::create_new(&options)?
        };

        let file_id = FileId::of(mm.file()).map_err(|e| {
            SlotCacheError::corrupt(format!("failed to stat cache file: {e}"))
        })?;
        let registry_entry = registry::acquire(file_id);
        let lock = AdvisoryLock::open(options.lock_path()).map_err(|e| {
            SlotCacheError::corrupt(format!("failed to open advisory lock file: {e}"))
        })?;

        let mut mm = mm;
        let base = mm.as_mut_ptr();

        Ok(Self {
            mm,
            base,
            layout,
            options,
            file_id,
            registry_entry,
            lock: Mutex::new(lock),
            own_writer_active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn create_new(options: &OpenOptions) -> Result<(MmapFileMut, Layout)> {
        let layout = Layout::new(
            options.key_size,
            options.index_size,
            options.slot_capacity,
            options.ordered_keys,
        );
        let total_len = layout.total_file_len();
        let mut mm = MmapFileMut::create_sized(&options.path, total_len)
            .map_err(|e| SlotCacheError::corrupt(format!("failed to create cache file: {e}")))?;

        let base = mm.as_mut_ptr();
        // SAFETY: `base` points to a freshly sized, zero-filled mapping of
        // at least `HEADER_SIZE` bytes; `Cache::open` has exclusive access
        // to it (no other handle exists on this brand new file yet).
        let header = unsafe { HeaderRaw::from_mut_ptr(base) };
        let flags = if options.ordered_keys {
            format::FLAG_ORDERED_KEYS
        } else {
            0
        };
        header.magic.store(u32::from_le_bytes(format::MAGIC), Ordering::Relaxed);
        header.version.store(format::VERSION, Ordering::Relaxed);
        header.header_size.store(HEADER_SIZE, Ordering::Relaxed);
        header.key_size.store(options.key_size as u32, Ordering::Relaxed);
        header.index_size.store(options.index_size as u32, Ordering::Relaxed);
        header.slot_size.store(layout.slot_size as u32, Ordering::Relaxed);
        header.hash_alg.store(format::HASH_ALG_FNV1A64, Ordering::Relaxed);
        header.flags.store(flags, Ordering::Relaxed);
        header.slot_capacity.store(layout.slot_capacity, Ordering::Relaxed);
        header.user_version.store(options.user_version, Ordering::Relaxed);
        header.bucket_count.store(layout.bucket_count, Ordering::Relaxed);
        header.slots_offset.store(layout.slots_offset, Ordering::Relaxed);
        header.buckets_offset.store(layout.buckets_offset, Ordering::Relaxed);
        header.state.store(format::STATE_NORMAL, Ordering::Relaxed);
        // slot_highwater, live_count, generation, bucket_used,
        // bucket_tombstones, user_flags, user_data, reserved_tail are all
        // already zero from the file's fresh zero-fill.
        header.recompute_crc();

        mm.flush().map_err(|e| SlotCacheError::corrupt(format!("failed to sync new cache file: {e}")))?;
        Ok((mm, layout))
    }

    fn open_existing(options: &OpenOptions) -> Result<(MmapFileMut, Layout)> {
        let mm = MmapFileMut::open_existing(&options.path)
            .map_err(|e| SlotCacheError::corrupt(format!("failed to open cache file: {e}")))?;
        if mm.len() < HEADER_SIZE as usize {
            return Err(SlotCacheError::corrupt("file shorter than the 256-byte header"));
        }

        // SAFETY: `mm` maps at least HEADER_SIZE bytes, just checked above.
        let header = unsafe { HeaderRaw::from_ptr(mm.as_ptr()) };

        // Step 1: magic/version/header_size.
        if header.magic.load(Ordering::Relaxed) != u32::from_le_bytes(format::MAGIC)
            || header.version.load(Ordering::Relaxed) != format::VERSION
            || header.header_size.load(Ordering::Relaxed) != HEADER_SIZE
        {
            return Err(SlotCacheError::incompatible(
                "magic/version/header_size mismatch",
            ));
        }

        // Step 2: invalidated state is checked before anything else.
        if header.state.load(Ordering::Relaxed) == format::STATE_INVALIDATED {
            return Err(SlotCacheError::Invalidated);
        }

        // Step 3: flags / hash_alg / reserved bytes.
        let flags = header.flags.load(Ordering::Relaxed);
        let ordered_flag_set = flags & format::FLAG_ORDERED_KEYS != 0;
        if ordered_flag_set != options.ordered_keys
            || flags & !format::FLAGS_KNOWN_MASK != 0
            || header.hash_alg.load(Ordering::Relaxed) != format::HASH_ALG_FNV1A64
            || header.reserved_tail.iter().any(|&b| b != 0)
            || header.state.load(Ordering::Relaxed) > format::STATE_INVALIDATED
        {
            return Err(SlotCacheError::incompatible(
                "flags/hash_alg/reserved bytes do not match this file's format",
            ));
        }

        // Step 4: geometry options frozen at create.
        if header.key_size.load(Ordering::Relaxed) as usize != options.key_size
            || header.index_size.load(Ordering::Relaxed) as usize != options.index_size
            || header.user_version.load(Ordering::Relaxed) != options.user_version
            || header.slot_capacity.load(Ordering::Relaxed) != options.slot_capacity
        {
            return Err(SlotCacheError::incompatible(
                "key_size/index_size/user_version/slot_capacity do not match the open options",
            ));
        }

        let layout = Layout::new(
            options.key_size,
            options.index_size,
            options.slot_capacity,
            options.ordered_keys,
        );

        // Step 5: derived geometry must match what's on disk.
        if header.slot_size.load(Ordering::Relaxed) as usize != layout.slot_size
            || header.slots_offset.load(Ordering::Relaxed) != layout.slots_offset
            || header.buckets_offset.load(Ordering::Relaxed) != layout.buckets_offset
            || mm.len() as u64 != layout.total_file_len()
        {
            return Err(SlotCacheError::corrupt(
                "derived slot_size/offsets/file length do not match header",
            ));
        }

        // Step 6: bucket_count and counter ranges.
        let bucket_count = header.bucket_count.load(Ordering::Relaxed);
        let slot_highwater = header.slot_highwater.load(Ordering::Relaxed);
        let live_count = header.live_count.load(Ordering::Relaxed);
        let bucket_used = header.bucket_used.load(Ordering::Relaxed);
        let bucket_tombstones = header.bucket_tombstones.load(Ordering::Relaxed);
        if bucket_count != layout.bucket_count
            || !bucket_count.is_power_of_two()
            || bucket_count < 1
            || slot_highwater > layout.slot_capacity
            || live_count > slot_highwater
            || bucket_used != live_count
            || bucket_used.saturating_add(bucket_tombstones) > bucket_count
        {
            return Err(SlotCacheError::corrupt(
                "bucket_count/slot_highwater/live_count/bucket_used/bucket_tombstones violate invariants",
            ));
        }

        // Step 7: header CRC.
        if !header.crc_matches() {
            return Err(SlotCacheError::corrupt("header CRC32-C mismatch"));
        }

        // Step 8: sample bucket positions for obviously out-of-range slot ids.
        let samples = bucket_count.min(8);
        for i in 0..samples {
            let idx = i * bucket_count / samples;
            // SAFETY: idx < bucket_count, mm maps at least total_file_len bytes.
            if let probe::BucketState::Full { slot_id, .. } =
                unsafe { probe::read_bucket(&layout, mm.as_ptr(), idx) }
                && slot_id >= slot_highwater
            {
                tracing::warn!(
                    path = %options.path.display(),
                    slot_id,
                    slot_highwater,
                    "rejecting open: sampled bucket entry out of range"
                );
                return Err(SlotCacheError::corrupt(
                    "sampled bucket entry references a slot past slot_highwater",
                ));
            }
        }

        // Step 9: odd generation means either an in-flight writer (if the
        // advisory lock is held elsewhere) or a crashed one (corrupt).
        let generation = header.generation.load(Ordering::Relaxed);
        if generation % 2 == 1 {
            let mut probe_lock = AdvisoryLock::open(options.lock_path())
                .map_err(|e| SlotCacheError::corrupt(format!("failed to open advisory lock file: {e}")))?;
            match probe_lock.try_acquire() {
                Ok(true) => {
                    probe_lock
                        .release()
                        .map_err(|e| SlotCacheError::corrupt(format!("failed to release probe lock: {e}")))?;
                    return Err(SlotCacheError::corrupt(
                        "odd generation with no lock holder (crashed writer)",
                    ));
                }
                Ok(false) => {
                    return Err(SlotCacheError::Busy(
                        "odd generation and advisory lock held by another writer",
                    ));
                }
                Err(e) => {
                    return Err(SlotCacheError::corrupt(format!(
                        "failed to probe advisory lock during odd-generation check: {e}"
                    )));
                }
            }
        }

        Ok((mm, layout))
    }

    #[inline]
    fn header(&self) -> &HeaderRaw {
        // SAFETY: `base` was obtained from `mm.as_mut_ptr()` at construction
        // and the mapping is at least `layout.total_file_len()` bytes for
        // the lifetime of `self`.
        unsafe { HeaderRaw::from_ptr(self.base) }
    }

    #[inline]
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SlotCacheError::Closed);
        }
        Ok(())
    }

    #[inline]
    fn check_not_invalidated(&self) -> Result<()> {
        if self.header().state.load(Ordering::Acquire) == format::STATE_INVALIDATED {
            return Err(SlotCacheError::Invalidated);
        }
        Ok(())
    }

    fn precheck_read(&self) -> Result<()> {
        self.check_open()?;
        self.check_not_invalidated()
    }

    /// Idempotent. Returns `ErrBusy` if a writer created from this handle
    /// is still open.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.own_writer_active.load(Ordering::Acquire) {
            self.closed.store(false, Ordering::Release);
            return Err(SlotCacheError::Busy("a writer on this handle is still open"));
        }
        tracing::debug!(path = %self.options.path.display(), "closing cache handle");
        registry::release(self.file_id, &self.registry_entry);
        Ok(())
    }

    /// Sets `state = invalidated` and syncs the header. Terminal: visible
    /// to every handle on this file, in this process or any other.
    pub fn invalidate(&self) -> Result<()> {
        self.check_open()?;
        if self.registry_entry.has_active_writer() {
            return Err(SlotCacheError::Busy(
                "a writer is active in-process on this file",
            ));
        }
        let header = self.header();
        header.state.store(format::STATE_INVALIDATED, Ordering::Release);
        header.recompute_crc();
        if self.options.writeback != crate::options::WritebackMode::None {
            self.mm
                .flush_range(0, HEADER_SIZE as usize)
                .map_err(|e| SlotCacheError::Writeback { source: e })?;
        }
        tracing::warn!(path = %self.options.path.display(), "cache invalidated");
        Ok(())
    }

    /// Acquires the single writer for this handle (spec.md §4.5).
    pub fn writer(&self) -> Result<Writer<'_>> {
        self.precheck_read()?;
        if !self.registry_entry.try_claim_writer() {
            return Err(SlotCacheError::Busy(
                "another writer is active in-process on this file",
            ));
        }
        if !self.options.disable_locking {
            let mut lock = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            match lock.try_acquire() {
                Ok(true) => {}
                Ok(false) => {
                    drop(lock);
                    self.registry_entry.release_writer();
                    return Err(SlotCacheError::Busy(
                        "advisory write lock held by another process",
                    ));
                }
                Err(e) => {
                    drop(lock);
                    self.registry_entry.release_writer();
                    return Err(SlotCacheError::corrupt(format!(
                        "failed to acquire advisory lock: {e}"
                    )));
                }
            }
        }
        self.own_writer_active.store(true, Ordering::Release);
        Ok(Writer::new(self))
    }

    pub(crate) fn on_writer_closed(&self) {
        if !self.options.disable_locking {
            let mut lock = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            let _ = lock.release();
        }
        self.own_writer_active.store(false, Ordering::Release);
        self.registry_entry.release_writer();
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    pub(crate) fn mm(&self) -> &MmapFileMut {
        &self.mm
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<u64> {
        self.precheck_read()?;
        read_seqlocked(self.header(), || self.header().live_count.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Current seqlock generation. Even when stable.
    pub fn generation(&self) -> Result<u64> {
        self.check_open()?;
        self.check_not_invalidated()?;
        Ok(self.header().generation.load(Ordering::Acquire))
    }

    pub fn user_header(&self) -> Result<(u64, [u8; 64])> {
        self.precheck_read()?;
        read_seqlocked(self.header(), || {
            let flags = self.header().user_flags.load(Ordering::Acquire);
            (flags, self.header().user_data)
        })
    }

    /// Point lookup (spec.md §4.3).
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.precheck_read()?;
        if key.len() != self.layout.key_size {
            return Err(SlotCacheError::invalid_input(format!(
                "key length {} does not match key_size {}",
                key.len(),
                self.layout.key_size
            )));
        }
        read_seqlocked(self.header(), || {
            // SAFETY: `self.base` maps at least `layout.total_file_len()`
            // bytes for `self`'s lifetime.
            match unsafe { probe::find(&self.layout, self.base, key) } {
                probe::FindResult::Found { slot_id, .. } => {
                    // SAFETY: slot_id < slot_capacity, guaranteed by `find`.
                    let view = unsafe { SlotView::new(self.layout.slot_ptr(self.base, slot_id), &self.layout) };
                    Some(Entry {
                        key: view.key().to_vec(),
                        revision: view.revision(),
                        index: view.index().to_vec(),
                    })
                }
                probe::FindResult::NotFound => None,
            }
        })
    }

    fn collect_matching(&self, mut pred: impl FnMut(&Entry) -> bool, opts: &ScanOptions) -> Vec<Entry> {
        let mut matched = Vec::new();
        let highwater = self.header().slot_highwater.load(Ordering::Acquire);
        for slot_id in 0..highwater {
            // SAFETY: slot_id < slot_highwater <= slot_capacity.
            let view = unsafe { SlotView::new(self.layout.slot_ptr(self.base, slot_id), &self.layout) };
            if !view.is_used() {
                continue;
            }
            let entry = Entry {
                key: view.key().to_vec(),
                revision: view.revision(),
                index: view.index().to_vec(),
            };
            if pred(&entry) && opts.matches(&entry) {
                matched.push(entry);
            }
        }
        // For ordered_keys caches the 0..highwater scan already yields
        // ascending key order: inserts are appended in sorted order (the
        // writer's preflight rejects an out-of-order insert) and deletes only
        // clear a slot's used bit without reshuffling survivors, so there is
        // nothing left to sort here.
        if opts.reverse {
            matched.reverse();
        }
        let start = opts.offset.min(matched.len());
        let end = if opts.limit == 0 {
            matched.len()
        } else {
            (start + opts.limit).min(matched.len())
        };
        matched[start..end].to_vec()
    }

    /// Full scan (spec.md §4.4).
    pub fn scan(&self, opts: &ScanOptions) -> Result<Vec<Entry>> {
        self.precheck_read()?;
        read_seqlocked(self.header(), || self.collect_matching(|_| true, opts))
    }

    /// Whole-byte prefix scan.
    pub fn scan_prefix(&self, prefix: &[u8], opts: &ScanOptions) -> Result<Vec<Entry>> {
        self.precheck_read()?;
        if prefix.is_empty() || prefix.len() > self.layout.key_size {
            return Err(SlotCacheError::invalid_input(format!(
                "prefix length must be in 1..={}, got {}",
                self.layout.key_size,
                prefix.len()
            )));
        }
        read_seqlocked(self.header(), || {
            self.collect_matching(|e| e.key.starts_with(prefix), opts)
        })
    }

    /// Generalized, optionally bit-granular, prefix scan.
    pub fn scan_match(&self, spec: &PrefixSpec, opts: &ScanOptions) -> Result<Vec<Entry>> {
        self.precheck_read()?;
        spec.validate(self.layout.key_size)?;
        read_seqlocked(self.header(), || self.collect_matching(|e| spec.matches(&e.key), opts))
    }

    /// Ordered-key range scan: `start <= key < end`. Requires `ordered_keys`.
    pub fn scan_range(&self, start: Option<&[u8]>, end: Option<&[u8]>, opts: &ScanOptions) -> Result<Vec<Entry>> {
        self.precheck_read()?;
        if !self.layout.ordered_keys {
            return Err(SlotCacheError::invalid_input(
                "ScanRange requires ordered_keys to be enabled",
            ));
        }
        read_seqlocked(self.header(), || {
            self.collect_matching(
                |e| {
                    start.is_none_or(|s| e.key.as_slice() >= s) && end.is_none_or(|en| e.key.as_slice() < en)
                },
                opts,
            )
        })
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
