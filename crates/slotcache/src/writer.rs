//! The buffered writer and its 7-step commit protocol (spec.md §4.5, §4.6).

use crate::cache::Cache;
use crate::error::{Result, SlotCacheError};
use crate::format::{self, HEADER_SIZE};
use crate::layout::{SlotViewMut, SLOT_META_USED};
use crate::options::WritebackMode;
use crate::probe;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone)]
enum WriterOp {
    Put { key: Vec<u8>, revision: i64, index: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl WriterOp {
    fn key(&self) -> &[u8] {
        match self {
            WriterOp::Put { key, .. } | WriterOp::Delete { key } => key,
        }
    }
}

/// Tracks the smallest byte range touched within a region, for a single
/// `msync` call covering exactly what changed.
#[derive(Debug, Clone, Copy, Default)]
struct DirtyRange {
    span: Option<(usize, usize)>,
}

impl DirtyRange {
    fn touch(&mut self, offset: usize, len: usize) {
        let end = offset + len;
        self.span = Some(match self.span {
            Some((lo, hi)) => (lo.min(offset), hi.max(end)),
            None => (offset, end),
        });
    }

    fn touch_all(&mut self, offset: u64, len: u64) {
        self.touch(offset as usize, len as usize);
    }

    fn flush(&self, mm: &slotcache_mmap::MmapFileMut, sync: bool) -> std::io::Result<()> {
        let Some((lo, hi)) = self.span else {
            return Ok(());
        };
        if sync {
            mm.flush_range(lo, hi - lo)
        } else {
            mm.flush_async_range(lo, hi - lo)
        }
    }
}

/// A single in-flight writer session bound to one [`Cache`] handle.
///
/// Not `Send`: a writer is used from the thread that created it, matching
/// spec.md §5's "bound to the thread that created them" rule.
pub struct Writer<'a> {
    cache: &'a Cache,
    ops: Vec<WriterOp>,
    pending_user_flags: Option<u64>,
    pending_user_data: Option<[u8; 64]>,
    closed: bool,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(cache: &'a Cache) -> Self {
        Self {
            cache,
            ops: Vec::new(),
            pending_user_flags: None,
            pending_user_data: None,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(SlotCacheError::Closed);
        }
        Ok(())
    }

    fn push(&mut self, op: WriterOp) -> Result<()> {
        if self.ops.len() >= format::WRITER_BUFFER_CAP {
            return Err(SlotCacheError::BufferFull {
                cap: format::WRITER_BUFFER_CAP,
            });
        }
        self.ops.push(op);
        Ok(())
    }

    /// Buffers an insert-or-update. Not applied until [`Writer::commit`].
    pub fn put(&mut self, key: &[u8], revision: i64, index: &[u8]) -> Result<()> {
        self.check_open()?;
        let layout = &self.cache.layout;
        if key.len() != layout.key_size {
            return Err(SlotCacheError::invalid_input(format!(
                "key length {} does not match key_size {}",
                key.len(),
                layout.key_size
            )));
        }
        if index.len() != layout.index_size {
            return Err(SlotCacheError::invalid_input(format!(
                "index length {} does not match index_size {}",
                index.len(),
                layout.index_size
            )));
        }
        self.push(WriterOp::Put {
            key: key.to_vec(),
            revision,
            index: index.to_vec(),
        })
    }

    /// Buffers a delete. Returns whether the key is "effectively present"
    /// given everything buffered so far plus on-disk state.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.check_open()?;
        if key.len() != self.cache.layout.key_size {
            return Err(SlotCacheError::invalid_input(format!(
                "key length {} does not match key_size {}",
                key.len(),
                self.cache.layout.key_size
            )));
        }

        let present = match self.ops.iter().rev().find(|op| op.key() == key) {
            Some(WriterOp::Put { .. }) => true,
            Some(WriterOp::Delete { .. }) => false,
            None => {
                // SAFETY: the writer holds exclusive access to the mapping
                // (no commit is concurrently in flight), so a direct,
                // non-seqlocked probe is sound.
                matches!(
                    unsafe { probe::find(&self.cache.layout, self.cache.base_ptr(), key) },
                    probe::FindResult::Found { .. }
                )
            }
        };

        self.push(WriterOp::Delete { key: key.to_vec() })?;
        Ok(present)
    }

    pub fn set_user_header_flags(&mut self, flags: u64) -> Result<()> {
        self.check_open()?;
        self.pending_user_flags = Some(flags);
        Ok(())
    }

    pub fn set_user_header_data(&mut self, data: [u8; 64]) -> Result<()> {
        self.check_open()?;
        self.pending_user_data = Some(data);
        Ok(())
    }

    /// Idempotent. Discards any buffered (uncommitted) operations.
    pub fn close(mut self) -> Result<()> {
        self.close_mut()
    }

    fn close_mut(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.ops.clear();
        self.cache.on_writer_closed();
        Ok(())
    }

    /// Reduces the buffer to the last op per key, preserving the order of
    /// each surviving op's last occurrence (spec.md §4.5 step 1).
    fn reduce(&self) -> Vec<WriterOp> {
        let mut seen = std::collections::HashSet::new();
        let mut rev: Vec<WriterOp> = Vec::with_capacity(self.ops.len());
        for op in self.ops.iter().rev() {
            if seen.insert(op.key().to_vec()) {
                rev.push(op.clone());
            }
        }
        rev.reverse();
        rev
    }

    /// Runs the 7-step commit protocol. On any error other than
    /// [`SlotCacheError::Writeback`], no state change is visible (preflight
    /// failures) or the file is left in a state already classified as
    /// [`SlotCacheError::Corrupt`] (mid-apply invariant violations).
    pub fn commit(mut self) -> Result<()> {
        let result = self.commit_inner();
        self.close_mut()?;
        result
    }

    fn commit_inner(&mut self) -> Result<()> {
        self.check_open()?;
        let cache = self.cache;
        let layout = cache.layout;
        let base = cache.base_ptr();
        let header = {
            // SAFETY: `base` maps at least HEADER_SIZE bytes for the
            // cache's lifetime.
            unsafe { crate::header::HeaderRaw::from_mut_ptr(base) }
        };

        // Step 1: reduce.
        let reduced = self.reduce();

        // Step 2: categorize against disk state.
        let mut updates: Vec<(u64, i64, Vec<u8>)> = Vec::new(); // (slot_id, revision, index)
        let mut inserts: Vec<(Vec<u8>, i64, Vec<u8>)> = Vec::new();
        let mut deletes: Vec<Vec<u8>> = Vec::new();
        for op in &reduced {
            // SAFETY: writer holds exclusive access; no commit is concurrently
            // in flight against this mapping.
            let found = unsafe { probe::find(&layout, base, op.key()) };
            match op {
                WriterOp::Put { key, revision, index } => match found {
                    probe::FindResult::Found { slot_id, .. } => {
                        updates.push((slot_id, *revision, index.clone()));
                    }
                    probe::FindResult::NotFound => {
                        inserts.push((key.clone(), *revision, index.clone()));
                    }
                },
                WriterOp::Delete { key } => {
                    if let probe::FindResult::Found { .. } = found {
                        deletes.push(key.clone());
                    }
                    // delete-of-absent: dropped.
                }
            }
        }

        // Step 3: preflight.
        let slot_highwater = header.slot_highwater.load(Ordering::Acquire);
        if slot_highwater + inserts.len() as u64 > layout.slot_capacity {
            return Err(SlotCacheError::Full);
        }
        if layout.ordered_keys {
            inserts.sort_by(|a, b| a.0.cmp(&b.0));
            if slot_highwater > 0 {
                // SAFETY: slot_highwater - 1 < slot_capacity.
                let tail = unsafe {
                    crate::layout::SlotView::new(layout.slot_ptr(base, slot_highwater - 1), &layout)
                };
                let tail_key = tail.key();
                if let Some((first_key, ..)) = inserts.first()
                    && first_key.as_slice() < tail_key
                {
                    return Err(SlotCacheError::OutOfOrderInsert);
                }
            }
        }

        // Step 4: publish odd generation. A flush failure here does not
        // abort the commit (spec.md §4.5 step 7): it is recorded and
        // surfaced as ErrWriteback only after the even generation below is
        // republished, so a transient msync failure never strands the file
        // at odd generation.
        header.generation.fetch_add(1, Ordering::AcqRel);
        let sync = self.cache.options.writeback == WritebackMode::Sync;
        let mut writeback_err = None;
        if sync && let Err(e) = self.flush_header() {
            writeback_err = Some(e);
        }

        // Step 5: apply.
        let mut slot_dirty = DirtyRange::default();
        let mut bucket_dirty = DirtyRange::default();
        let mut filled_tombstones: u64 = 0;

        for (slot_id, revision, index) in &updates {
            // SAFETY: slot_id came from a successful probe against this
            // exact layout/mapping.
            let view = unsafe { SlotViewMut::new(layout.slot_mut_ptr(base, *slot_id), &layout) };
            view.set_revision(*revision);
            view.set_index(index);
            slot_dirty.touch_all(layout.slots_offset + slot_id * layout.slot_size as u64, layout.slot_size as u64);
        }

        for key in &deletes {
            // SAFETY: as above.
            let found = unsafe { probe::find(&layout, base, key) };
            let probe::FindResult::Found { bucket_id, slot_id } = found else {
                return Err(SlotCacheError::corrupt(
                    "delete target vanished from the bucket index mid-commit",
                ));
            };
            // SAFETY: bucket_id < bucket_count.
            let bucket = unsafe { &*layout.bucket_ptr(base, bucket_id) };
            bucket.slot_plus_one.store(format::BUCKET_TOMBSTONE, Ordering::Release);
            // SAFETY: slot_id < slot_capacity.
            let view = unsafe { SlotViewMut::new(layout.slot_mut_ptr(base, slot_id), &layout) };
            view.set_meta(0);
            header.bucket_tombstones.fetch_add(1, Ordering::AcqRel);
            slot_dirty.touch_all(layout.slots_offset + slot_id * layout.slot_size as u64, layout.slot_size as u64);
            bucket_dirty.touch_all(layout.buckets_offset + bucket_id * format::BUCKET_ENTRY_SIZE, format::BUCKET_ENTRY_SIZE);
        }

        let mut next_highwater = slot_highwater;
        for (key, revision, index) in &inserts {
            let hash = format::fnv1a64(key);
            // SAFETY: as above.
            let free = unsafe { probe::find_free_slot(&layout, base, hash) };
            let probe::FreeSlot::At { bucket_id, was_tombstone } = free else {
                return Err(SlotCacheError::corrupt(
                    "no free bucket slot found for insert despite load-factor invariant",
                ));
            };
            let slot_id = next_highwater;
            next_highwater += 1;
            // SAFETY: slot_id < slot_capacity, checked by the preflight above.
            let view = unsafe { SlotViewMut::new(layout.slot_mut_ptr(base, slot_id), &layout) };
            view.set_meta(SLOT_META_USED);
            view.set_key(key);
            view.set_revision(*revision);
            view.set_index(index);
            // SAFETY: bucket_id < bucket_count.
            let bucket = unsafe { &*layout.bucket_ptr(base, bucket_id) };
            bucket.hash.store(hash, Ordering::Release);
            bucket.slot_plus_one.store(slot_id + 1, Ordering::Release);
            if was_tombstone {
                filled_tombstones += 1;
            }
            slot_dirty.touch_all(layout.slots_offset + slot_id * layout.slot_size as u64, layout.slot_size as u64);
            bucket_dirty.touch_all(layout.buckets_offset + bucket_id * format::BUCKET_ENTRY_SIZE, format::BUCKET_ENTRY_SIZE);
        }

        // Step 6: header counters + rehash.
        let old_live = header.live_count.load(Ordering::Acquire);
        let new_live = old_live - deletes.len() as u64 + inserts.len() as u64;
        header.live_count.store(new_live, Ordering::Release);
        header.bucket_used.store(new_live, Ordering::Release);
        header.slot_highwater.store(next_highwater, Ordering::Release);

        let old_tombstones = header.bucket_tombstones.load(Ordering::Acquire);
        let new_tombstones = old_tombstones
            .checked_sub(filled_tombstones)
            .ok_or_else(|| SlotCacheError::corrupt("bucket_tombstones underflowed during commit"))?;
        header.bucket_tombstones.store(new_tombstones, Ordering::Release);

        let bucket_count = header.bucket_count.load(Ordering::Acquire);
        let rehashed = (new_tombstones as f64) / (bucket_count as f64) > format::REHASH_TOMBSTONE_RATIO;
        if rehashed {
            tracing::debug!(new_tombstones, bucket_count, "tombstone ratio exceeded; rebuilding bucket array");
            self.rehash(header, &layout, base, next_highwater)?;
            bucket_dirty.touch_all(layout.buckets_offset, bucket_count * format::BUCKET_ENTRY_SIZE);
        }

        // Step 7: user header, CRC, publish even generation.
        if let Some(flags) = self.pending_user_flags {
            header.user_flags.store(flags, Ordering::Release);
        }
        if let Some(data) = self.pending_user_data {
            header.store_user_data(data);
        }
        header.recompute_crc();

        if sync {
            if let Err(e) = self.flush_header() {
                writeback_err = Some(e);
            }
            if let Err(e) = slot_dirty.flush(self.cache.mm(), true) {
                writeback_err = Some(e);
            }
            if let Err(e) = bucket_dirty.flush(self.cache.mm(), true) {
                writeback_err = Some(e);
            }
        }

        header.generation.fetch_add(1, Ordering::AcqRel);

        if sync {
            if let Err(e) = self.flush_header() {
                writeback_err = Some(e);
            }
        } else if self.cache.options.writeback == WritebackMode::Async {
            let _ = self.flush_header_async();
            let _ = slot_dirty.flush(self.cache.mm(), false);
            let _ = bucket_dirty.flush(self.cache.mm(), false);
        }

        if let Some(e) = writeback_err {
            tracing::warn!(error = %e, "msync failed during commit; data is live in memory but not guaranteed durable");
            return Err(SlotCacheError::Writeback { source: e });
        }
        tracing::debug!(updates = updates.len(), inserts = inserts.len(), deletes = deletes.len(), "commit applied");
        Ok(())
    }

    fn flush_header(&self) -> std::io::Result<()> {
        self.cache.mm().flush_range(0, HEADER_SIZE as usize)
    }

    fn flush_header_async(&self) -> std::io::Result<()> {
        self.cache.mm().flush_async_range(0, HEADER_SIZE as usize)
    }

    /// Rebuilds the bucket array from scratch: clear to EMPTY, then
    /// re-insert one FULL entry per live slot (spec.md §4.6).
    fn rehash(
        &self,
        header: &crate::header::HeaderRaw,
        layout: &crate::layout::Layout,
        base: *mut u8,
        highwater: u64,
    ) -> Result<()> {
        for bucket_id in 0..layout.bucket_count {
            // SAFETY: bucket_id < bucket_count.
            let bucket = unsafe { &*layout.bucket_ptr(base, bucket_id) };
            bucket.hash.store(0, Ordering::Relaxed);
            bucket.slot_plus_one.store(format::BUCKET_EMPTY, Ordering::Relaxed);
        }
        for slot_id in 0..highwater {
            // SAFETY: slot_id < slot_capacity.
            let view = unsafe { crate::layout::SlotView::new(layout.slot_ptr(base, slot_id), layout) };
            if !view.is_used() {
                continue;
            }
            let hash = format::fnv1a64(view.key());
            // SAFETY: as above.
            let free = unsafe { probe::find_free_slot(layout, base, hash) };
            let probe::FreeSlot::At { bucket_id, .. } = free else {
                return Err(SlotCacheError::corrupt(
                    "rehash could not place a live slot: bucket array exhausted",
                ));
            };
            // SAFETY: bucket_id < bucket_count.
            let bucket = unsafe { &*layout.bucket_ptr(base, bucket_id) };
            bucket.hash.store(hash, Ordering::Release);
            bucket.slot_plus_one.store(slot_id + 1, Ordering::Release);
        }
        header.bucket_tombstones.store(0, Ordering::Release);
        Ok(())
    }
}

impl Drop for Writer<'_> {
    fn drop(&mut self) {
        let _ = self.close_mut();
    }
}
