//! Open-addressed bucket probing shared by `Get`, `Writer::Delete`,
//! insert placement, and rehash (spec.md §4.3, §4.5, §4.6).

use crate::format::{self, BUCKET_EMPTY, BUCKET_TOMBSTONE};
use crate::layout::{Layout, SlotView};
use std::sync::atomic::Ordering;

/// What a single bucket position currently holds.
#[derive(Debug, Clone, Copy)]
pub enum BucketState {
    Empty,
    Tombstone,
    Full { hash: u64, slot_id: u64 },
}

/// Reads bucket `bucket_id`'s current state.
///
/// # Safety
/// `base` must be a valid mapping of at least `layout.total_file_len()`
/// bytes, and `bucket_id < layout.bucket_count`.
#[inline]
pub unsafe fn read_bucket(layout: &Layout, base: *const u8, bucket_id: u64) -> BucketState {
    let bucket = unsafe { &*layout.bucket_ptr(base, bucket_id) };
    let slot_plus_one = bucket.slot_plus_one.load(Ordering::Acquire);
    match slot_plus_one {
        BUCKET_EMPTY => BucketState::Empty,
        BUCKET_TOMBSTONE => BucketState::Tombstone,
        v => BucketState::Full {
            hash: bucket.hash.load(Ordering::Acquire),
            slot_id: v - 1,
        },
    }
}

/// Iterates bucket positions starting at `hash & mask`, linear-probing
/// forward (wrapping) for at most `bucket_count` steps.
///
/// # Safety
/// Same requirements as [`read_bucket`] for the lifetime of iteration.
pub struct ProbeIter<'a> {
    layout: &'a Layout,
    base: *const u8,
    start: u64,
    step: u64,
}

impl<'a> ProbeIter<'a> {
    /// # Safety
    /// `base` must be valid per [`read_bucket`]'s requirements for as long
    /// as the returned iterator is used.
    #[inline]
    pub unsafe fn new(layout: &'a Layout, base: *const u8, hash: u64) -> Self {
        Self {
            layout,
            base,
            start: hash & layout.mask,
            step: 0,
        }
    }
}

impl Iterator for ProbeIter<'_> {
    /// `(bucket_id, state)`.
    type Item = (u64, BucketState);

    fn next(&mut self) -> Option<Self::Item> {
        if self.step >= self.layout.bucket_count {
            return None;
        }
        let bucket_id = (self.start + self.step) & self.layout.mask;
        self.step += 1;
        // SAFETY: caller of `ProbeIter::new` upheld the pointer validity
        // contract for the iterator's lifetime.
        let state = unsafe { read_bucket(self.layout, self.base, bucket_id) };
        Some((bucket_id, state))
    }
}

/// Result of probing for an existing key.
#[derive(Debug, Clone, Copy)]
pub enum FindResult {
    Found { bucket_id: u64, slot_id: u64 },
    NotFound,
}

/// Probes for `key` (with precomputed `hash`), verifying the candidate
/// slot's stored key actually matches (hash equality alone is not proof).
///
/// # Safety
/// `base` must be a valid mapping of at least `layout.total_file_len()`
/// bytes.
pub unsafe fn find_key(layout: &Layout, base: *const u8, key: &[u8], hash: u64) -> FindResult {
    // SAFETY: delegated to caller's contract.
    let iter = unsafe { ProbeIter::new(layout, base, hash) };
    for (bucket_id, state) in iter {
        match state {
            BucketState::Empty => return FindResult::NotFound,
            BucketState::Tombstone => continue,
            BucketState::Full { hash: h, slot_id } => {
                if h != hash {
                    continue;
                }
                // SAFETY: slot_id was read from a FULL bucket entry; the
                // caller's invariants guarantee it is < slot_capacity.
                let slot = unsafe { SlotView::new(layout.slot_ptr(base, slot_id), layout) };
                if slot.is_used() && slot.key() == key {
                    return FindResult::Found { bucket_id, slot_id };
                }
            }
        }
    }
    FindResult::NotFound
}

/// Convenience: hash + probe for `key`.
///
/// # Safety
/// Same as [`find_key`].
pub unsafe fn find(layout: &Layout, base: *const u8, key: &[u8]) -> FindResult {
    let hash = format::fnv1a64(key);
    unsafe { find_key(layout, base, key, hash) }
}

/// Result of pre-scanning for a free bucket slot to place a new key.
#[derive(Debug, Clone, Copy)]
pub enum FreeSlot {
    At { bucket_id: u64, was_tombstone: bool },
    Exhausted,
}

/// Finds the first `Empty` or `Tombstone` bucket reachable from `hash`'s
/// home position, for inserting a brand-new key.
///
/// # Safety
/// Same as [`find_key`].
pub unsafe fn find_free_slot(layout: &Layout, base: *const u8, hash: u64) -> FreeSlot {
    // SAFETY: delegated to caller's contract.
    let iter = unsafe { ProbeIter::new(layout, base, hash) };
    for (bucket_id, state) in iter {
        match state {
            BucketState::Empty => {
                return FreeSlot::At {
                    bucket_id,
                    was_tombstone: false,
                };
            }
            BucketState::Tombstone => {
                return FreeSlot::At {
                    bucket_id,
                    was_tombstone: true,
                };
            }
            BucketState::Full { .. } => continue,
        }
    }
    FreeSlot::Exhausted
}
