//! Slot array and bucket array geometry, and the raw typed accessors used
//! to read/write individual slots and bucket entries through the mmap.
//!
//! Slots are not a compile-time Rust type: `key_size`/`index_size` are
//! runtime options (1..=32 / 0..=32 bytes), so a slot is a computed byte
//! span accessed through [`Layout`] rather than a generic struct.

use crate::format::{self, HEADER_SIZE};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// `meta` bit 0: the slot holds a live entry.
pub const SLOT_META_USED: u64 = 1 << 0;

/// A 16-byte open-addressed hash bucket entry.
#[repr(C)]
pub struct BucketRaw {
    pub hash: AtomicU64,
    pub slot_plus_one: AtomicU64,
}

const _ASSERT_BUCKET_SIZE: () =
    assert!(std::mem::size_of::<BucketRaw>() == format::BUCKET_ENTRY_SIZE as usize);

/// Computed geometry for one open cache: slot size, pad bytes, bucket
/// count/mask, and the byte offsets of each region. Derived once at
/// `Open` time from the validated header and held for the life of the
/// `Cache`/`Writer`.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub key_size: usize,
    pub index_size: usize,
    pub slot_size: usize,
    pub key_pad: usize,
    pub revision_offset: usize,
    pub index_offset: usize,
    pub slot_capacity: u64,
    pub bucket_count: u64,
    pub mask: u64,
    pub slots_offset: u64,
    pub buckets_offset: u64,
    pub ordered_keys: bool,
}

impl Layout {
    pub fn new(key_size: usize, index_size: usize, slot_capacity: u64, ordered_keys: bool) -> Self {
        let key_pad = format::key_pad(key_size);
        let slot_size = format::compute_slot_size(key_size, index_size);
        let revision_offset = 8 + key_size + key_pad;
        let index_offset = revision_offset + 8;
        let bucket_count = format::compute_bucket_count(slot_capacity);
        let slots_offset = HEADER_SIZE as u64;
        let buckets_offset = slots_offset + slot_capacity * slot_size as u64;
        Self {
            key_size,
            index_size,
            slot_size,
            key_pad,
            revision_offset,
            index_offset,
            slot_capacity,
            bucket_count,
            mask: bucket_count - 1,
            slots_offset,
            buckets_offset,
            ordered_keys,
        }
    }

    /// Total file size implied by this geometry: header + slots + buckets.
    pub fn total_file_len(&self) -> u64 {
        self.buckets_offset + self.bucket_count * format::BUCKET_ENTRY_SIZE
    }

    /// Pointer to the start of slot `slot_id`'s byte span.
    ///
    /// # Safety
    /// `base` must be the start of a mapping at least [`Self::total_file_len`]
    /// bytes long, and `slot_id < slot_capacity`.
    #[inline]
    pub unsafe fn slot_ptr(&self, base: *const u8, slot_id: u64) -> *const u8 {
        unsafe {
            base.add(self.slots_offset as usize + (slot_id as usize) * self.slot_size)
        }
    }

    /// # Safety
    /// Same as [`Self::slot_ptr`], plus exclusive write access.
    #[inline]
    pub unsafe fn slot_mut_ptr(&self, base: *mut u8, slot_id: u64) -> *mut u8 {
        unsafe {
            base.add(self.slots_offset as usize + (slot_id as usize) * self.slot_size)
        }
    }

    /// # Safety
    /// `base` must be the start of a mapping at least [`Self::total_file_len`]
    /// bytes long, and `bucket_id < bucket_count`.
    #[inline]
    pub unsafe fn bucket_ptr(&self, base: *const u8, bucket_id: u64) -> *const BucketRaw {
        unsafe {
            let off = self.buckets_offset + bucket_id * format::BUCKET_ENTRY_SIZE;
            base.add(off as usize) as *const BucketRaw
        }
    }
}

/// A borrowed view of one slot's fixed-offset fields.
///
/// # Safety
/// Constructing a `SlotView` requires `ptr` to point at `layout.slot_size`
/// valid bytes for the lifetime `'a`.
pub struct SlotView<'a> {
    ptr: *const u8,
    layout: &'a Layout,
    _marker: std::marker::PhantomData<&'a u8>,
}

impl<'a> SlotView<'a> {
    /// # Safety
    /// `ptr` must point to `layout.slot_size` valid bytes for lifetime `'a`.
    #[inline]
    pub unsafe fn new(ptr: *const u8, layout: &'a Layout) -> Self {
        Self {
            ptr,
            layout,
            _marker: std::marker::PhantomData,
        }
    }

    #[inline]
    pub fn meta(&self) -> u64 {
        // SAFETY: offset 0, 8-byte aligned (slot_size is a multiple of 8
        // and the slot array starts at a multiple-of-8 offset).
        unsafe { (*(self.ptr as *const AtomicU64)).load(Ordering::Acquire) }
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.meta() & SLOT_META_USED != 0
    }

    #[inline]
    pub fn key(&self) -> &'a [u8] {
        // SAFETY: key lives at offset 8, key_size bytes, within the slot.
        unsafe { std::slice::from_raw_parts(self.ptr.add(8), self.layout.key_size) }
    }

    #[inline]
    pub fn revision(&self) -> i64 {
        // SAFETY: revision_offset is 8-byte aligned by construction.
        unsafe {
            (*(self.ptr.add(self.layout.revision_offset) as *const AtomicI64)).load(Ordering::Acquire)
        }
    }

    #[inline]
    pub fn index(&self) -> &'a [u8] {
        // SAFETY: index lives at index_offset, index_size bytes.
        unsafe {
            std::slice::from_raw_parts(self.ptr.add(self.layout.index_offset), self.layout.index_size)
        }
    }
}

/// A borrowed mutable view of one slot, used only by the writer (which has
/// exclusive access to the mapping for the duration of a commit).
pub struct SlotViewMut<'a> {
    ptr: *mut u8,
    layout: &'a Layout,
}

impl<'a> SlotViewMut<'a> {
    /// # Safety
    /// `ptr` must point to `layout.slot_size` valid, writable bytes for
    /// lifetime `'a`, with no other live reference to the same slot.
    #[inline]
    pub unsafe fn new(ptr: *mut u8, layout: &'a Layout) -> Self {
        Self { ptr, layout }
    }

    #[inline]
    fn as_const(&self) -> SlotView<'a> {
        // SAFETY: same backing bytes as `self`, read-only borrow.
        unsafe { SlotView::new(self.ptr as *const u8, self.layout) }
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.as_const().is_used()
    }

    #[inline]
    pub fn key(&self) -> &'a [u8] {
        self.as_const().key()
    }

    #[inline]
    pub fn revision(&self) -> i64 {
        self.as_const().revision()
    }

    #[inline]
    pub fn index(&self) -> &'a [u8] {
        self.as_const().index()
    }

    #[inline]
    pub fn set_meta(&self, meta: u64) {
        unsafe { (*(self.ptr as *const AtomicU64)).store(meta, Ordering::Release) };
    }

    #[inline]
    pub fn set_key(&self, key: &[u8]) {
        debug_assert_eq!(key.len(), self.layout.key_size);
        unsafe {
            std::ptr::copy_nonoverlapping(key.as_ptr(), self.ptr.add(8), self.layout.key_size);
        }
    }

    #[inline]
    pub fn set_revision(&self, revision: i64) {
        unsafe {
            (*(self.ptr.add(self.layout.revision_offset) as *const AtomicI64))
                .store(revision, Ordering::Release);
        }
    }

    #[inline]
    pub fn set_index(&self, index: &[u8]) {
        debug_assert_eq!(index.len(), self.layout.index_size);
        unsafe {
            std::ptr::copy_nonoverlapping(
                index.as_ptr(),
                self.ptr.add(self.layout.index_offset),
                self.layout.index_size,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets_are_8_byte_aligned() {
        let l = Layout::new(4, 4, 64, false);
        assert_eq!(l.revision_offset % 8, 0);
        assert_eq!(l.slot_size % 8, 0);
        assert_eq!(l.slots_offset, 256);
        assert_eq!(l.buckets_offset, 256 + 64 * l.slot_size as u64);
    }

    #[test]
    fn layout_roundtrips_through_raw_bytes() {
        let l = Layout::new(8, 4, 8, false);
        let mut buf = vec![0u8; l.slot_size];
        unsafe {
            let view = SlotViewMut::new(buf.as_mut_ptr(), &l);
            view.set_meta(SLOT_META_USED);
            view.set_key(b"AAAAAAAA");
            view.set_revision(7);
            view.set_index(&[1, 2, 3, 4]);
        }
        unsafe {
            let view = SlotView::new(buf.as_ptr(), &l);
            assert!(view.is_used());
            assert_eq!(view.key(), b"AAAAAAAA");
            assert_eq!(view.revision(), 7);
            assert_eq!(view.index(), &[1, 2, 3, 4]);
        }
    }
}
