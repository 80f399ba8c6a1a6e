//! The 256-byte file header: raw layout plus a thin typed view over it.
//!
//! `HeaderRaw` is placed at offset 0 of the mmap via a raw pointer cast
//! (never copied whole except for CRC computation and header snapshots
//! returned to callers). Field order matches spec.md's offset table exactly
//! and, given `repr(C)` placement rules, needs no explicit offset
//! annotations: every 4-byte field run ends on an 8-byte boundary before the
//! first 8-byte field begins.

use crate::format::HEADER_SIZE;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[repr(C)]
pub struct HeaderRaw {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub header_size: AtomicU32,
    pub key_size: AtomicU32,
    pub index_size: AtomicU32,
    pub slot_size: AtomicU32,
    pub hash_alg: AtomicU32,
    pub flags: AtomicU32,
    pub slot_capacity: AtomicU64,
    pub slot_highwater: AtomicU64,
    pub live_count: AtomicU64,
    pub user_version: AtomicU64,
    pub generation: AtomicU64,
    pub bucket_count: AtomicU64,
    pub bucket_used: AtomicU64,
    pub bucket_tombstones: AtomicU64,
    pub slots_offset: AtomicU64,
    pub buckets_offset: AtomicU64,
    pub header_crc32c: AtomicU32,
    pub state: AtomicU32,
    pub user_flags: AtomicU64,
    pub user_data: [u8; 64],
    pub reserved_tail: [u8; 64],
}

const _ASSERT_HEADER_SIZE: () = assert!(std::mem::size_of::<HeaderRaw>() == HEADER_SIZE as usize);
const _ASSERT_GENERATION_OFFSET: () = assert!(offset_of_generation() == 0x040);
const _ASSERT_CRC_OFFSET: () = assert!(offset_of_crc() == 0x070);

const fn offset_of_generation() -> usize {
    std::mem::offset_of!(HeaderRaw, generation)
}

const fn offset_of_crc() -> usize {
    std::mem::offset_of!(HeaderRaw, header_crc32c)
}

impl HeaderRaw {
    /// # Safety
    /// `ptr` must point to at least [`HEADER_SIZE`] bytes of valid,
    /// 8-byte-aligned memory for the lifetime `'a`.
    #[inline]
    pub unsafe fn from_ptr<'a>(ptr: *const u8) -> &'a HeaderRaw {
        unsafe { &*(ptr as *const HeaderRaw) }
    }

    /// # Safety
    /// Same requirements as [`Self::from_ptr`], plus exclusive write access.
    #[inline]
    pub unsafe fn from_mut_ptr<'a>(ptr: *mut u8) -> &'a HeaderRaw {
        unsafe { &*(ptr as *const HeaderRaw) }
    }

    /// Copies the full 256-byte header image for CRC computation or for
    /// returning a detached snapshot to a reader.
    pub fn snapshot_bytes(&self) -> [u8; HEADER_SIZE as usize] {
        // SAFETY: `self` is exactly HEADER_SIZE bytes (enforced by the
        // const assert above) and fully initialized.
        unsafe { std::ptr::read(self as *const HeaderRaw as *const [u8; HEADER_SIZE as usize]) }
    }

    /// Recomputes and stores `header_crc32c` from the header's current
    /// contents (with `generation` and the CRC field itself zeroed, as the
    /// format requires).
    pub fn recompute_crc(&self) {
        let snapshot = self.snapshot_bytes();
        let crc = crate::format::crc32c_header(&snapshot);
        self.header_crc32c.store(crc, Ordering::Relaxed);
    }

    /// Verifies the stored CRC against a freshly computed one.
    pub fn crc_matches(&self) -> bool {
        let snapshot = self.snapshot_bytes();
        let computed = crate::format::crc32c_header(&snapshot);
        computed == self.header_crc32c.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load_generation(&self, order: Ordering) -> u64 {
        self.generation.load(order)
    }

    #[inline]
    pub fn store_generation(&self, value: u64, order: Ordering) {
        self.generation.store(value, order)
    }

    /// Overwrites `user_data`. Only sound while the caller holds exclusive
    /// writer access to the mapping (the field is a plain byte array, not
    /// an atomic, since it is only ever touched during a writer's odd-
    /// generation commit window).
    #[inline]
    pub fn store_user_data(&self, data: [u8; 64]) {
        let ptr = &self.user_data as *const [u8; 64] as *mut [u8; 64];
        // SAFETY: caller holds exclusive writer access for the duration of
        // this call (enforced by the single-writer protocol above this
        // module).
        unsafe { std::ptr::write(ptr, data) };
    }
}
