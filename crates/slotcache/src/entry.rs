//! Value types returned from the query surface (spec.md §6).

use crate::error::{Result, SlotCacheError};
use std::sync::Arc;

/// One cache entry, always an owned, detached copy — never a borrow into
/// the mmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub revision: i64,
    pub index: Vec<u8>,
}

/// A boxed predicate usable across threads, applied to each candidate
/// entry during a scan.
pub type ScanFilter = Arc<dyn Fn(&Entry) -> bool + Send + Sync>;

/// Options shared by `Scan`/`ScanPrefix`/`ScanMatch`/`ScanRange`.
#[derive(Clone, Default)]
pub struct ScanOptions {
    pub reverse: bool,
    pub offset: usize,
    /// `0` means unlimited.
    pub limit: usize,
    pub filter: Option<ScanFilter>,
}

impl ScanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reverse(mut self, v: bool) -> Self {
        self.reverse = v;
        self
    }

    pub fn offset(mut self, v: usize) -> Self {
        self.offset = v;
        self
    }

    pub fn limit(mut self, v: usize) -> Self {
        self.limit = v;
        self
    }

    pub fn filter(mut self, f: impl Fn(&Entry) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(f));
        self
    }

    pub(crate) fn matches(&self, entry: &Entry) -> bool {
        self.filter.as_ref().is_none_or(|f| f(entry))
    }
}

impl std::fmt::Debug for ScanOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOptions")
            .field("reverse", &self.reverse)
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// A generalized prefix match anchored at a byte offset, with an optional
/// bit-granular tail (spec.md §4.4 `ScanMatch`).
#[derive(Debug, Clone)]
pub struct PrefixSpec {
    pub offset: usize,
    /// Total bits to match, counted from `offset`. `0` means "byte prefix at
    /// that offset" — the whole `bytes` array is matched as a plain
    /// byte-prefix with no bit-granular tail. A non-zero, non-multiple-of-8
    /// value masks the high bits of the byte after the whole-byte run.
    pub bits: u32,
    pub bytes: Vec<u8>,
}

impl PrefixSpec {
    /// A whole-byte prefix of `bytes`, equivalent to `ScanPrefix`.
    pub fn bytes_at(offset: usize, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let bits = (bytes.len() as u32) * 8;
        Self { offset, bits, bytes }
    }

    /// `bits == 0` means "byte prefix at that offset": the whole `bytes`
    /// array, taken as a plain byte-prefix match with no bit-granular tail.
    fn effective_bits(&self) -> u32 {
        if self.bits == 0 {
            (self.bytes.len() as u32) * 8
        } else {
            self.bits
        }
    }

    fn whole_bytes(&self) -> usize {
        (self.effective_bits() / 8) as usize
    }

    fn tail_bits(&self) -> u32 {
        self.effective_bits() % 8
    }

    /// `key` must be the full key this spec is being matched against.
    pub(crate) fn matches(&self, key: &[u8]) -> bool {
        let whole = self.whole_bytes();
        if self.offset + whole > key.len() {
            return false;
        }
        if key[self.offset..self.offset + whole] != self.bytes[..whole] {
            return false;
        }
        let tail = self.tail_bits();
        if tail == 0 {
            return true;
        }
        let key_byte_idx = self.offset + whole;
        if key_byte_idx >= key.len() || whole >= self.bytes.len() {
            return false;
        }
        let mask: u8 = 0xFFu8 << (8 - tail);
        (key[key_byte_idx] & mask) == (self.bytes[whole] & mask)
    }

    pub(crate) fn validate(&self, key_size: usize) -> Result<()> {
        let bits = self.effective_bits();
        if bits == 0 {
            return Err(SlotCacheError::invalid_input("prefix spec must match at least 1 bit"));
        }
        let total_bits_available = (key_size.saturating_sub(self.offset)) as u32 * 8;
        if bits > total_bits_available {
            return Err(SlotCacheError::invalid_input(format!(
                "prefix spec covers {} bits but only {} are available at offset {}",
                bits, total_bits_available, self.offset
            )));
        }
        let needed_bytes = self.whole_bytes() + usize::from(self.tail_bits() != 0);
        if self.bytes.len() < needed_bytes {
            return Err(SlotCacheError::invalid_input(
                "prefix spec bytes shorter than bits requires",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_prefix_matches_plain_prefix_semantics() {
        let spec = PrefixSpec::bytes_at(0, vec![0xAB, 0xCD]);
        assert!(spec.matches(&[0xAB, 0xCD, 0x00, 0x00]));
        assert!(!spec.matches(&[0xAB, 0xCE, 0x00, 0x00]));
    }

    #[test]
    fn zero_bits_means_byte_prefix_of_the_whole_bytes_array() {
        let spec = PrefixSpec {
            offset: 1,
            bits: 0,
            bytes: vec![0xAB, 0xCD],
        };
        assert!(spec.validate(8).is_ok());
        assert!(spec.matches(&[0x00, 0xAB, 0xCD, 0x00]));
        assert!(!spec.matches(&[0x00, 0xAB, 0xCE, 0x00]));
    }

    #[test]
    fn bit_prefix_masks_high_bits_of_tail_byte() {
        // Match first 12 bits: byte0 fully, top nibble of byte1.
        let spec = PrefixSpec {
            offset: 0,
            bits: 12,
            bytes: vec![0xAB, 0xC0],
        };
        assert!(spec.matches(&[0xAB, 0xCF, 0x00]));
        assert!(!spec.matches(&[0xAB, 0xDF, 0x00]));
    }

    #[test]
    fn prefix_spec_validate_rejects_out_of_range() {
        let spec = PrefixSpec::bytes_at(6, vec![0x00, 0x00, 0x00]);
        assert!(spec.validate(8).is_err());
    }
}
