//! The reader-side seqlock protocol (spec.md §4.2).
//!
//! A single file-wide generation counter guards the whole mapping: header
//! counters, the slot array, and the bucket array all become visible-or-not
//! together at each even generation.

use crate::error::SlotCacheError;
use crate::format::SEQLOCK_MAX_RETRIES;
use crate::header::HeaderRaw;
use std::sync::atomic::Ordering;

/// Runs `body` under the seqlock protocol, retrying up to
/// [`SEQLOCK_MAX_RETRIES`] times if a concurrent commit is observed
/// in-flight or tears the read.
///
/// `body` must be side-effect-free on failure paths: it may run multiple
/// times and only its last (successful) return value is kept. It should
/// produce a fully detached value (never a borrow into the mmap).
#[inline]
pub fn read_seqlocked<T>(
    header: &HeaderRaw,
    mut body: impl FnMut() -> T,
) -> Result<T, SlotCacheError> {
    for _ in 0..SEQLOCK_MAX_RETRIES {
        let g1 = header.load_generation(Ordering::Acquire);
        if g1 & 1 == 1 {
            std::hint::spin_loop();
            continue;
        }

        let value = body();

        let g2 = header.load_generation(Ordering::Acquire);
        if g1 == g2 && g2 & 1 == 0 {
            return Ok(value);
        }
        std::hint::spin_loop();
    }
    Err(SlotCacheError::Busy(
        "seqlock retry budget exhausted; writer holding generation open too long",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_header() -> HeaderRaw {
        // A zero-initialized header is a valid "even generation, all
        // counters zero" state for the purposes of these unit tests.
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn stable_even_generation_reads_once() {
        let header = blank_header();
        let mut calls = 0;
        let result = read_seqlocked(&header, || {
            calls += 1;
            42
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn odd_generation_exhausts_retries() {
        let header = blank_header();
        header.generation.store(1, Ordering::Relaxed);
        let result = read_seqlocked(&header, || 0);
        assert!(result.is_err());
    }
}
