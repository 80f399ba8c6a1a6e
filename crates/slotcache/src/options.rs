//! `Cache::Open` options (spec.md §6 "Options — enumerated").

use crate::error::{Result, SlotCacheError};
use std::path::PathBuf;

/// Durability discipline governing when/how `msync` is issued during
/// `Writer::Commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritebackMode {
    /// No `msync` is issued; the commit is durable only to whatever the OS
    /// decides to write back on its own schedule.
    None,
    /// `msync(MS_ASYNC)` is issued after commit; returns without waiting
    /// for the write to land.
    Async,
    /// Ordered `msync(MS_SYNC)` calls bracket the odd→even generation
    /// transition, per spec.md §4.5 step 7.
    #[default]
    Sync,
}

/// Options controlling `Cache::Open`. `path`, `key_size`, `index_size`,
/// `user_version`, `slot_capacity`, and `ordered_keys` are frozen at file
/// creation; reopening with different values is rejected as
/// `ErrIncompatible`.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub path: PathBuf,
    pub key_size: usize,
    pub index_size: usize,
    pub user_version: u64,
    pub slot_capacity: u64,
    pub ordered_keys: bool,
    pub disable_locking: bool,
    pub writeback: WritebackMode,
}

impl OpenOptions {
    pub fn new(path: impl Into<PathBuf>, key_size: usize, index_size: usize, slot_capacity: u64) -> Self {
        Self {
            path: path.into(),
            key_size,
            index_size,
            user_version: 0,
            slot_capacity,
            ordered_keys: false,
            disable_locking: false,
            writeback: WritebackMode::default(),
        }
    }

    pub fn user_version(mut self, v: u64) -> Self {
        self.user_version = v;
        self
    }

    pub fn ordered_keys(mut self, v: bool) -> Self {
        self.ordered_keys = v;
        self
    }

    pub fn disable_locking(mut self, v: bool) -> Self {
        self.disable_locking = v;
        self
    }

    pub fn writeback(mut self, v: WritebackMode) -> Self {
        self.writeback = v;
        self
    }

    /// Validates `key_size`/`index_size`/`slot_capacity` ranges per
    /// spec.md §6. Called at the start of `Cache::Open`.
    pub fn validate(&self) -> Result<()> {
        if !(1..=32).contains(&self.key_size) {
            return Err(SlotCacheError::invalid_input(format!(
                "key_size must be in 1..=32, got {}",
                self.key_size
            )));
        }
        if self.index_size > 32 {
            return Err(SlotCacheError::invalid_input(format!(
                "index_size must be in 0..=32, got {}",
                self.index_size
            )));
        }
        if self.slot_capacity < 1 {
            return Err(SlotCacheError::invalid_input(
                "slot_capacity must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The sidecar advisory lock file path, `<path>.lock`.
    pub fn lock_path(&self) -> PathBuf {
        let mut s = self.path.clone().into_os_string();
        s.push(".lock");
        PathBuf::from(s)
    }
}
