pub mod memory;
pub mod sled_store;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::flag::{FlagKey, FlagSlot};

/// Outcome of a storage-level conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Committed,
    /// Another writer got there first; `current` is the slot version that
    /// actually sits in storage now (None when the slot is absent).
    Lost { current: Option<u64> },
}

/// Durable storage boundary for flag slots. Implementations must be
/// thread-safe, and `compare_and_swap` must be atomic: across
/// coordinator instances it is the only ordering authority, so no
/// in-memory lock can substitute for it.
///
/// `expected_version == None` means the slot must not exist at all.
/// Any backend with atomic conditional writes (a row-version column, a
/// conditional put) can implement this.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Current slot for a key, tombstones included.
    async fn read(&self, key: &FlagKey) -> Result<Option<FlagSlot>, StorageError>;

    /// Writes `next` only if the stored slot's version still equals
    /// `expected_version`.
    async fn compare_and_swap(
        &self,
        key: &FlagKey,
        expected_version: Option<u64>,
        next: &FlagSlot,
    ) -> Result<CasOutcome, StorageError>;

    /// Every stored slot, for startup cache-through and full resyncs.
    async fn scan(&self) -> Result<Vec<FlagSlot>, StorageError>;
}
