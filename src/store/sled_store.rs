use async_trait::async_trait;

use super::{CasOutcome, DurableStore};
use crate::error::StorageError;
use crate::flag::{FlagKey, FlagSlot};

const KEY_PREFIX: &str = "flag:";

/// Persistent flag storage backed by sled. Slots are JSON-encoded; the
/// conditional write rides on sled's native `compare_and_swap`, which
/// gives the byte-level atomicity the version check needs.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    /// Open a sled database at the given directory path.
    pub fn open(data_dir: &str) -> Result<Self, StorageError> {
        let db = sled::open(data_dir)
            .map_err(|e| StorageError::Backend(format!("failed to open sled db: {}", e)))?;
        Ok(Self::new(db))
    }

    fn storage_key(key: &FlagKey) -> String {
        format!("{}{}:{}", KEY_PREFIX, key.environment(), key.name())
    }

    fn decode(bytes: &[u8]) -> Result<FlagSlot, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait]
impl DurableStore for SledStore {
    async fn read(&self, key: &FlagKey) -> Result<Option<FlagSlot>, StorageError> {
        let ivec = self
            .db
            .get(Self::storage_key(key))
            .map_err(|e| StorageError::Backend(format!("failed to read slot: {}", e)))?;
        match ivec {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &FlagKey,
        expected_version: Option<u64>,
        next: &FlagSlot,
    ) -> Result<CasOutcome, StorageError> {
        let storage_key = Self::storage_key(key);

        let current = self
            .db
            .get(&storage_key)
            .map_err(|e| StorageError::Backend(format!("failed to read slot: {}", e)))?;
        let current_version = match current.as_ref() {
            Some(bytes) => Some(Self::decode(bytes)?.version()),
            None => None,
        };
        if current_version != expected_version {
            return Ok(CasOutcome::Lost {
                current: current_version,
            });
        }

        let next_bytes = serde_json::to_vec(next)?;
        let swap = self
            .db
            .compare_and_swap(storage_key.as_bytes(), current.as_ref(), Some(next_bytes))
            .map_err(|e| StorageError::Backend(format!("conditional write failed: {}", e)))?;

        match swap {
            Ok(()) => {
                self.db
                    .flush()
                    .map_err(|e| StorageError::Backend(format!("failed to flush: {}", e)))?;
                Ok(CasOutcome::Committed)
            }
            Err(cas_err) => {
                // Raced between our read and the swap; report whoever won.
                let current = cas_err
                    .current
                    .as_deref()
                    .and_then(|bytes| Self::decode(bytes).ok())
                    .map(|slot| slot.version());
                Ok(CasOutcome::Lost { current })
            }
        }
    }

    async fn scan(&self) -> Result<Vec<FlagSlot>, StorageError> {
        let mut slots = Vec::new();
        for item in self.db.scan_prefix(KEY_PREFIX) {
            let (_, value) =
                item.map_err(|e| StorageError::Backend(format!("failed to scan: {}", e)))?;
            slots.push(Self::decode(&value)?);
        }
        Ok(slots)
    }
}
