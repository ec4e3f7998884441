use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CasOutcome, DurableStore};
use crate::error::StorageError;
use crate::flag::{FlagKey, FlagSlot};

/// In-memory durable-store stand-in backed by a `RwLock<HashMap>`.
///
/// Used by tests and single-process deployments that do not need
/// persistence across restarts.
pub struct MemoryStore {
    data: RwLock<HashMap<FlagKey, FlagSlot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read(&self, key: &FlagKey) -> Result<Option<FlagSlot>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &FlagKey,
        expected_version: Option<u64>,
        next: &FlagSlot,
    ) -> Result<CasOutcome, StorageError> {
        let mut data = self.data.write().await;
        let current = data.get(key).map(FlagSlot::version);
        if current != expected_version {
            return Ok(CasOutcome::Lost { current });
        }
        data.insert(key.clone(), next.clone());
        Ok(CasOutcome::Committed)
    }

    async fn scan(&self) -> Result<Vec<FlagSlot>, StorageError> {
        let data = self.data.read().await;
        Ok(data.values().cloned().collect())
    }
}
