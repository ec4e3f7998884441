use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{CoreConfig, RetryConfig};
use crate::error::{ApplyError, StorageError, ValidationError};
use crate::feed::ChangeFeed;
use crate::flag::{FlagIntent, FlagRecord, FlagSlot, Rollout, Tombstone};
use crate::registry::FlagRegistry;
use crate::store::{CasOutcome, DurableStore};

/// How a commit treats the version check.
#[derive(Debug, Clone, Copy)]
enum WriteMode {
    /// The caller pinned an expected version (None = must not exist).
    Checked(Option<u64>),
    /// Take whatever version is current; retry lost races up to the
    /// attempt budget.
    Forced,
}

/// Single authority for turning a write intent into a committed slot.
///
/// Concurrency is two-level: an in-process version check against the
/// registry fails obviously stale writers cheaply, and the storage-level
/// conditional write decides races this process cannot see (other
/// coordinator instances sharing the durable store). Only the storage
/// calls suspend; both are bounded by the configured deadline.
pub struct Coordinator {
    registry: Arc<FlagRegistry>,
    feed: Arc<ChangeFeed>,
    store: Arc<dyn DurableStore>,
    environments: Vec<String>,
    retry: RetryConfig,
    storage_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        registry: Arc<FlagRegistry>,
        feed: Arc<ChangeFeed>,
        store: Arc<dyn DurableStore>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            registry,
            feed,
            store,
            environments: config.environments.clone(),
            retry: config.retry.clone(),
            storage_timeout: Duration::from_millis(config.storage_timeout_ms),
        }
    }

    /// Commits an intent against an expected version.
    ///
    /// `expected_version == None` means the flag must not yet exist (a
    /// create); a live record at any version is then a conflict. On
    /// `Conflict` the caller re-reads and retries; the coordinator never
    /// loops on a checked version mismatch itself.
    pub async fn apply(
        &self,
        intent: FlagIntent,
        expected_version: Option<u64>,
    ) -> Result<FlagSlot, ApplyError> {
        self.validate(&intent)?;

        // In-process fast-fail: only when the cache proves the caller
        // stale. Anything else is decided by the durable store, which a
        // possibly-lagging cache cannot overrule.
        if let Some(cached) = self.registry.get(&intent.key).map(|r| r.version) {
            match expected_version {
                Some(expected) if cached > expected => {
                    return Err(ApplyError::Conflict {
                        key: intent.key,
                        expected: Some(expected),
                        current: Some(cached),
                    });
                }
                None if !intent.delete => {
                    return Err(ApplyError::Conflict {
                        key: intent.key,
                        expected: None,
                        current: Some(cached),
                    });
                }
                _ => {}
            }
        }

        self.commit(intent, WriteMode::Checked(expected_version))
            .await
    }

    /// Commits an intent regardless of the current version, re-reading
    /// and retrying lost storage races up to the attempt budget. The
    /// convenience path for callers that do not track versions.
    pub async fn apply_forced(&self, intent: FlagIntent) -> Result<FlagSlot, ApplyError> {
        self.validate(&intent)?;
        self.commit(intent, WriteMode::Forced).await
    }

    /// Reloads every durable slot into the registry. Used for the
    /// startup cache-through and by consumers told to resynchronize
    /// after falling behind the change feed. Returns how many slots were
    /// newer than the cached copy.
    pub async fn resync(&self) -> Result<usize, ApplyError> {
        let mut attempts = 0u32;
        let slots = loop {
            match self.with_deadline(self.store.scan()).await {
                Ok(slots) => break slots,
                Err(err) => {
                    attempts += 1;
                    if attempts >= self.retry.max_attempts {
                        return Err(ApplyError::Unavailable {
                            attempts,
                            source: err,
                        });
                    }
                    warn!(attempt = attempts, error = %err, "durable scan failed, backing off");
                    self.backoff(attempts).await;
                }
            }
        };

        let mut applied = 0usize;
        for slot in slots {
            if self.registry.apply_committed(slot) {
                applied += 1;
            }
        }
        info!(applied, "resynchronized from durable store");
        Ok(applied)
    }

    fn validate(&self, intent: &FlagIntent) -> Result<(), ValidationError> {
        // FlagKey construction already guarantees non-empty, bounded,
        // lowercased parts; what's left is membership and intent shape.
        if !self.environments.is_empty()
            && !self
                .environments
                .iter()
                .any(|env| env == intent.key.environment())
        {
            return Err(ValidationError::UnknownEnvironment(
                intent.key.environment().to_string(),
            ));
        }

        if intent.delete {
            if intent.enabled.is_some() || intent.rollout.is_some() {
                return Err(ValidationError::DeleteWithChanges);
            }
            return Ok(());
        }

        if intent.enabled.is_none() && intent.rollout.is_none() {
            return Err(ValidationError::EmptyIntent);
        }
        Ok(())
    }

    async fn commit(&self, intent: FlagIntent, mode: WriteMode) -> Result<FlagSlot, ApplyError> {
        let key = intent.key.clone();
        let mut transient_failures = 0u32;
        let mut cas_losses = 0u32;

        loop {
            // Re-read every iteration: after a deadline expiry we cannot
            // assume the previous write did not land.
            let current = match self.with_deadline(self.store.read(&key)).await {
                Ok(slot) => slot,
                Err(err) => {
                    transient_failures += 1;
                    if transient_failures >= self.retry.max_attempts {
                        return Err(ApplyError::Unavailable {
                            attempts: transient_failures,
                            source: err,
                        });
                    }
                    warn!(key = %key, attempt = transient_failures, error = %err,
                        "durable read failed, backing off");
                    self.backoff(transient_failures).await;
                    continue;
                }
            };

            let live_version = current.as_ref().and_then(FlagSlot::live).map(|r| r.version);

            if let WriteMode::Checked(expected) = mode {
                if expected != live_version {
                    return Err(ApplyError::Conflict {
                        key,
                        expected,
                        current: live_version,
                    });
                }
            }

            // Deleting something that is not live is a conflict, not a
            // silent no-op: the caller's picture of the world is wrong.
            if intent.delete && live_version.is_none() {
                let expected = match mode {
                    WriteMode::Checked(expected) => expected,
                    WriteMode::Forced => None,
                };
                return Err(ApplyError::Conflict {
                    key,
                    expected,
                    current: None,
                });
            }

            // The slot version continues across tombstones, so a
            // re-created flag never regresses in the feed.
            let next_version = current.as_ref().map(FlagSlot::version).unwrap_or(0) + 1;
            let next = if intent.delete {
                FlagSlot::Tombstone(Tombstone {
                    key: key.clone(),
                    version: next_version,
                    deleted_at: Utc::now(),
                })
            } else {
                let base = current.as_ref().and_then(FlagSlot::live);
                FlagSlot::Live(FlagRecord {
                    key: key.clone(),
                    enabled: intent.enabled.or(base.map(|r| r.enabled)).unwrap_or(false),
                    rollout: intent
                        .rollout
                        .or(base.map(|r| r.rollout))
                        .unwrap_or(Rollout::FULL),
                    version: next_version,
                    updated_at: Utc::now(),
                })
            };

            let cas_expected = current.as_ref().map(FlagSlot::version);
            match self
                .with_deadline(self.store.compare_and_swap(&key, cas_expected, &next))
                .await
            {
                Ok(CasOutcome::Committed) => {
                    let entry = self.feed.append(&next);
                    self.registry.apply_committed(next.clone());
                    debug!(key = %key, version = next.version(), seq = entry.seq,
                        "flag mutation committed");
                    return Ok(next);
                }
                Ok(CasOutcome::Lost { current: winner }) => match mode {
                    WriteMode::Forced if cas_losses + 1 < self.retry.max_attempts => {
                        cas_losses += 1;
                        debug!(key = %key, attempt = cas_losses, "lost storage race, re-reading");
                        continue;
                    }
                    WriteMode::Forced => {
                        return Err(ApplyError::Conflict {
                            key,
                            expected: cas_expected,
                            current: winner,
                        });
                    }
                    WriteMode::Checked(expected) => {
                        return Err(ApplyError::Conflict {
                            key,
                            expected,
                            current: winner,
                        });
                    }
                },
                Err(err) => {
                    transient_failures += 1;
                    if transient_failures >= self.retry.max_attempts {
                        return Err(ApplyError::Unavailable {
                            attempts: transient_failures,
                            source: err,
                        });
                    }
                    warn!(key = %key, attempt = transient_failures, error = %err,
                        "conditional write failed, backing off");
                    self.backoff(transient_failures).await;
                }
            }
        }
    }

    async fn with_deadline<T>(
        &self,
        operation: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        match timeout(self.storage_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Deadline(self.storage_timeout)),
        }
    }

    /// Exponential backoff capped at the configured maximum.
    async fn backoff(&self, attempt: u32) {
        let delay_ms = self
            .retry
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let delay = Duration::from_millis(delay_ms.min(self.retry.max_delay_ms));
        tokio::time::sleep(delay).await;
    }
}
