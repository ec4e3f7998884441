//! Feature flag evaluation and management core.
//!
//! Decides, given a flag name, a target environment and a bucketing key,
//! whether a feature is active: deterministic percentage rollouts over a
//! stable hash, an in-memory flag table with optimistic versioning, a
//! replayable change feed, and a coordinator that mediates concurrent
//! writers against durable storage with two-level compare-and-swap.
//!
//! The HTTP transport, authentication and the durable store's wire
//! protocol live outside this crate; it is driven through [`Flagship`].

use std::sync::Arc;

use futures::Stream;
use serde::Serialize;

pub mod builder;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod eval;
pub mod feed;
pub mod flag;
pub mod registry;
pub mod store;

pub use builder::FlagshipBuilder;
pub use config::{CoreConfig, RetryConfig, StorageBackend};
pub use coordinator::Coordinator;
pub use error::{ApplyError, FeedError, StorageError, ValidationError};
pub use eval::{Decision, EvalContext, Reason};
pub use feed::{Change, ChangeEntry, ChangeFeed};
pub use flag::{FlagIntent, FlagKey, FlagRecord, FlagSlot, Rollout, Tombstone};
pub use registry::{FlagRegistry, PutOutcome};
pub use store::{CasOutcome, DurableStore};

/// A consistent bulk view of the live flag table.
///
/// `as_of` is taken from the change feed before the table is read, so a
/// consumer that resumes a subscription from it sees every later change
/// at least once; per-key versions make the replay idempotent.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub as_of: u64,
    pub flags: Vec<FlagRecord>,
}

/// The assembled core: registry, change feed and coordinator behind one
/// handle. Reads never touch durable storage; writes go through the
/// coordinator's two-level compare-and-swap.
pub struct Flagship {
    pub(crate) registry: Arc<FlagRegistry>,
    pub(crate) feed: Arc<ChangeFeed>,
    pub(crate) coordinator: Coordinator,
}

impl Flagship {
    pub fn builder() -> FlagshipBuilder {
        builder::create_builder()
    }

    /// Evaluates a flag for a bucketing key. Never fails: a missing flag
    /// (or an unparseable name/environment) is a `not_found` decision,
    /// since that is an expected, common outcome rather than a fault.
    pub fn evaluate(&self, name: &str, environment: &str, context: &EvalContext) -> Decision {
        let Ok(key) = FlagKey::new(name, environment) else {
            return Decision::not_found();
        };
        let record = self.registry.get(&key);
        eval::evaluate(record.as_ref(), &context.bucketing_key)
    }

    /// Latest locally-applied definition for a flag, if it is live.
    pub fn get(&self, name: &str, environment: &str) -> Option<FlagRecord> {
        let key = FlagKey::new(name, environment).ok()?;
        self.registry.get(&key)
    }

    /// All live flags, optionally filtered by environment, ordered by
    /// environment then name.
    pub fn list(&self, environment: Option<&str>) -> Vec<FlagRecord> {
        let needle = environment.map(str::to_lowercase);
        self.registry
            .snapshot()
            .into_iter()
            .filter(|record| {
                needle
                    .as_deref()
                    .map_or(true, |env| record.key.environment() == env)
            })
            .collect()
    }

    /// Point-in-time bulk export, with the feed offset to resume from.
    pub fn snapshot(&self) -> StoreSnapshot {
        let as_of = self.feed.last_seq();
        let flags = self.registry.snapshot();
        StoreSnapshot { as_of, flags }
    }

    /// Commits a write intent against an expected version. See
    /// [`Coordinator::apply`].
    pub async fn apply(
        &self,
        intent: FlagIntent,
        expected_version: Option<u64>,
    ) -> Result<FlagSlot, ApplyError> {
        self.coordinator.apply(intent, expected_version).await
    }

    /// Commits a write intent regardless of the current version. See
    /// [`Coordinator::apply_forced`].
    pub async fn apply_forced(&self, intent: FlagIntent) -> Result<FlagSlot, ApplyError> {
        self.coordinator.apply_forced(intent).await
    }

    /// Creates a flag that must not already exist.
    pub async fn create(
        &self,
        key: FlagKey,
        enabled: bool,
        rollout: Rollout,
    ) -> Result<FlagRecord, ApplyError> {
        let intent = FlagIntent::change(key).enabled(enabled).rollout(rollout);
        match self.coordinator.apply(intent, None).await? {
            FlagSlot::Live(record) => Ok(record),
            // A non-delete intent always commits a live slot.
            FlagSlot::Tombstone(_) => unreachable!(),
        }
    }

    /// Updates an existing flag. With `expected_version` the write is
    /// optimistic and conflicts surface to the caller; without it the
    /// update is forced (last writer wins, bounded retries).
    pub async fn update(
        &self,
        key: FlagKey,
        enabled: Option<bool>,
        rollout: Option<Rollout>,
        expected_version: Option<u64>,
    ) -> Result<FlagRecord, ApplyError> {
        let mut intent = FlagIntent::change(key);
        intent.enabled = enabled;
        intent.rollout = rollout;
        let slot = match expected_version {
            Some(version) => self.coordinator.apply(intent, Some(version)).await?,
            None => self.coordinator.apply_forced(intent).await?,
        };
        match slot {
            FlagSlot::Live(record) => Ok(record),
            FlagSlot::Tombstone(_) => unreachable!(),
        }
    }

    /// Deletes a flag, leaving a tombstone in the change feed. Returns
    /// the tombstone's version.
    pub async fn delete(
        &self,
        key: FlagKey,
        expected_version: Option<u64>,
    ) -> Result<u64, ApplyError> {
        let intent = FlagIntent::delete(key);
        let slot = match expected_version {
            Some(version) => self.coordinator.apply(intent, Some(version)).await?,
            None => self.coordinator.apply_forced(intent).await?,
        };
        Ok(slot.version())
    }

    /// Lazy sequence of every committed change after `from_seq`; replays
    /// the retained window, then follows live commits until dropped.
    pub fn subscribe(
        &self,
        from_seq: u64,
    ) -> Result<impl Stream<Item = Result<ChangeEntry, FeedError>> + Send + 'static, FeedError>
    {
        feed::subscribe(Arc::clone(&self.feed), from_seq)
    }

    /// Reloads the registry from durable storage. See
    /// [`Coordinator::resync`].
    pub async fn resync(&self) -> Result<usize, ApplyError> {
        self.coordinator.resync().await
    }
}
