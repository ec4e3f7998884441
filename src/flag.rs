use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Upper bound on flag names, matching the storage schema.
pub const MAX_NAME_LEN: usize = 100;
/// Upper bound on environment names, matching the storage schema.
pub const MAX_ENVIRONMENT_LEN: usize = 50;

/// Composite identity of a flag: name plus environment.
///
/// At most one live [`FlagRecord`] exists per key. The environment is
/// lowercased on construction so `PROD` and `prod` address the same flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "KeyParts")]
pub struct FlagKey {
    name: String,
    environment: String,
}

#[derive(Deserialize)]
struct KeyParts {
    name: String,
    environment: String,
}

impl TryFrom<KeyParts> for FlagKey {
    type Error = ValidationError;

    fn try_from(parts: KeyParts) -> Result<Self, Self::Error> {
        FlagKey::new(parts.name, parts.environment)
    }
}

impl FlagKey {
    pub fn new(
        name: impl Into<String>,
        environment: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        let environment = environment.into().to_lowercase();

        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ValidationError::NameTooLong(name.len()));
        }
        if environment.is_empty() {
            return Err(ValidationError::EmptyEnvironment);
        }
        if environment.len() > MAX_ENVIRONMENT_LEN {
            return Err(ValidationError::EnvironmentTooLong(environment.len()));
        }

        Ok(Self { name, environment })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }
}

impl std::fmt::Display for FlagKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.environment)
    }
}

/// Percentage of bucketed traffic receiving the active treatment, in [0,100].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rollout(u8);

impl Rollout {
    pub const ZERO: Rollout = Rollout(0);
    pub const FULL: Rollout = Rollout(100);

    pub fn new(percent: u8) -> Result<Self, ValidationError> {
        if percent > 100 {
            return Err(ValidationError::RolloutOutOfRange(percent));
        }
        Ok(Self(percent))
    }

    pub fn percent(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Rollout {
    type Error = ValidationError;

    fn try_from(percent: u8) -> Result<Self, Self::Error> {
        Rollout::new(percent)
    }
}

impl From<Rollout> for u8 {
    fn from(rollout: Rollout) -> u8 {
        rollout.0
    }
}

impl std::fmt::Display for Rollout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Current definition of a flag.
///
/// `version` strictly increases per key; `updated_at` is stamped by the
/// coordinator at commit time, never by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagRecord {
    pub key: FlagKey,
    pub enabled: bool,
    pub rollout: Rollout,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Terminal marker for a deleted flag. Keeps the version counter so a
/// re-created flag continues the per-key sequence instead of restarting
/// at 1, which would look like a regression to feed consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub key: FlagKey,
    pub version: u64,
    pub deleted_at: DateTime<Utc>,
}

/// What a storage slot holds for a key: a live definition or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagSlot {
    Live(FlagRecord),
    Tombstone(Tombstone),
}

impl FlagSlot {
    pub fn key(&self) -> &FlagKey {
        match self {
            FlagSlot::Live(record) => &record.key,
            FlagSlot::Tombstone(tombstone) => &tombstone.key,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            FlagSlot::Live(record) => record.version,
            FlagSlot::Tombstone(tombstone) => tombstone.version,
        }
    }

    pub fn live(&self) -> Option<&FlagRecord> {
        match self {
            FlagSlot::Live(record) => Some(record),
            FlagSlot::Tombstone(_) => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, FlagSlot::Tombstone(_))
    }
}

/// A write intent: which fields to change, or a deletion.
///
/// Built with the chaining style:
///
/// ```
/// use flagship_core::{FlagIntent, FlagKey, Rollout};
///
/// let key = FlagKey::new("checkout_v2", "prod").unwrap();
/// let intent = FlagIntent::change(key).enabled(true).rollout(Rollout::new(30).unwrap());
/// assert_eq!(intent.enabled, Some(true));
/// ```
#[derive(Debug, Clone)]
pub struct FlagIntent {
    pub key: FlagKey,
    pub enabled: Option<bool>,
    pub rollout: Option<Rollout>,
    pub delete: bool,
}

impl FlagIntent {
    /// An upsert intent with no changes yet; chain `enabled` / `rollout`.
    pub fn change(key: FlagKey) -> Self {
        Self {
            key,
            enabled: None,
            rollout: None,
            delete: false,
        }
    }

    /// A deletion intent.
    pub fn delete(key: FlagKey) -> Self {
        Self {
            key,
            enabled: None,
            rollout: None,
            delete: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn rollout(mut self, rollout: Rollout) -> Self {
        self.rollout = Some(rollout);
        self
    }
}
