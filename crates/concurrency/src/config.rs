//! Engine configuration
//!
//! All knobs are process-wide choices made before transactions run. The
//! engine only accepts changes while no transaction is in flight.
//!
//! Configuration can be built in code with [`EngineConfig`]'s fields or
//! loaded from TOML:
//!
//! ```
//! use strata_concurrency::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str(r#"
//!     update_policy = "direct"
//!     conflict_detection = "late"
//!     latm_mode = "tx"
//!
//!     [contention]
//!     policy = "backoff"
//!     abort_permission = "balanced"
//! "#).unwrap();
//! assert_eq!(config.latm_mode, strata_concurrency::LatmMode::Tx);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strata_core::{Error, Result};

/// Where uncommitted writes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Mutate shared objects in place under exclusive ownership, keeping a
    /// backup for rollback
    Direct,
    /// Mutate private staged copies, published at commit
    #[default]
    Deferred,
}

/// When direct-mode read conflicts are detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictDetection {
    /// Consult the contention manager as soon as an owned object is read
    #[default]
    Early,
    /// Register the read and check at commit time
    Late,
}

/// How a committer protects isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitValidation {
    /// Force conflicting in-flight transactions to abort
    #[default]
    Invalidation,
    /// Only check this transaction's own read versions
    Validation,
}

/// LATM protection level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatmMode {
    /// Any held lock excludes transactions of other threads
    #[default]
    Full,
    /// Only locks registered as conflicting exclude transactions
    Tm,
    /// Each transaction declares the locks it conflicts with
    Tx,
}

/// How staged copies are published at commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopySemantics {
    /// `copy_state` the staged value into the original
    #[default]
    Copy,
    /// Move the staged value into the original
    Move,
}

/// Built-in contention manager selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Never abort on immediate conflicts; rely on commit-time checks
    #[serde(rename = "noop")]
    NoOp,
    /// Back off and abort the requester; raise priority while waiting
    #[default]
    Backoff,
}

/// Heuristic for the batched "may I abort all of these" decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortPermission {
    /// Always permit
    #[default]
    Aggressive,
    /// Deny if any victim has a higher priority
    Priority,
    /// Weigh priority against per-thread commit counts
    Fairness,
    /// Weigh read and write set sizes
    Balanced,
}

/// Contention manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentionConfig {
    /// Built-in manager to install
    pub policy: ContentionPolicy,
    /// Heuristic for batched abort permission
    pub abort_permission: AbortPermission,
    /// First backoff sleep, in microseconds
    pub initial_backoff_us: u64,
    /// Upper bound on a single backoff sleep, in microseconds
    pub max_backoff_us: u64,
}

impl Default for ContentionConfig {
    fn default() -> Self {
        Self {
            policy: ContentionPolicy::Backoff,
            abort_permission: AbortPermission::Aggressive,
            initial_backoff_us: 1,
            max_backoff_us: 1_000,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Direct or deferred updating
    pub update_policy: UpdatePolicy,
    /// Early or late direct-mode read conflict detection
    pub conflict_detection: ConflictDetection,
    /// Invalidation or validation at commit
    pub commit_validation: CommitValidation,
    /// LATM protection level
    pub latm_mode: LatmMode,
    /// Copy or move staged values at commit
    pub copy_semantics: CopySemantics,
    /// Contention manager settings
    pub contention: ContentionConfig,
    /// Sleep between polls in internal waits, in microseconds
    pub wait_interval_us: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            update_policy: UpdatePolicy::Deferred,
            conflict_detection: ConflictDetection::Early,
            commit_validation: CommitValidation::Invalidation,
            latm_mode: LatmMode::Full,
            copy_semantics: CopySemantics::Copy,
            contention: ContentionConfig::default(),
            wait_interval_us: 50,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML and validate it
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(input).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.wait_interval_us == 0 {
            return Err(Error::Config("wait_interval_us must be non-zero".into()));
        }
        if self.contention.initial_backoff_us > self.contention.max_backoff_us {
            return Err(Error::Config(format!(
                "initial_backoff_us ({}) exceeds max_backoff_us ({})",
                self.contention.initial_backoff_us, self.contention.max_backoff_us
            )));
        }
        Ok(())
    }

    /// Polling interval for internal waits
    #[inline]
    pub fn wait_interval(&self) -> Duration {
        Duration::from_micros(self.wait_interval_us)
    }
}

/// Per-transaction view of the policies in effect
///
/// Captured at `begin()`; the engine refuses reconfiguration while any
/// transaction is in flight, so the snapshot stays accurate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TxPolicy {
    pub update: UpdatePolicy,
    pub detection: ConflictDetection,
    pub validation: CommitValidation,
    pub latm: LatmMode,
    pub copy: CopySemantics,
    pub wait: Duration,
}

impl From<&EngineConfig> for TxPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            update: config.update_policy,
            detection: config.conflict_detection,
            validation: config.commit_validation,
            latm: config.latm_mode,
            copy: config.copy_semantics,
            wait: config.wait_interval(),
        }
    }
}
