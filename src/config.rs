//! Configuration for a replication.
//!
//! [`ReplicationOptions`] is passed to [`replicate()`](crate::replicate) and can
//! be constructed programmatically or deserialized from JSON/YAML.
//!
//! # Quick Start
//!
//! ```rust
//! use doc_replicator::config::{CheckpointMode, ReplicationOptions};
//!
//! let options = ReplicationOptions {
//!     live: true,
//!     batch_size: 50,
//!     checkpoint: CheckpointMode::Target,
//!     ..Default::default()
//! };
//! assert!(options.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationOptions
//! ├── live / continuous: bool       # keep tailing after the backlog
//! ├── batch_size: usize             # changes per feed page and per batch (100)
//! ├── batches_limit: usize          # queued batches before the feed pauses (10)
//! ├── doc_ids, selector, filter,    # change filtering (server side)
//! │   query_params, view
//! ├── filter_fn                     # change filtering (client side, code only)
//! ├── heartbeat, timeout            # humantime strings, passed to the feed
//! ├── checkpoint: false|"source"|"target"|true
//! ├── since: Seq                    # seed the checkpoint before starting
//! ├── seq_interval: u64
//! ├── retry: bool                   # restart after transient failures (true)
//! └── backoff: BackoffConfig        # restart delay curve
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "continuous": true,
//!   "batch_size": 200,
//!   "doc_ids": ["invoice:1", "invoice:2"],
//!   "checkpoint": "target",
//!   "heartbeat": "10s",
//!   "backoff": { "initial_delay": "500ms", "max_delay": "1m" }
//! }
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use crate::store::{Change, Seq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Client-side change filter
// ═══════════════════════════════════════════════════════════════════════════════

/// A predicate run on every change before it is batched.
///
/// When configured, the feed is opened with `include_docs` so the predicate
/// can look at the document body.
#[derive(Clone)]
pub struct ChangeFilter(Arc<dyn Fn(&Change) -> bool + Send + Sync>);

impl ChangeFilter {
    pub fn new(f: impl Fn(&Change) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn accepts(&self, change: &Change) -> bool {
        (self.0)(change)
    }
}

impl fmt::Debug for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChangeFilter(..)")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Checkpoint placement
// ═══════════════════════════════════════════════════════════════════════════════

/// Where checkpoints are stored.
///
/// Serialized as `false`, `"source"`, `"target"` or `true` (both).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointMode {
    /// No checkpoints: every run starts from the beginning.
    Disabled,
    Source,
    Target,
    #[default]
    Both,
}

impl CheckpointMode {
    pub fn writes_source(self) -> bool {
        matches!(self, Self::Source | Self::Both)
    }

    pub fn writes_target(self) -> bool {
        matches!(self, Self::Target | Self::Both)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawCheckpointMode {
    Flag(bool),
    Side(String),
}

impl Serialize for CheckpointMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let raw = match self {
            Self::Disabled => RawCheckpointMode::Flag(false),
            Self::Both => RawCheckpointMode::Flag(true),
            Self::Source => RawCheckpointMode::Side("source".to_string()),
            Self::Target => RawCheckpointMode::Side("target".to_string()),
        };
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CheckpointMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RawCheckpointMode::deserialize(deserializer)? {
            RawCheckpointMode::Flag(true) => Ok(Self::Both),
            RawCheckpointMode::Flag(false) => Ok(Self::Disabled),
            RawCheckpointMode::Side(side) => match side.as_str() {
                "source" => Ok(Self::Source),
                "target" => Ok(Self::Target),
                other => Err(serde::de::Error::custom(format!(
                    "invalid checkpoint mode {:?}, expected false, true, \"source\" or \"target\"",
                    other
                ))),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// Restart delay curve, see [`RetryConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Consecutive restarts allowed before giving up. `None` = forever.
    #[serde(default)]
    pub max_attempts: Option<usize>,

    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_initial_delay() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "5m".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl BackoffConfig {
    /// Fast backoff for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: Some(10),
            initial_delay: "10ms".to_string(),
            max_delay: "100ms".to_string(),
            backoff_factor: 2.0,
        }
    }

    /// Build the retry schedule. Unparsable durations fall back to the defaults.
    pub fn retry_config(&self) -> RetryConfig {
        let defaults = RetryConfig::daemon();
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(usize::MAX),
            initial_delay: humantime::parse_duration(&self.initial_delay)
                .unwrap_or(defaults.initial_delay),
            max_delay: humantime::parse_duration(&self.max_delay).unwrap_or(defaults.max_delay),
            backoff_factor: self.backoff_factor,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationOptions
// ═══════════════════════════════════════════════════════════════════════════════

/// Options recognized by [`replicate()`](crate::replicate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationOptions {
    /// Keep tailing the source after the backlog is drained.
    #[serde(default, alias = "continuous")]
    pub live: bool,

    /// Changes per feed request, and the flush threshold of a pending batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum queued batches before the change feed is paused.
    #[serde(default = "default_batches_limit")]
    pub batches_limit: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_ids: Option<Vec<String>>,

    /// Mango-style selector evaluated by the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<serde_json::Value>,

    /// Named server-side filter (e.g. `"app/important"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Client-side predicate. Not serializable.
    #[serde(skip)]
    pub filter_fn: Option<ChangeFilter>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_params: Option<serde_json::Map<String, serde_json::Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,

    /// Feed heartbeat interval (humantime, e.g. `"10s"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<String>,

    /// Request timeout passed to the feed and bulk writes (humantime).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(default)]
    pub checkpoint: CheckpointMode,

    /// Start from this sequence instead of the stored checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<Seq>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_interval: Option<u64>,

    /// Restart automatically after transient failures.
    #[serde(default = "default_true")]
    pub retry: bool,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_batch_size() -> usize {
    100
}

fn default_batches_limit() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            live: false,
            batch_size: default_batch_size(),
            batches_limit: default_batches_limit(),
            doc_ids: None,
            selector: None,
            filter: None,
            filter_fn: None,
            query_params: None,
            view: None,
            heartbeat: None,
            timeout: None,
            checkpoint: CheckpointMode::default(),
            since: None,
            seq_interval: None,
            retry: true,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ReplicationOptions {
    /// Small batches and a fast backoff, for tests.
    pub fn for_testing() -> Self {
        Self {
            batch_size: 10,
            batches_limit: 4,
            backoff: BackoffConfig::testing(),
            ..Default::default()
        }
    }

    /// Set the client-side change filter.
    pub fn with_filter_fn(mut self, f: impl Fn(&Change) -> bool + Send + Sync + 'static) -> Self {
        self.filter_fn = Some(ChangeFilter::new(f));
        self
    }

    /// Reject options the replicator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ReplicationError::Config("batch_size must be > 0".to_string()));
        }
        if self.batches_limit == 0 {
            return Err(ReplicationError::Config("batches_limit must be > 0".to_string()));
        }
        for (name, value) in [("heartbeat", &self.heartbeat), ("timeout", &self.timeout)] {
            if let Some(raw) = value {
                humantime::parse_duration(raw).map_err(|e| {
                    ReplicationError::Config(format!("invalid {} {:?}: {}", name, raw, e))
                })?;
            }
        }
        Ok(())
    }

    pub fn heartbeat_duration(&self) -> Option<Duration> {
        self.heartbeat
            .as_deref()
            .and_then(|raw| humantime::parse_duration(raw).ok())
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
            .as_deref()
            .and_then(|raw| humantime::parse_duration(raw).ok())
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.backoff.retry_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default() {
        let options = ReplicationOptions::default();
        assert!(!options.live);
        assert_eq!(options.batch_size, 100);
        assert_eq!(options.batches_limit, 10);
        assert_eq!(options.checkpoint, CheckpointMode::Both);
        assert!(options.retry);
        assert!(options.since.is_none());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_options_from_empty_json() {
        let options: ReplicationOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.batch_size, 100);
        assert_eq!(options.batches_limit, 10);
        assert!(options.retry);
        assert_eq!(options.backoff, BackoffConfig::default());
    }

    #[test]
    fn test_continuous_alias() {
        let options: ReplicationOptions = serde_json::from_str(r#"{"continuous": true}"#).unwrap();
        assert!(options.live);
        let options: ReplicationOptions = serde_json::from_str(r#"{"live": true}"#).unwrap();
        assert!(options.live);
    }

    #[test]
    fn test_checkpoint_mode_parsing() {
        let cases = [
            ("false", CheckpointMode::Disabled),
            ("true", CheckpointMode::Both),
            ("\"source\"", CheckpointMode::Source),
            ("\"target\"", CheckpointMode::Target),
        ];
        for (input, expected) in cases {
            let parsed: CheckpointMode = serde_json::from_str(input).unwrap();
            assert_eq!(parsed, expected, "Failed for input: {}", input);
            assert_eq!(serde_json::to_string(&parsed).unwrap(), input);
        }
        assert!(serde_json::from_str::<CheckpointMode>("\"sideways\"").is_err());
    }

    #[test]
    fn test_checkpoint_mode_sides() {
        assert!(CheckpointMode::Both.writes_source() && CheckpointMode::Both.writes_target());
        assert!(CheckpointMode::Source.writes_source() && !CheckpointMode::Source.writes_target());
        assert!(!CheckpointMode::Target.writes_source() && CheckpointMode::Target.writes_target());
        assert!(!CheckpointMode::Disabled.writes_source() && !CheckpointMode::Disabled.writes_target());
    }

    #[test]
    fn test_since_accepts_numbers_and_strings() {
        let options: ReplicationOptions = serde_json::from_str(r#"{"since": 42}"#).unwrap();
        assert_eq!(options.since, Some(Seq::Num(42)));
        let options: ReplicationOptions = serde_json::from_str(r#"{"since": "42-abc"}"#).unwrap();
        assert_eq!(options.since, Some(Seq::Opaque("42-abc".to_string())));
    }

    #[test]
    fn test_durations() {
        let options = ReplicationOptions {
            heartbeat: Some("10s".to_string()),
            timeout: Some("500ms".to_string()),
            ..Default::default()
        };
        assert_eq!(options.heartbeat_duration(), Some(Duration::from_secs(10)));
        assert_eq!(options.timeout_duration(), Some(Duration::from_millis(500)));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_batch = ReplicationOptions {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(zero_batch.validate(), Err(ReplicationError::Config(_))));

        let zero_limit = ReplicationOptions {
            batches_limit: 0,
            ..Default::default()
        };
        assert!(zero_limit.validate().is_err());

        let bad_heartbeat = ReplicationOptions {
            heartbeat: Some("soon".to_string()),
            ..Default::default()
        };
        let err = bad_heartbeat.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeat"));
    }

    #[test]
    fn test_backoff_retry_config() {
        let retry = BackoffConfig::default().retry_config();
        assert_eq!(retry, RetryConfig::daemon());

        let custom = BackoffConfig {
            max_attempts: Some(3),
            initial_delay: "250ms".to_string(),
            max_delay: "2s".to_string(),
            backoff_factor: 3.0,
        };
        let retry = custom.retry_config();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay, Duration::from_millis(250));
        assert_eq!(retry.max_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_invalid_fallback() {
        let config = BackoffConfig {
            initial_delay: "invalid".to_string(),
            ..Default::default()
        };
        assert_eq!(config.retry_config().initial_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_filter_fn_not_serialized() {
        let options = ReplicationOptions::default().with_filter_fn(|c| c.id.starts_with("a"));
        let json = serde_json::to_string(&options).unwrap();
        assert!(!json.contains("filter_fn"));
        let parsed: ReplicationOptions = serde_json::from_str(&json).unwrap();
        assert!(parsed.filter_fn.is_none());
        assert!(options.filter_fn.is_some());
    }

    #[test]
    fn test_for_testing_options() {
        let options = ReplicationOptions::for_testing();
        assert_eq!(options.batch_size, 10);
        assert_eq!(options.retry_config(), RetryConfig::testing());
    }
}
