//! Runtime configuration.
//!
//! All knobs live in [`RuntimeConfig`], which deserializes from JSON with
//! every field optional:
//!
//! ```json
//! {
//!   "mode": "production",
//!   "usage_policy": "invalidate_session",
//!   "max_commit_cycles": 8,
//!   "budget": { "window_ms": 500, "limits": { "keyed_async": 4 }, "strict": true }
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Development mode checks more and reports louder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Development,
    Production,
}

/// What production does after a usage error has been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsagePolicy {
    /// Log, record, and keep the session running.
    #[default]
    Continue,
    /// Log, record, and terminate the session.
    InvalidateSession,
}

/// Hard ceilings enforced by the wire codec in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecLimits {
    /// Longest string or byte payload, in bytes.
    pub max_string_len: usize,
    /// Most entries in one collection (attributes, children, form fields).
    pub max_collection_len: usize,
    /// Most patches in one batch.
    pub max_batch_len: usize,
    /// Deepest node nesting inside an inserted subtree.
    pub max_depth: usize,
    /// Largest frame body, in bytes.
    pub max_frame_len: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_string_len: 64 * 1024,
            max_collection_len: 4096,
            max_batch_len: 65_536,
            max_depth: 64,
            max_frame_len: 1024 * 1024,
        }
    }
}

/// Storm budget: how many async starts each category may make per window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub window_ms: u64,
    pub limits: HashMap<String, u32>,
    /// Trip the circuit breaker and terminate the session on the first breach.
    pub strict: bool,
}

impl BudgetConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Replace the limit for one category.
    #[must_use]
    pub fn with_limit(mut self, category: impl Into<String>, limit: u32) -> Self {
        self.limits.insert(category.into(), limit);
        self
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            window_ms: 1_000,
            limits: HashMap::from([
                ("keyed_async".to_string(), 32),
                ("spawn".to_string(), 64),
                ("timer".to_string(), 64),
            ]),
            strict: false,
        }
    }
}

/// Session lifecycle and protocol settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub protocol_version: u32,
    /// How long a detached session stays live before it is evicted.
    pub grace_window_ms: u64,
    /// Expiry handed to the durable store when a session is saved.
    pub persist_ttl_ms: u64,
    /// Largest accepted handshake message, in bytes.
    pub max_handshake_len: usize,
}

impl SessionConfig {
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn persist_ttl(&self) -> Duration {
        Duration::from_millis(self.persist_ttl_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol_version: crate::codec::PROTOCOL_VERSION,
            grace_window_ms: 30_000,
            persist_ttl_ms: 3_600_000,
            max_handshake_len: 64 * 1024,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub mode: Mode,
    pub usage_policy: UsagePolicy,
    /// Upper bound on commit cycles triggered by effects within one unit of work.
    pub max_commit_cycles: usize,
    pub limits: CodecLimits,
    pub budget: BudgetConfig,
    pub session: SessionConfig,
}

impl RuntimeConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Cross-thread mutation checks run in development mode and debug builds.
    pub fn detect_cross_thread(&self) -> bool {
        self.mode == Mode::Development || cfg!(debug_assertions)
    }

    pub fn is_production(&self) -> bool {
        self.mode == Mode::Production
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            usage_policy: UsagePolicy::default(),
            max_commit_cycles: 16,
            limits: CodecLimits::default(),
            budget: BudgetConfig::default(),
            session: SessionConfig::default(),
        }
    }
}
