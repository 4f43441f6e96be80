//! Storm Budget
//!
//! Guards a session against runaway amplification: an effect that starts
//! async work, whose result triggers the effect again, can otherwise flood
//! the process with tasks.
//!
//! # How It Works
//!
//! 1. Every async start names a category (`keyed_async`, `spawn`, `timer`).
//!    Categories without a configured limit are unlimited.
//!
//! 2. Each category counts starts in a fixed window. The first start after
//!    the window has elapsed opens a new one.
//!
//! 3. A start past the limit is denied with [`BudgetError::Exceeded`] and the
//!    work is never started. In strict mode the first breach also opens the
//!    circuit: every later start fails with [`BudgetError::CircuitOpen`] and
//!    the session loop terminates the session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, warn};

use crate::config::BudgetConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    #[error("`{category}` budget exhausted: {limit} starts per {window_ms}ms")]
    Exceeded {
        category: String,
        limit: u32,
        window_ms: u64,
    },

    #[error("circuit breaker open after a `{category}` budget breach")]
    CircuitOpen { category: String },
}

impl BudgetError {
    pub fn category(&self) -> &str {
        match self {
            BudgetError::Exceeded { category, .. } | BudgetError::CircuitOpen { category } => category,
        }
    }
}

#[derive(Debug)]
struct Window {
    opened: Instant,
    used: u32,
}

/// Per-session limiter shared between the loop and its task spawner.
#[derive(Debug)]
pub struct StormBudget {
    config: BudgetConfig,
    windows: Mutex<HashMap<String, Window>>,
    tripped: AtomicBool,
    /// Category of the breach that opened the circuit.
    breach: Mutex<Option<String>>,
}

impl StormBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            tripped: AtomicBool::new(false),
            breach: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Count one start in `category`, or refuse it.
    pub fn try_acquire(&self, category: &str) -> Result<(), BudgetError> {
        self.try_acquire_at(category, Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, category: &str, now: Instant) -> Result<(), BudgetError> {
        if let Some(category) = self.breach.lock().clone() {
            return Err(BudgetError::CircuitOpen { category });
        }
        let Some(&limit) = self.config.limits.get(category) else {
            return Ok(());
        };

        let mut windows = self.windows.lock();
        let window = windows.entry(category.to_string()).or_insert(Window { opened: now, used: 0 });
        if now.saturating_duration_since(window.opened) >= self.config.window() {
            window.opened = now;
            window.used = 0;
        }
        if window.used < limit {
            window.used += 1;
            return Ok(());
        }
        drop(windows);

        let err = BudgetError::Exceeded {
            category: category.to_string(),
            limit,
            window_ms: self.config.window_ms,
        };
        if self.config.strict {
            self.tripped.store(true, Ordering::Release);
            self.breach.lock().get_or_insert_with(|| category.to_string());
            error!(category, limit, "storm budget breached; circuit open");
        } else {
            warn!(category, limit, "storm budget exhausted; start denied");
        }
        Err(err)
    }

    /// Whether a strict-mode breach has opened the circuit.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn tripped_by(&self) -> Option<String> {
        self.breach.lock().clone()
    }

    /// Starts left in the current window, `None` when unlimited.
    pub fn remaining(&self, category: &str) -> Option<u32> {
        let limit = *self.config.limits.get(category)?;
        let windows = self.windows.lock();
        let used = windows
            .get(category)
            .filter(|window| window.opened.elapsed() < self.config.window())
            .map_or(0, |window| window.used);
        Some(limit.saturating_sub(used))
    }
}

impl Default for StormBudget {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}

// ---- Tests ----
