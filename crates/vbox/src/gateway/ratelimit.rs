//! Per-user, per-operation fixed-window budgets.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::settings::{LimitsConfig, RateBudget};

/// Mutating operations metered independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Save,
    CreateFile,
    CreateFolder,
    Delete,
    Rename,
}

impl Operation {
    pub fn label(self) -> &'static str {
        match self {
            Operation::Save => "file saving",
            Operation::CreateFile => "file creation",
            Operation::CreateFolder => "folder creation",
            Operation::Delete => "file deletion",
            Operation::Rename => "file renaming",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    used: u32,
}

/// Fixed-window counter per `(operation, user)`.
pub struct RateLimiter {
    limits: LimitsConfig,
    windows: DashMap<(Operation, String), Window>,
}

impl RateLimiter {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            limits: limits.clone(),
            windows: DashMap::new(),
        }
    }

    fn budget(&self, op: Operation) -> RateBudget {
        match op {
            Operation::Save => self.limits.save,
            Operation::CreateFile => self.limits.create_file,
            Operation::CreateFolder => self.limits.create_folder,
            Operation::Delete => self.limits.delete,
            Operation::Rename => self.limits.rename,
        }
    }

    /// Spend one point. `Err` carries the time until the window resets.
    pub fn consume(&self, op: Operation, user_id: &str) -> Result<(), Duration> {
        self.consume_at(op, user_id, Instant::now())
    }

    fn consume_at(&self, op: Operation, user_id: &str, now: Instant) -> Result<(), Duration> {
        let budget = self.budget(op);
        let window = budget.window();
        let mut entry = self
            .windows
            .entry((op, user_id.to_string()))
            .or_insert(Window {
                started: now,
                used: 0,
            });
        let elapsed = now.saturating_duration_since(entry.started);
        if elapsed >= window {
            entry.started = now;
            entry.used = 0;
        }
        if entry.used >= budget.points {
            return Err(window.saturating_sub(now.saturating_duration_since(entry.started)));
        }
        entry.used += 1;
        Ok(())
    }

    /// Drop windows that have fully elapsed.
    pub fn prune(&self) {
        let now = Instant::now();
        let longest = [
            Operation::Save,
            Operation::CreateFile,
            Operation::CreateFolder,
            Operation::Delete,
            Operation::Rename,
        ]
        .into_iter()
        .map(|op| self.budget(op).window())
        .max()
        .unwrap_or_default();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < longest);
    }
}
