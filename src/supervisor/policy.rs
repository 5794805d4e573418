//! Restart policy for the supervised training process.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Restart decision parameters.
///
/// Mutated only through [`RestartPolicy::apply`]; the supervisor's exit
/// handling always works from a snapshot taken at the moment of exit.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed per training session before giving up.
    pub max_restarts: u32,
    /// Constant delay before a restart attempt.
    pub backoff_seconds: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            backoff_seconds: 10,
        }
    }
}

/// The outcome of a restart decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartDecision {
    pub restart: bool,
    pub delay: Duration,
}

impl RestartPolicy {
    /// Decide whether the process should be restarted after an exit.
    ///
    /// Pure: the exit code is recorded by the caller but does not influence
    /// the decision, only the restart budget does.
    pub fn decide(&self, _exit_code: Option<i32>, restarts_so_far: u32) -> RestartDecision {
        if restarts_so_far >= self.max_restarts {
            RestartDecision {
                restart: false,
                delay: Duration::ZERO,
            }
        } else {
            RestartDecision {
                restart: true,
                delay: Duration::from_secs(self.backoff_seconds),
            }
        }
    }

    /// Apply a partial update, returning the resulting policy.
    pub fn apply(&mut self, patch: PolicyPatch) -> RestartPolicy {
        if let Some(max_restarts) = patch.max_restarts {
            self.max_restarts = max_restarts;
        }
        if let Some(backoff_seconds) = patch.backoff_seconds {
            self.backoff_seconds = backoff_seconds;
        }
        *self
    }
}

/// A PATCH-style partial policy update.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct PolicyPatch {
    pub max_restarts: Option<u32>,
    #[serde(alias = "restart_backoff_sec", alias = "backoff_sec")]
    pub backoff_seconds: Option<u64>,
}

impl PolicyPatch {
    pub fn is_empty(&self) -> bool {
        self.max_restarts.is_none() && self.backoff_seconds.is_none()
    }
}
