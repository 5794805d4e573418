//! Broker configuration and the process-wide config lock.
//!
//! At most one broker config is active at a time. An authoritative lock is
//! taken by `training/start`; a provisional lock may be established earlier by
//! an ingestion request carrying an inline config. Readers (producer,
//! monitoring consumer) always load a snapshot, never a reference that could
//! observe a half-applied change.

pub mod monitor;
#[cfg(test)]
mod monitor_test;
pub mod producer;
#[cfg(test)]
mod producer_test;
pub mod transport;

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// The suffix appended to the training group to derive the monitoring group.
pub const MONITOR_GROUP_SUFFIX: &str = "-monitor";

/// The consumer group used when a config omits one.
pub const DEFAULT_GROUP: &str = "easyrec_online";

/// A broker connection/topic/group descriptor.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Comma-separated `host:port` bootstrap servers.
    pub servers: String,
    /// The topic carrying training samples.
    pub topic: String,
    /// The consumer group of the training process.
    #[serde(default = "default_group")]
    pub group: String,
    /// Optional start position (`YYYYMMDD HH:MM:SS` or unix seconds) for the
    /// training consumer. Passed through to the child process, never
    /// interpreted here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_time: Option<String>,
}

fn default_group() -> String {
    DEFAULT_GROUP.into()
}

impl BrokerConfig {
    /// Validate this config, surfacing an `InvalidInput` error on bad fields.
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            bail!(AppError::InvalidInput("kafka_config.topic must be non-empty".into()));
        }
        if self.group.trim().is_empty() {
            bail!(AppError::InvalidInput("kafka_config.group must be non-empty".into()));
        }
        let mut bad = vec![];
        let mut seen_any = false;
        for part in self.servers.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            seen_any = true;
            match part.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() => match port.parse::<u32>() {
                    Ok(p) if (1..=65535).contains(&p) => (),
                    _ => bad.push(part.to_string()),
                },
                _ => bad.push(part.to_string()),
            }
        }
        if !seen_any {
            bail!(AppError::InvalidInput("kafka_config.servers must be non-empty".into()));
        }
        if !bad.is_empty() {
            bail!(AppError::InvalidInput(format!("invalid bootstrap servers entries: {:?}", bad)));
        }
        Ok(())
    }

    /// The derived monitoring consumer group. Always computed, never stored.
    pub fn monitor_group(&self) -> String {
        format!("{}{}", self.group, MONITOR_GROUP_SUFFIX)
    }

    /// The bootstrap servers as individual host strings.
    pub fn hosts(&self) -> Vec<String> {
        self.servers.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
    }

    /// Describe how this config conflicts with `other`, if it does.
    ///
    /// `offset_time` is a start position rather than config identity, so it
    /// never participates in conflict detection.
    fn conflict_with(&self, other: &BrokerConfig) -> Option<String> {
        let mut diffs = vec![];
        if self.servers != other.servers {
            diffs.push("servers");
        }
        if self.topic != other.topic {
            diffs.push("topic");
        }
        if self.group != other.group {
            diffs.push("group");
        }
        if diffs.is_empty() {
            None
        } else {
            Some(format!("active config differs on {}", diffs.join(", ")))
        }
    }
}

/// How the active config was established.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    /// Adopted lazily by an ingestion request; may still be upgraded by `start`.
    Provisional,
    /// Locked by `training/start` for the lifetime of the session.
    Authoritative,
}

/// The active broker config together with its provenance.
#[derive(Clone, Debug)]
pub struct ActiveConfig {
    pub config: BrokerConfig,
    pub state: LockState,
}

/// A description of the active config for the `streaming/config` surface.
#[derive(Clone, Debug, Serialize)]
pub struct ActiveDescriptor {
    #[serde(flatten)]
    pub config: BrokerConfig,
    pub monitor_group: String,
    pub state: LockState,
}

/// The process-wide holder of the active broker config.
///
/// Mutations serialize behind a mutex; reads load a lock-free snapshot.
pub struct ConfigLock {
    current: ArcSwapOption<ActiveConfig>,
    write_guard: Mutex<()>,
}

impl Default for ConfigLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLock {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::const_empty(),
            write_guard: Mutex::new(()),
        }
    }

    /// A snapshot of the currently active config, if any.
    pub fn snapshot(&self) -> Option<Arc<ActiveConfig>> {
        self.current.load_full()
    }

    /// Take the authoritative lock for the given config.
    ///
    /// Succeeds when unlocked, or when the proposed config equals the active
    /// one (idempotent restart, or upgrade of a provisional bootstrap).
    /// Returns the previous holder state so a failed `start` can restore it.
    pub fn try_lock(&self, config: &BrokerConfig) -> Result<Option<Arc<ActiveConfig>>> {
        let _guard = self.write_lock();
        let prev = self.current.load_full();
        if let Some(active) = prev.as_deref() {
            if let Some(reason) = active.config.conflict_with(config) {
                bail!(AppError::ConfigConflict(reason));
            }
        }
        self.current.store(Some(Arc::new(ActiveConfig {
            config: config.clone(),
            state: LockState::Authoritative,
        })));
        Ok(prev)
    }

    /// Adopt the given config as a provisional lock if none is active.
    ///
    /// An existing lock with equal identity is returned unchanged; a differing
    /// one is a conflict.
    pub fn bootstrap_if_absent(&self, config: &BrokerConfig) -> Result<Arc<ActiveConfig>> {
        let _guard = self.write_lock();
        if let Some(active) = self.current.load_full() {
            if let Some(reason) = active.config.conflict_with(config) {
                bail!(AppError::ConfigConflict(reason));
            }
            return Ok(active);
        }
        let active = Arc::new(ActiveConfig {
            config: config.clone(),
            state: LockState::Provisional,
        });
        self.current.store(Some(active.clone()));
        Ok(active)
    }

    /// Release the lock entirely.
    pub fn release(&self) {
        let _guard = self.write_lock();
        self.current.store(None);
    }

    /// Restore a previously captured holder state, undoing a failed `start`.
    pub fn restore(&self, prev: Option<Arc<ActiveConfig>>) {
        let _guard = self.write_lock();
        self.current.store(prev);
    }

    /// Describe the active config, monitor group included.
    pub fn describe(&self) -> Option<ActiveDescriptor> {
        self.current.load_full().map(|active| ActiveDescriptor {
            monitor_group: active.config.monitor_group(),
            config: active.config.clone(),
            state: active.state,
        })
    }

    fn write_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.write_guard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
