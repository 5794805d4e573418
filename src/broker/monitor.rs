//! Read-only monitoring consumer.
//!
//! All reads run against the derived `<group>-monitor` consumer group and
//! never commit, so the training group's committed offsets are unreachable
//! from any monitoring code path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use tokio::sync::watch;

use crate::broker::transport::{BrokerTransport, PreviewMessage};
use crate::broker::ConfigLock;
use crate::error::AppError;
use crate::supervisor::{TrainingState, TrainingStatus};

/// The largest preview batch a single request may ask for.
const MAX_PREVIEW_BATCH: usize = 1_000;
/// The longest a single preview fetch may run.
const MAX_PREVIEW_TIMEOUT: Duration = Duration::from_secs(60);

/// A read-only view of topic state, derived on demand and never persisted.
#[derive(Clone, Debug, Serialize)]
pub struct MonitoringSnapshot {
    pub connected: bool,
    pub running: bool,
    pub topic: String,
    pub group: String,
    pub current_offsets: BTreeMap<i32, i64>,
}

/// Diagnostic consumer bound to the monitoring group.
pub struct MonitoringConsumer {
    lock: Arc<ConfigLock>,
    transport: Arc<dyn BrokerTransport>,
    status_rx: watch::Receiver<TrainingStatus>,
}

impl MonitoringConsumer {
    pub fn new(lock: Arc<ConfigLock>, transport: Arc<dyn BrokerTransport>, status_rx: watch::Receiver<TrainingStatus>) -> Self {
        Self { lock, transport, status_rx }
    }

    /// Current topic state as observed through the monitoring group.
    pub async fn status(&self) -> Result<MonitoringSnapshot> {
        let active = match self.lock.snapshot() {
            Some(active) => active,
            None => bail!(AppError::NoActiveConfig),
        };
        let running = self.status_rx.borrow().state == TrainingState::Running;
        let offsets = self.transport.fetch_offsets(&active.config).await.map_err(broker_err)?;
        Ok(MonitoringSnapshot {
            connected: true,
            running,
            topic: active.config.topic.clone(),
            group: active.config.monitor_group(),
            current_offsets: offsets,
        })
    }

    /// Fetch up to `batch_size` raw messages within `timeout` for inspection.
    ///
    /// Offsets are not committed for any group on this path.
    pub async fn preview_consume(&self, batch_size: usize, timeout: Duration) -> Result<Vec<PreviewMessage>> {
        let active = match self.lock.snapshot() {
            Some(active) => active,
            None => bail!(AppError::NoActiveConfig),
        };
        let batch_size = batch_size.clamp(1, MAX_PREVIEW_BATCH);
        let timeout = timeout.min(MAX_PREVIEW_TIMEOUT);
        let monitor_group = active.config.monitor_group();
        self.transport
            .fetch_preview(&active.config, &monitor_group, batch_size, timeout)
            .await
            .map_err(broker_err)
    }
}

/// Classify a transport error as `BrokerUnavailable` unless already typed.
fn broker_err(err: anyhow::Error) -> anyhow::Error {
    if err.downcast_ref::<AppError>().is_some() {
        err
    } else {
        anyhow!(AppError::BrokerUnavailable(err.to_string()))
    }
}
