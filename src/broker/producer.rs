//! Training sample producer.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::broker::transport::{BrokerRecord, BrokerTransport, RecordAck};
use crate::broker::ConfigLock;
use crate::config::Config;
use crate::error::AppError;

/// A training sample: an open record keyed by field name.
///
/// Only `user_id` is interpreted, everything else passes through opaquely.
pub type Sample = serde_json::Map<String, Value>;

/// The aggregated result of one publish batch.
#[derive(Clone, Debug, Serialize)]
pub struct PublishOutcome {
    pub published: usize,
    pub failed: usize,
    pub total: usize,
    pub results: Vec<RecordAck>,
}

/// Batch-level classification of a publish outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishClass {
    /// Every sample published.
    Complete,
    /// Some but not all samples published.
    Partial,
    /// No sample published.
    Failed,
}

impl PublishOutcome {
    fn from_acks(acks: Vec<RecordAck>) -> Self {
        let published = acks.iter().filter(|ack| ack.succeeded).count();
        Self {
            published,
            failed: acks.len() - published,
            total: acks.len(),
            results: acks,
        }
    }

    fn all_failed(total: usize, reason: &str) -> Self {
        Self {
            published: 0,
            failed: total,
            total,
            results: (0..total).map(|_| RecordAck::failed(reason)).collect(),
        }
    }

    pub fn classify(&self) -> PublishClass {
        if self.failed == 0 {
            PublishClass::Complete
        } else if self.published > 0 {
            PublishClass::Partial
        } else {
            PublishClass::Failed
        }
    }
}

/// Publishes training samples to the locked topic with per-sample accounting.
pub struct SampleProducer {
    config: Arc<Config>,
    lock: Arc<ConfigLock>,
    transport: Arc<dyn BrokerTransport>,
}

impl SampleProducer {
    pub fn new(config: Arc<Config>, lock: Arc<ConfigLock>, transport: Arc<dyn BrokerTransport>) -> Self {
        Self { config, lock, transport }
    }

    /// Publish one batch of samples to the active config's topic.
    ///
    /// Each sample is attempted independently; a connection-level transport
    /// failure fails the remaining samples without synchronous retry. The
    /// whole batch is bounded by the configured publish timeout.
    pub async fn publish(&self, samples: &[Sample]) -> Result<PublishOutcome> {
        let active = match self.lock.snapshot() {
            Some(active) => active,
            None => bail!(AppError::NoActiveConfig),
        };
        let records = samples
            .iter()
            .map(|sample| {
                let payload = serde_json::to_vec(sample).context("error serializing sample")?;
                Ok(BrokerRecord { key: message_key(sample), payload })
            })
            .collect::<Result<Vec<_>>>()?;

        let total = records.len();
        let publish = self.transport.publish(&active.config, records);
        let outcome = match tokio::time::timeout(self.config.publish_timeout(), publish).await {
            Ok(Ok(acks)) => PublishOutcome::from_acks(acks),
            Ok(Err(err)) => {
                tracing::warn!(error = ?err, topic = %active.config.topic, "publish batch failed");
                PublishOutcome::all_failed(total, &err.to_string())
            }
            Err(_elapsed) => {
                tracing::warn!(topic = %active.config.topic, "publish batch timed out");
                PublishOutcome::all_failed(total, "publish timed out")
            }
        };
        if outcome.failed > 0 {
            tracing::warn!(published = outcome.published, total = outcome.total, topic = %active.config.topic, "partial batch publish");
        } else {
            tracing::debug!(published = outcome.published, topic = %active.config.topic, "published samples");
        }
        Ok(outcome)
    }
}

/// The broker message key for a sample: its `user_id` when scalar, else none.
fn message_key(sample: &Sample) -> Option<String> {
    match sample.get("user_id") {
        Some(Value::String(val)) => Some(val.clone()),
        Some(Value::Number(val)) => Some(val.to_string()),
        Some(Value::Bool(val)) => Some(val.to_string()),
        _ => None,
    }
}
