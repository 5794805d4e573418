//! Per-request ingestion entry point.

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::broker::producer::{PublishOutcome, Sample, SampleProducer};
use crate::broker::{BrokerConfig, ConfigLock};
use crate::error::AppError;

/// Resolves which broker config an ingestion request runs under and delegates
/// to the sample producer.
///
/// A request carrying an inline config may bootstrap a provisional lock when
/// none is active yet; a conflicting inline config rejects the whole batch
/// before anything is published.
pub struct IngestionGateway {
    lock: Arc<ConfigLock>,
    producer: SampleProducer,
}

impl IngestionGateway {
    pub fn new(lock: Arc<ConfigLock>, producer: SampleProducer) -> Self {
        Self { lock, producer }
    }

    /// Ingest one batch of samples.
    pub async fn add(&self, samples: &[Sample], inline_config: Option<&BrokerConfig>) -> Result<PublishOutcome> {
        if samples.is_empty() {
            bail!(AppError::InvalidInput("samples must be a non-empty array".into()));
        }
        if let Some(config) = inline_config {
            config.validate()?;
            self.lock.bootstrap_if_absent(config)?;
        }
        // With no inline config and no active lock, the producer surfaces
        // NoActiveConfig.
        self.producer.publish(samples).await
    }
}
