use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use super::producer::{PublishClass, SampleProducer};
use super::ConfigLock;
use crate::config::Config;
use crate::error::AppError;
use crate::fixtures::{self, MockBrokerTransport};

fn setup() -> Result<(SampleProducer, Arc<ConfigLock>, Arc<MockBrokerTransport>, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let lock = Arc::new(ConfigLock::new());
    let transport = Arc::new(MockBrokerTransport::new());
    let producer = SampleProducer::new(config, lock.clone(), transport.clone());
    Ok((producer, lock, transport, tmpdir))
}

#[tokio::test]
async fn publish_without_active_config_is_rejected() -> Result<()> {
    let (producer, _lock, _transport, _tmpdir) = setup()?;

    let err = producer
        .publish(&[fixtures::sample("u1", "i1")])
        .await
        .expect_err("expected publish without a config to fail");
    let app_err = err.downcast_ref::<AppError>().expect("expected an AppError");
    assert!(matches!(app_err, AppError::NoActiveConfig), "got {:?}, expected NoActiveConfig", app_err);
    Ok(())
}

#[tokio::test]
async fn publish_keys_records_by_user_id() -> Result<()> {
    let (producer, lock, transport, _tmpdir) = setup()?;
    lock.try_lock(&fixtures::broker_config())?;

    let mut keyless = fixtures::sample("u0", "i0");
    keyless.remove("user_id");
    let mut numeric = fixtures::sample("u0", "i2");
    numeric.insert("user_id".into(), json!(42));
    let samples = vec![fixtures::sample("u1", "i1"), numeric, keyless];

    let outcome = producer.publish(&samples).await?;
    assert_eq!(outcome.classify(), PublishClass::Complete, "got {:?}", outcome.classify());
    assert_eq!(outcome.published, 3, "got {}, expected 3 published", outcome.published);

    let records = transport.published();
    let keys = records.iter().map(|r| r.key.as_deref()).collect::<Vec<_>>();
    assert_eq!(keys, vec![Some("u1"), Some("42"), None], "got {:?}", keys);
    let decoded: serde_json::Value = serde_json::from_slice(&records[0].payload)?;
    assert_eq!(decoded["item_id"], "i1", "got {:?}, expected the sample payload intact", decoded);
    Ok(())
}

#[tokio::test]
async fn partial_failure_reports_per_sample_results() -> Result<()> {
    let (producer, lock, transport, _tmpdir) = setup()?;
    lock.try_lock(&fixtures::broker_config())?;
    transport.fail_key("u2");

    let samples = vec![
        fixtures::sample("u1", "i1"),
        fixtures::sample("u2", "i2"),
        fixtures::sample("u3", "i3"),
    ];
    let outcome = producer.publish(&samples).await?;
    assert_eq!(outcome.classify(), PublishClass::Partial, "got {:?}", outcome.classify());
    assert_eq!(outcome.published, 2, "got {}, expected 2 published", outcome.published);
    assert_eq!(outcome.failed, 1, "got {}, expected 1 failed", outcome.failed);
    assert!(outcome.results[0].succeeded, "expected first sample to succeed");
    assert!(!outcome.results[1].succeeded, "expected second sample to fail");
    assert!(
        outcome.results[1].error.is_some(),
        "expected an error message on the failed sample",
    );
    assert!(outcome.results[2].succeeded, "expected third sample to succeed");
    Ok(())
}

#[tokio::test]
async fn transport_failure_fails_the_whole_batch() -> Result<()> {
    let (producer, lock, transport, _tmpdir) = setup()?;
    lock.try_lock(&fixtures::broker_config())?;
    transport.set_down(true);

    let samples = vec![fixtures::sample("u1", "i1"), fixtures::sample("u2", "i2")];
    let outcome = producer.publish(&samples).await?;
    assert_eq!(outcome.classify(), PublishClass::Failed, "got {:?}", outcome.classify());
    assert_eq!(outcome.published, 0, "got {}, expected nothing published", outcome.published);
    assert_eq!(outcome.results.len(), 2, "got {}, expected one ack per sample", outcome.results.len());
    assert!(
        outcome.results.iter().all(|ack| ack.error.is_some()),
        "expected error details on every ack",
    );
    Ok(())
}

#[tokio::test]
async fn empty_batch_publishes_nothing() -> Result<()> {
    let (producer, lock, transport, _tmpdir) = setup()?;
    lock.try_lock(&fixtures::broker_config())?;

    let outcome = producer.publish(&[]).await?;
    assert_eq!(outcome.classify(), PublishClass::Complete, "got {:?}", outcome.classify());
    assert_eq!(outcome.total, 0, "got {}, expected an empty outcome", outcome.total);
    assert!(transport.published().is_empty(), "expected no records sent");
    Ok(())
}
