use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::sync::watch;

use super::monitor::MonitoringConsumer;
use super::transport::PreviewMessage;
use super::ConfigLock;
use crate::error::AppError;
use crate::fixtures::{self, MockBrokerTransport};
use crate::supervisor::{RestartPolicy, TrainingState, TrainingStatus};

fn setup() -> (MonitoringConsumer, Arc<ConfigLock>, Arc<MockBrokerTransport>, watch::Sender<TrainingStatus>) {
    let lock = Arc::new(ConfigLock::new());
    let transport = Arc::new(MockBrokerTransport::new());
    let (status_tx, status_rx) = watch::channel(TrainingStatus {
        state: TrainingState::Idle,
        session: None,
        policy: RestartPolicy::default(),
    });
    let consumer = MonitoringConsumer::new(lock.clone(), transport.clone(), status_rx);
    (consumer, lock, transport, status_tx)
}

#[tokio::test]
async fn status_without_active_config_is_rejected() {
    let (consumer, _lock, _transport, _status_tx) = setup();

    let err = consumer.status().await.expect_err("expected status without a config to fail");
    let app_err = err.downcast_ref::<AppError>().expect("expected an AppError");
    assert!(matches!(app_err, AppError::NoActiveConfig), "got {:?}, expected NoActiveConfig", app_err);
}

#[tokio::test]
async fn status_reports_offsets_and_monitor_group() -> Result<()> {
    let (consumer, lock, transport, status_tx) = setup();
    lock.try_lock(&fixtures::broker_config())?;
    transport.set_offsets(BTreeMap::from([(0, 42), (1, 7)]));

    let snapshot = consumer.status().await?;
    assert!(snapshot.connected, "expected connected=true");
    assert!(!snapshot.running, "expected running=false while idle");
    assert_eq!(snapshot.topic, "easyrec_training", "got {}", snapshot.topic);
    assert_eq!(snapshot.group, "easyrec_online-monitor", "got {}", snapshot.group);
    assert_eq!(snapshot.current_offsets, BTreeMap::from([(0, 42), (1, 7)]), "got {:?}", snapshot.current_offsets);

    status_tx.send_modify(|status| status.state = TrainingState::Running);
    let snapshot = consumer.status().await?;
    assert!(snapshot.running, "expected running=true once training runs");
    Ok(())
}

#[tokio::test]
async fn status_surfaces_broker_unavailability() -> Result<()> {
    let (consumer, lock, transport, _status_tx) = setup();
    lock.try_lock(&fixtures::broker_config())?;
    transport.set_down(true);

    let err = consumer.status().await.expect_err("expected status to fail while broker is down");
    let app_err = err.downcast_ref::<AppError>().expect("expected an AppError");
    assert!(matches!(app_err, AppError::BrokerUnavailable(_)), "got {:?}, expected BrokerUnavailable", app_err);
    assert!(app_err.is_retriable(), "expected a retriable error");
    Ok(())
}

#[tokio::test]
async fn preview_reads_through_the_monitor_group() -> Result<()> {
    let (consumer, lock, transport, _status_tx) = setup();
    lock.try_lock(&fixtures::broker_config())?;
    transport.set_preview(vec![PreviewMessage {
        partition: 0,
        offset: 11,
        key: Some("u1".into()),
        value: json!({"user_id": "u1"}),
    }]);

    let messages = consumer.preview_consume(10, Duration::from_secs(1)).await?;
    assert_eq!(messages.len(), 1, "got {}, expected one message", messages.len());
    assert_eq!(messages[0].offset, 11, "got {}", messages[0].offset);

    let groups = transport.preview_groups();
    assert_eq!(
        groups,
        vec!["easyrec_online-monitor".to_string()],
        "got {:?}, expected reads only through the monitor group", groups,
    );
    Ok(())
}

#[tokio::test]
async fn preview_clamps_batch_size() -> Result<()> {
    let (consumer, lock, transport, _status_tx) = setup();
    lock.try_lock(&fixtures::broker_config())?;
    transport.set_preview(
        (0..3)
            .map(|idx| PreviewMessage {
                partition: 0,
                offset: idx,
                key: None,
                value: json!(idx),
            })
            .collect(),
    );

    // A zero batch size is clamped up to one message.
    let messages = consumer.preview_consume(0, Duration::from_secs(1)).await?;
    assert_eq!(messages.len(), 1, "got {}, expected the clamped single message", messages.len());
    Ok(())
}
