//! Test fixtures.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::broker::transport::{BrokerRecord, BrokerTransport, PreviewMessage, RecordAck};
use crate::broker::BrokerConfig;
use crate::error::AppError;

/// A broker config matching the server defaults.
pub fn broker_config() -> BrokerConfig {
    BrokerConfig {
        servers: "localhost:9092".into(),
        topic: "easyrec_training".into(),
        group: "easyrec_online".into(),
        offset_time: None,
    }
}

/// A JSON training sample keyed by `user_id`.
pub fn sample(user_id: &str, item_id: &str) -> serde_json::Map<String, Value> {
    let val = json!({
        "user_id": user_id,
        "item_id": item_id,
        "label": 1,
        "features": {"age": 30, "city": "hangzhou"},
    });
    match val {
        Value::Object(map) => map,
        _ => unreachable!("sample literal is an object"),
    }
}

/// Write an executable shell script under `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> Result<String> {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).context("error writing test script")?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .context("error marking test script executable")?;
    Ok(path.display().to_string())
}

#[derive(Default)]
struct MockState {
    published: Vec<BrokerRecord>,
    fail_keys: HashSet<String>,
    down: bool,
    offsets: BTreeMap<i32, i64>,
    preview: Vec<PreviewMessage>,
    preview_groups: Vec<String>,
}

/// In-memory `BrokerTransport` with scripted failures.
#[derive(Clone, Default)]
pub struct MockBrokerTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockBrokerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the broker being unreachable.
    pub fn set_down(&self, down: bool) {
        self.lock().down = down;
    }

    /// Records carrying this key will be acked as failed.
    pub fn fail_key(&self, key: &str) {
        self.lock().fail_keys.insert(key.to_string());
    }

    pub fn set_offsets(&self, offsets: BTreeMap<i32, i64>) {
        self.lock().offsets = offsets;
    }

    pub fn set_preview(&self, preview: Vec<PreviewMessage>) {
        self.lock().preview = preview;
    }

    /// All records publish() was asked to send, in order.
    pub fn published(&self) -> Vec<BrokerRecord> {
        self.lock().published.clone()
    }

    /// The groups fetch_preview was invoked with, in order.
    pub fn preview_groups(&self) -> Vec<String> {
        self.lock().preview_groups.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl BrokerTransport for MockBrokerTransport {
    async fn publish(&self, _config: &BrokerConfig, records: Vec<BrokerRecord>) -> Result<Vec<RecordAck>> {
        let mut state = self.lock();
        if state.down {
            anyhow::bail!(AppError::BrokerUnavailable("mock broker is down".into()));
        }
        let mut acks = Vec::with_capacity(records.len());
        for record in records {
            let fails = record
                .key
                .as_deref()
                .map(|key| state.fail_keys.contains(key))
                .unwrap_or(false);
            if fails {
                acks.push(RecordAck::failed("scripted failure"));
            } else {
                state.published.push(record);
                acks.push(RecordAck::ok());
            }
        }
        Ok(acks)
    }

    async fn fetch_offsets(&self, _config: &BrokerConfig) -> Result<BTreeMap<i32, i64>> {
        let state = self.lock();
        if state.down {
            anyhow::bail!(AppError::BrokerUnavailable("mock broker is down".into()));
        }
        Ok(state.offsets.clone())
    }

    async fn fetch_preview(&self, _config: &BrokerConfig, group: &str, max_messages: usize, _timeout: Duration) -> Result<Vec<PreviewMessage>> {
        let mut state = self.lock();
        if state.down {
            anyhow::bail!(AppError::BrokerUnavailable("mock broker is down".into()));
        }
        state.preview_groups.push(group.to_string());
        Ok(state.preview.iter().take(max_messages).cloned().collect())
    }
}
