//! Broker transport capability.
//!
//! The producer and monitoring consumer only ever speak to the broker through
//! the `BrokerTransport` trait, selected at composition time. The production
//! implementation drives the blocking pure-protocol `kafka` client through
//! `spawn_blocking`; tests substitute an in-memory implementation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use kafka::client::KafkaClient;
use kafka::consumer::{Consumer, FetchOffset, GroupOffsetStorage};
use kafka::producer::{Producer, Record, RequiredAcks};
use serde_json::Value;

use crate::broker::BrokerConfig;
use crate::error::AppError;

/// One record bound for the training topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerRecord {
    /// The partitioning key, when the sample carries a scalar `user_id`.
    pub key: Option<String>,
    /// The JSON-serialized sample.
    pub payload: Vec<u8>,
}

/// The per-record result of a publish attempt.
#[derive(Clone, Debug, serde::Serialize)]
pub struct RecordAck {
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordAck {
    pub fn ok() -> Self {
        Self { succeeded: true, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error: Some(error.into()),
        }
    }
}

/// A raw message observed by the monitoring consumer.
#[derive(Clone, Debug, serde::Serialize)]
pub struct PreviewMessage {
    pub partition: i32,
    pub offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub value: Value,
}

/// The broker capability consumed by the producer and monitoring consumer.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Publish the given records to the config's topic, one ack per record.
    ///
    /// Records are attempted independently. A connection-level failure fails
    /// this call (nothing sent) or, once sending has begun, fails all
    /// remaining unsent records without retrying.
    async fn publish(&self, config: &BrokerConfig, records: Vec<BrokerRecord>) -> Result<Vec<RecordAck>>;

    /// The latest observed (not committed) offset per partition of the topic.
    async fn fetch_offsets(&self, config: &BrokerConfig) -> Result<BTreeMap<i32, i64>>;

    /// Fetch up to `max_messages` from the topic on behalf of `group`,
    /// without committing offsets.
    async fn fetch_preview(&self, config: &BrokerConfig, group: &str, max_messages: usize, timeout: Duration) -> Result<Vec<PreviewMessage>>;
}

/// Producer connection state, rebuilt when the target servers change and
/// invalidated on connection errors.
struct ProducerCache {
    servers: String,
    producer: Option<Producer>,
}

/// `BrokerTransport` implementation over the pure-protocol `kafka` client.
pub struct KafkaTransport {
    cache: Arc<Mutex<ProducerCache>>,
}

impl Default for KafkaTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl KafkaTransport {
    pub fn new() -> Self {
        Self {
            cache: Arc::new(Mutex::new(ProducerCache {
                servers: String::new(),
                producer: None,
            })),
        }
    }

    fn lock_cache(cache: &Mutex<ProducerCache>) -> MutexGuard<'_, ProducerCache> {
        match cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn build_producer(hosts: Vec<String>) -> Result<Producer> {
        Producer::from_hosts(hosts)
            .with_ack_timeout(Duration::from_secs(1))
            .with_required_acks(RequiredAcks::One)
            .create()
            .map_err(|err| anyhow!(AppError::BrokerUnavailable(err.to_string())))
    }

    /// Run a blocking broker call on the blocking pool.
    async fn spawn_blocking<F, R>(f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await.context("error joining blocking broker task")?
    }
}

#[async_trait]
impl BrokerTransport for KafkaTransport {
    async fn publish(&self, config: &BrokerConfig, records: Vec<BrokerRecord>) -> Result<Vec<RecordAck>> {
        let cache = self.cache.clone();
        let (servers, hosts, topic) = (config.servers.clone(), config.hosts(), config.topic.clone());
        Self::spawn_blocking(move || {
            let mut cache = Self::lock_cache(&cache);
            if cache.producer.is_none() || cache.servers != servers {
                cache.producer = Some(Self::build_producer(hosts)?);
                cache.servers = servers;
            }
            let producer = match cache.producer.as_mut() {
                Some(producer) => producer,
                None => return Err(anyhow!(AppError::BrokerUnavailable("producer unavailable".into()))),
            };

            let mut acks = Vec::with_capacity(records.len());
            let mut broken: Option<String> = None;
            for record in &records {
                if let Some(reason) = &broken {
                    acks.push(RecordAck::failed(reason.clone()));
                    continue;
                }
                let res = match &record.key {
                    Some(key) => producer.send(&Record::from_key_value(&topic, key.as_bytes(), record.payload.as_slice())),
                    None => producer.send(&Record::from_value(&topic, record.payload.as_slice())),
                };
                match res {
                    Ok(()) => acks.push(RecordAck::ok()),
                    Err(err) => {
                        // Treat any producer error as connection-level: fail
                        // the remainder and force a reconnect on next publish.
                        let reason = err.to_string();
                        acks.push(RecordAck::failed(reason.clone()));
                        broken = Some(reason);
                    }
                }
            }
            if broken.is_some() {
                cache.producer = None;
            }
            Ok(acks)
        })
        .await
    }

    async fn fetch_offsets(&self, config: &BrokerConfig) -> Result<BTreeMap<i32, i64>> {
        let (hosts, topic) = (config.hosts(), config.topic.clone());
        Self::spawn_blocking(move || {
            let mut client = KafkaClient::new(hosts);
            client
                .load_metadata_all()
                .map_err(|err| anyhow!(AppError::BrokerUnavailable(err.to_string())))?;
            let offsets = client
                .fetch_offsets(&[topic.as_str()], FetchOffset::Latest)
                .map_err(|err| anyhow!(AppError::BrokerUnavailable(err.to_string())))?;
            let mut out = BTreeMap::new();
            for po in offsets.get(topic.as_str()).map(Vec::as_slice).unwrap_or_default() {
                out.insert(po.partition, po.offset);
            }
            Ok(out)
        })
        .await
    }

    async fn fetch_preview(&self, config: &BrokerConfig, group: &str, max_messages: usize, timeout: Duration) -> Result<Vec<PreviewMessage>> {
        let (hosts, topic, group) = (config.hosts(), config.topic.clone(), group.to_string());
        Self::spawn_blocking(move || {
            let mut consumer = Consumer::from_hosts(hosts)
                .with_topic(topic)
                .with_group(group)
                .with_fallback_offset(FetchOffset::Earliest)
                .with_offset_storage(Some(GroupOffsetStorage::Kafka))
                .create()
                .map_err(|err| anyhow!(AppError::BrokerUnavailable(err.to_string())))?;

            let deadline = Instant::now() + timeout;
            let mut messages = Vec::new();
            'outer: while Instant::now() < deadline {
                let sets = consumer.poll().map_err(|err| anyhow!(AppError::BrokerUnavailable(err.to_string())))?;
                for set in sets.iter() {
                    for message in set.messages() {
                        messages.push(PreviewMessage {
                            partition: set.partition(),
                            offset: message.offset,
                            key: if message.key.is_empty() {
                                None
                            } else {
                                Some(String::from_utf8_lossy(message.key).into_owned())
                            },
                            value: decode_payload(message.value),
                        });
                        if messages.len() >= max_messages {
                            break 'outer;
                        }
                    }
                }
                // No commit on any path: the monitor group's offsets stay
                // wherever the broker last saw them, and the training group
                // is never referenced at all.
            }
            Ok(messages)
        })
        .await
    }
}

/// Decode a message payload as JSON, falling back to a raw string.
fn decode_payload(raw: &[u8]) -> Value {
    serde_json::from_slice(raw).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()))
}
