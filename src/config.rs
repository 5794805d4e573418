//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port which the HTTP API is to use.
    pub http_port: u16,

    /// The training executable launched for incremental training sessions.
    pub trainer_bin: String,
    /// The pipeline config file handed to the training executable.
    pub pipeline_config_path: String,
    /// The directory holding the online model state for the active session.
    pub model_dir: String,
    /// An optional offline checkpoint the training process fine-tunes from.
    #[serde(default)]
    pub base_checkpoint: Option<String>,

    /// Default broker bootstrap servers used when `start` omits a config.
    #[serde(default = "Config::default_kafka_servers")]
    pub kafka_servers: String,
    /// Default broker topic used when `start` omits a config.
    #[serde(default = "Config::default_kafka_topic")]
    pub kafka_topic: String,
    /// Default consumer group used when `start` omits a config.
    #[serde(default = "Config::default_kafka_group")]
    pub kafka_group: String,

    /// Milliseconds the child process must stay alive for `start` to succeed.
    #[serde(default = "Config::default_start_confirm_ms")]
    pub start_confirm_ms: u64,
    /// Seconds granted for graceful child shutdown before a hard kill.
    #[serde(default = "Config::default_stop_grace_seconds")]
    pub stop_grace_seconds: u64,
    /// Milliseconds between supervisor checks of the child process.
    #[serde(default = "Config::default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    /// Seconds allowed for a single publish batch before it is failed.
    #[serde(default = "Config::default_publish_timeout_seconds")]
    pub publish_timeout_seconds: u64,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    pub fn start_confirm_window(&self) -> Duration {
        Duration::from_millis(self.start_confirm_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(10))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_seconds.max(1))
    }

    fn default_kafka_servers() -> String {
        "localhost:9092".into()
    }

    fn default_kafka_topic() -> String {
        "easyrec_training".into()
    }

    fn default_kafka_group() -> String {
        "easyrec_online".into()
    }

    fn default_start_confirm_ms() -> u64 {
        500
    }

    fn default_stop_grace_seconds() -> u64 {
        60
    }

    fn default_watchdog_interval_ms() -> u64 {
        1_000
    }

    fn default_publish_timeout_seconds() -> u64 {
        5
    }
}

#[cfg(test)]
impl Config {
    /// Create a config instance for testing, scoped to a temp dir.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        Self::new_test_with(&[])
    }

    /// Create a test config with specific env entries overridden.
    pub fn new_test_with(overrides: &[(&str, &str)]) -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating temp dir for test config")?;
        let model_dir = tmpdir.path().join("model").display().to_string();
        let mut env = vec![
            ("RUST_LOG".to_string(), "error".to_string()),
            ("HTTP_PORT".into(), "7400".into()),
            ("TRAINER_BIN".into(), "/bin/false".into()),
            ("PIPELINE_CONFIG_PATH".into(), tmpdir.path().join("pipeline.config").display().to_string()),
            ("MODEL_DIR".into(), model_dir),
            ("START_CONFIRM_MS".into(), "300".into()),
            ("STOP_GRACE_SECONDS".into(), "1".into()),
            ("WATCHDOG_INTERVAL_MS".into(), "100".into()),
            ("PUBLISH_TIMEOUT_SECONDS".into(), "2".into()),
        ];
        for (key, val) in overrides {
            match env.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = val.to_string(),
                None => env.push((key.to_string(), val.to_string())),
            }
        }
        let config: Config = envy::from_iter(env).context("error building test config")?;
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
