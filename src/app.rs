use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::broker::monitor::MonitoringConsumer;
use crate::broker::producer::SampleProducer;
use crate::broker::transport::KafkaTransport;
use crate::broker::ConfigLock;
use crate::config::Config;
use crate::gateway::IngestionGateway;
use crate::server::{ApiState, AppServer};
use crate::supervisor::SupervisorCtl;

/// The application object for when the control plane is running as a server.
pub struct App {
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the training supervisor.
    supervisor_handle: JoinHandle<Result<()>>,
    /// The join handle of the HTTP server.
    http_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(100);

        let lock = Arc::new(ConfigLock::new());
        let transport = Arc::new(KafkaTransport::new());

        let (supervisor_ctl, supervisor) = SupervisorCtl::new(config.clone(), lock.clone(), shutdown_tx.clone());
        let supervisor_handle = supervisor_ctl.spawn();

        let producer = SampleProducer::new(config.clone(), lock.clone(), transport.clone());
        let gateway = Arc::new(IngestionGateway::new(lock.clone(), producer));
        let monitor = Arc::new(MonitoringConsumer::new(lock.clone(), transport, supervisor.status_rx()));

        let state = ApiState {
            config: config.clone(),
            lock,
            supervisor,
            gateway,
            monitor,
        };
        let http_server = AppServer::new(config, state, shutdown_tx.clone())
            .spawn()
            .await
            .context("error setting up HTTP server")?;

        Ok(Self {
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            supervisor_handle,
            http_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("control plane is shutting down");
        if let Err(err) = self.supervisor_handle.await.context("error joining supervisor handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down training supervisor");
        }
        if let Err(err) = self.http_server.await.context("error joining HTTP server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down HTTP server");
        }

        tracing::debug!("control plane shutdown complete");
        Ok(())
    }
}
