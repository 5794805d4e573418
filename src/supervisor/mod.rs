//! The training supervisor.
//!
//! A single actor owns the trainer child process end to end: it launches the
//! process, tails its output streams, polls for exit on a watchdog interval,
//! and applies the restart policy when the process dies without being asked
//! to. All mutation flows through the actor's request channel; status reads
//! go through a watch channel and never wait on the actor.

mod logs;
pub mod policy;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::broker::{BrokerConfig, ConfigLock};
use crate::config::Config;
use crate::error::AppError;

pub use logs::{LogBuffers, LogStream, LogTail};
pub use policy::{PolicyPatch, RestartPolicy};

/// Name of the file whose presence asks the trainer to stop gracefully.
pub const STOP_SIGNAL_FILE: &str = "OSS_STOP_SIGNAL";

/// Interval between child liveness probes inside the start confirmation window.
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Interval between child liveness probes while waiting out a graceful stop.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Checkpoint save cadence handed to the trainer on its command line.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct UpdateConfig {
    #[serde(default = "UpdateConfig::default_steps")]
    pub dense_save_steps: u32,
    #[serde(default = "UpdateConfig::default_steps")]
    pub sparse_save_steps: u32,
}

impl UpdateConfig {
    fn default_steps() -> u32 {
        100
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            dense_save_steps: Self::default_steps(),
            sparse_save_steps: Self::default_steps(),
        }
    }
}

/// Everything needed to launch a training session.
#[derive(Clone, Debug, Deserialize)]
pub struct StartRequest {
    pub kafka_config: BrokerConfig,
    #[serde(default)]
    pub update_config: UpdateConfig,
    #[serde(default)]
    pub policy: Option<PolicyPatch>,
}

/// Lifecycle state of the supervised trainer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingState {
    Idle,
    Starting,
    Running,
    Stopping,
    Crashed,
}

/// Externally visible view of the current session, if any.
#[derive(Clone, Debug, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub pid: Option<u32>,
    pub started_at: i64,
    pub restart_count: u32,
    pub last_exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash_reason: Option<String>,
    pub restart_pending: bool,
    pub kafka_config: BrokerConfig,
    pub monitor_group: String,
}

/// Point-in-time supervisor status published over the watch channel.
#[derive(Clone, Debug, Serialize)]
pub struct TrainingStatus {
    pub state: TrainingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionView>,
    pub policy: RestartPolicy,
}

impl TrainingStatus {
    fn idle(policy: RestartPolicy) -> Self {
        Self {
            state: TrainingState::Idle,
            session: None,
            policy,
        }
    }
}

/// A live (or recently dead) trainer child and its bookkeeping.
struct Session {
    id: Uuid,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: i64,
    restart_count: u32,
    last_exit_code: Option<i32>,
    crash_reason: Option<String>,
    request: StartRequest,
    readers: Vec<JoinHandle<()>>,
}

impl Session {
    fn view(&self, restart_pending: bool) -> SessionView {
        SessionView {
            id: self.id,
            pid: self.pid,
            started_at: self.started_at,
            restart_count: self.restart_count,
            last_exit_code: self.last_exit_code,
            crash_reason: self.crash_reason.clone(),
            restart_pending,
            kafka_config: self.request.kafka_config.clone(),
            monitor_group: self.request.kafka_config.monitor_group(),
        }
    }

    fn abort_readers(&mut self) {
        for handle in self.readers.drain(..) {
            handle.abort();
        }
    }
}

/// A crash-triggered relaunch scheduled for a future watchdog tick.
struct PendingRestart {
    due: Instant,
}

/// A request bound for the supervisor actor.
pub enum SupervisorCtlMsg {
    Start {
        request: StartRequest,
        tx: oneshot::Sender<Result<TrainingStatus>>,
    },
    Stop {
        tx: oneshot::Sender<Result<TrainingStatus>>,
    },
    UpdatePolicy {
        patch: PolicyPatch,
        tx: oneshot::Sender<RestartPolicy>,
    },
}

/// A cheap clonable handle for talking to the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorCtlMsg>,
    status_rx: watch::Receiver<TrainingStatus>,
    logs: LogBuffers,
}

impl SupervisorHandle {
    pub async fn start(&self, request: StartRequest) -> Result<TrainingStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCtlMsg::Start { request, tx })
            .await
            .map_err(|_err| anyhow!("error communicating with training supervisor"))?;
        rx.await
            .map_err(|_err| anyhow!("error communicating with training supervisor"))?
    }

    pub async fn stop(&self) -> Result<TrainingStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCtlMsg::Stop { tx })
            .await
            .map_err(|_err| anyhow!("error communicating with training supervisor"))?;
        rx.await
            .map_err(|_err| anyhow!("error communicating with training supervisor"))?
    }

    pub async fn update_policy(&self, patch: PolicyPatch) -> Result<RestartPolicy> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCtlMsg::UpdatePolicy { patch, tx })
            .await
            .map_err(|_err| anyhow!("error communicating with training supervisor"))?;
        rx.await
            .map_err(|_err| anyhow!("error communicating with training supervisor"))
    }

    /// Current status without touching the actor.
    pub fn status(&self) -> TrainingStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch channel for callers that correlate status with other sources.
    pub fn status_rx(&self) -> watch::Receiver<TrainingStatus> {
        self.status_rx.clone()
    }

    pub fn tail_logs(&self, lines: usize, stream: LogStream) -> LogTail {
        self.logs.tail(lines, stream)
    }
}

/// The training supervisor controller.
pub struct SupervisorCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The shared broker config lock.
    lock: Arc<ConfigLock>,
    /// A stream of requests to this controller.
    requests: ReceiverStream<SupervisorCtlMsg>,
    /// A signal of application shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// Publication side of the status watch channel.
    status_tx: watch::Sender<TrainingStatus>,
    /// Shared child output ring buffers.
    logs: LogBuffers,

    state: TrainingState,
    session: Option<Session>,
    policy: RestartPolicy,
    pending_restart: Option<PendingRestart>,
    descheduled: bool,
}

impl SupervisorCtl {
    pub fn new(
        config: Arc<Config>,
        lock: Arc<ConfigLock>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, SupervisorHandle) {
        let (tx, rx) = mpsc::channel(100);
        let policy = RestartPolicy::default();
        let (status_tx, status_rx) = watch::channel(TrainingStatus::idle(policy));
        let logs = LogBuffers::new();
        let ctl = Self {
            config,
            lock,
            requests: ReceiverStream::new(rx),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            status_tx,
            logs: logs.clone(),
            state: TrainingState::Idle,
            session: None,
            policy,
            pending_restart: None,
            descheduled: false,
        };
        let handle = SupervisorHandle { tx, status_rx, logs };
        (ctl, handle)
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("training supervisor started");

        let mut watchdog = tokio::time::interval(self.config.watchdog_interval());
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.descheduled {
                break;
            }
            tokio::select! {
                msg_opt = self.requests.next() => self.handle_msg(msg_opt).await,
                _ = watchdog.tick() => self.poll_child().await,
                shutdown = self.shutdown_rx.next() => if shutdown.is_some() {
                    self.descheduled = true;
                },
            }
        }

        self.shutdown_cleanup().await;
        tracing::debug!("training supervisor shutdown");
        Ok(())
    }

    async fn handle_msg(&mut self, msg_opt: Option<SupervisorCtlMsg>) {
        let msg = match msg_opt {
            Some(msg) => msg,
            None => {
                self.descheduled = true;
                return;
            }
        };
        match msg {
            SupervisorCtlMsg::Start { request, tx } => {
                let res = self.handle_start(request).await;
                let _ = tx.send(res);
            }
            SupervisorCtlMsg::Stop { tx } => {
                let res = self.handle_stop().await;
                let _ = tx.send(res);
            }
            SupervisorCtlMsg::UpdatePolicy { patch, tx } => {
                self.policy.apply(patch);
                self.publish_status();
                let _ = tx.send(self.policy);
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Start //////////////////////////////////////////////////////////////////

    async fn handle_start(&mut self, request: StartRequest) -> Result<TrainingStatus> {
        match self.state {
            TrainingState::Idle | TrainingState::Crashed => (),
            _ => return Err(AppError::AlreadyRunning.into()),
        }
        request.kafka_config.validate()?;

        if let Some(patch) = request.policy {
            self.policy.apply(patch);
        }

        // Claim the broker config lock up front so a conflicting config is
        // rejected before any process is spawned.
        let prev_lock = self.lock.try_lock(&request.kafka_config)?;
        let prior_state = self.state;
        let prior_session = self.session.take();
        self.pending_restart = None;

        self.state = TrainingState::Starting;
        self.logs.clear();
        let launch = self.launch_session(request, 0).await;
        match launch {
            Ok(session) => {
                self.session = Some(session);
                self.state = TrainingState::Running;
                self.publish_status();
                Ok(self.current_status())
            }
            Err(err) => {
                // Put the world back the way we found it.
                self.lock.restore(prev_lock);
                self.state = prior_state;
                self.session = prior_session;
                self.publish_status();
                Err(err)
            }
        }
    }

    /// Spawn the trainer child and confirm it survives the startup window.
    async fn launch_session(&mut self, request: StartRequest, restart_count: u32) -> Result<Session> {
        let mut child = self.spawn_trainer(&request).await?;
        let pid = child.id();
        let readers = self.spawn_stream_readers(&mut child);

        // The trainer dies within milliseconds on malformed config or an
        // unreachable broker; catch that here instead of reporting a healthy
        // start.
        let deadline = Instant::now() + self.config.start_confirm_window();
        loop {
            if let Some(status) = child.try_wait().context("error polling trainer process")? {
                for handle in &readers {
                    handle.abort();
                }
                return Err(anyhow!(
                    "training process exited during startup with {}",
                    describe_exit(&status)
                ));
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
        }

        tracing::info!(pid, restart_count, "training process confirmed running");
        Ok(Session {
            id: Uuid::new_v4(),
            child: Some(child),
            pid,
            started_at: unix_now(),
            restart_count,
            last_exit_code: None,
            crash_reason: None,
            request,
            readers,
        })
    }

    async fn spawn_trainer(&self, request: &StartRequest) -> Result<Child> {
        let model_dir = &self.config.model_dir;
        tokio::fs::create_dir_all(model_dir)
            .await
            .context("error creating model dir")?;
        // A stop file left over from a previous run would kill the trainer
        // immediately.
        let stop_file = self.stop_signal_path();
        if tokio::fs::try_exists(&stop_file).await.unwrap_or(false) {
            tokio::fs::remove_file(&stop_file)
                .await
                .context("error removing stale stop signal file")?;
        }

        let update = &request.update_config;
        let mut cmd = Command::new(&self.config.trainer_bin);
        cmd.arg("--pipeline-config-path")
            .arg(&self.config.pipeline_config_path)
            .arg("--model-dir")
            .arg(model_dir)
            .arg("--continue-train")
            .arg("--dense-save-steps")
            .arg(update.dense_save_steps.to_string())
            .arg("--sparse-save-steps")
            .arg(update.sparse_save_steps.to_string());
        if let Some(base) = self.config.base_checkpoint.as_ref() {
            cmd.arg("--fine-tune-checkpoint").arg(base);
        }
        let broker = &request.kafka_config;
        cmd.env("KAFKA_SERVERS", &broker.servers)
            .env("KAFKA_TOPIC", &broker.topic)
            .env("KAFKA_GROUP", &broker.group);
        if let Some(offset_time) = broker.offset_time.as_ref() {
            cmd.env("KAFKA_OFFSET_TIME", offset_time);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn().context("error spawning training process")
    }

    /// Spawn reader tasks which drain the child's pipes into the ring buffers.
    fn spawn_stream_readers(&self, child: &mut Child) -> Vec<JoinHandle<()>> {
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let logs = self.logs.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "trainer::stdout", "{}", line);
                    logs.push(LogStream::Stdout, line);
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = self.logs.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "trainer::stderr", "{}", line);
                    logs.push(LogStream::Stderr, line);
                }
            }));
        }
        readers
    }

    ///////////////////////////////////////////////////////////////////////////
    // Stop ///////////////////////////////////////////////////////////////////

    async fn handle_stop(&mut self) -> Result<TrainingStatus> {
        match self.state {
            TrainingState::Idle => return Ok(self.current_status()),
            TrainingState::Crashed => {
                // A stop from Crashed just acknowledges the crash and clears
                // the session and lock.
                if let Some(mut session) = self.session.take() {
                    session.abort_readers();
                }
                self.lock.release();
                self.state = TrainingState::Idle;
                self.publish_status();
                return Ok(self.current_status());
            }
            // Both transitions run to completion inside the actor, so these
            // are unreachable through the handle; answer them honestly anyway.
            TrainingState::Starting | TrainingState::Stopping => {
                return Err(AppError::NotRunning.into())
            }
            TrainingState::Running => (),
        }

        self.pending_restart = None;
        self.state = TrainingState::Stopping;
        self.publish_status();
        let res = self.stop_child().await;
        let mut session = self.session.take();
        if let Some(session) = session.as_mut() {
            session.abort_readers();
        }
        self.lock.release();
        self.state = TrainingState::Idle;
        self.publish_status();
        res?;
        Ok(self.current_status())
    }

    /// Ask the child to exit via the stop signal file, escalating to SIGKILL
    /// after the grace period.
    async fn stop_child(&mut self) -> Result<()> {
        let stop_file = self.stop_signal_path();
        let child = match self.session.as_mut().and_then(|session| session.child.as_mut()) {
            Some(child) => child,
            None => return Ok(()),
        };
        tokio::fs::write(&stop_file, b"")
            .await
            .context("error writing stop signal file")?;

        let deadline = Instant::now() + self.config.stop_grace();
        let mut exited = false;
        while Instant::now() < deadline {
            if child.try_wait().context("error polling trainer process")?.is_some() {
                exited = true;
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        if !exited {
            tracing::warn!("training process did not honor stop signal, killing");
            child.kill().await.context("error killing trainer process")?;
        }

        if let Err(err) = tokio::fs::remove_file(&stop_file).await {
            tracing::debug!(error = ?err, "error removing stop signal file");
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////
    // Watchdog ///////////////////////////////////////////////////////////////

    /// Watchdog tick: detect unexpected exits and fire due restarts.
    async fn poll_child(&mut self) {
        if let Some(pending) = self.pending_restart.as_ref() {
            if Instant::now() >= pending.due {
                self.pending_restart = None;
                self.relaunch().await;
            }
            return;
        }
        if self.state != TrainingState::Running {
            return;
        }
        let exit = match self.session.as_mut().and_then(|session| session.child.as_mut()) {
            Some(child) => match child.try_wait() {
                Ok(exit) => exit,
                Err(err) => {
                    tracing::error!(error = ?err, "error polling trainer process");
                    return;
                }
            },
            None => None,
        };
        if let Some(status) = exit {
            self.handle_unexpected_exit(status);
        }
    }

    /// The child died without a stop request. Apply the restart policy.
    fn handle_unexpected_exit(&mut self, status: std::process::ExitStatus) {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };
        session.child = None;
        session.abort_readers();
        session.last_exit_code = status.code();
        tracing::warn!(
            session = %session.id,
            restart_count = session.restart_count,
            "training process exited unexpectedly with {}", describe_exit(&status),
        );

        let decision = self.policy.decide(status.code(), session.restart_count);
        if decision.restart {
            self.pending_restart = Some(PendingRestart {
                due: Instant::now() + decision.delay,
            });
        } else {
            session.crash_reason = Some(format!(
                "restart budget exhausted after {} restarts, last exit: {}",
                session.restart_count,
                describe_exit(&status),
            ));
            self.state = TrainingState::Crashed;
        }
        self.publish_status();
    }

    /// Fire a scheduled restart of the current session.
    async fn relaunch(&mut self) {
        let (request, restarts) = match self.session.as_ref() {
            Some(session) => (session.request.clone(), session.restart_count),
            None => return,
        };
        let last_exit = self.session.as_ref().and_then(|session| session.last_exit_code);
        self.state = TrainingState::Starting;
        self.publish_status();
        match self.launch_session(request, restarts + 1).await {
            Ok(mut session) => {
                session.last_exit_code = last_exit;
                self.session = Some(session);
                self.state = TrainingState::Running;
            }
            Err(err) => {
                tracing::error!(error = ?err, "error restarting training process");
                if let Some(session) = self.session.as_mut() {
                    // The relaunch itself consumed a slot from the budget.
                    session.restart_count = restarts + 1;
                    let decision = self.policy.decide(last_exit, session.restart_count);
                    if decision.restart {
                        self.pending_restart = Some(PendingRestart {
                            due: Instant::now() + decision.delay,
                        });
                        self.state = TrainingState::Running;
                    } else {
                        session.crash_reason = Some(format!("restart failed: {}", err));
                        self.state = TrainingState::Crashed;
                    }
                }
            }
        }
        self.publish_status();
    }

    ///////////////////////////////////////////////////////////////////////////
    // Shutdown & status //////////////////////////////////////////////////////

    async fn shutdown_cleanup(&mut self) {
        if matches!(self.state, TrainingState::Running | TrainingState::Starting) {
            if let Err(err) = self.stop_child().await {
                tracing::error!(error = ?err, "error stopping trainer during shutdown");
            }
        }
        if let Some(mut session) = self.session.take() {
            session.abort_readers();
        }
        self.lock.release();
        self.state = TrainingState::Idle;
        self.publish_status();
    }

    fn stop_signal_path(&self) -> PathBuf {
        Path::new(&self.config.model_dir).join(STOP_SIGNAL_FILE)
    }

    fn current_status(&self) -> TrainingStatus {
        TrainingStatus {
            state: self.state,
            session: self
                .session
                .as_ref()
                .map(|session| session.view(self.pending_restart.is_some())),
            policy: self.policy,
        }
    }

    fn publish_status(&self) {
        let _ = self.status_tx.send(self.current_status());
    }
}

/// Human-readable exit description, covering signal deaths.
fn describe_exit(status: &std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("code {}", code),
        None => {
            use std::os::unix::process::ExitStatusExt;
            match status.signal() {
                Some(sig) => format!("signal {}", sig),
                None => "unknown status".into(),
            }
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
