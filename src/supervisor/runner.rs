//! Supervisor runner for orchestrating the engine session.
//!
//! This module provides the orchestration layer that connects the build
//! step, process handle, line decoder, classifier, and correlator. All
//! supervisor state (status snapshot, state machine, pending requests) is
//! mutated by a single loop task; callers interact through a cloneable
//! [`SupervisorHandle`] over channels, so command submission never races
//! with status-event application.

use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::engine::{
    BuildCommand, BuildError, EngineProcess, EngineProcessBuilder, LineDecoder, SpawnError,
    StatusClassifier, StatusEvent, WriteError,
};
use crate::supervisor::{
    CommandError, Correlator, EngineStatus, Reply, StateMachine, SupervisorState,
};

/// Buffer size for the decoded stdout line channel.
pub const LINE_CHANNEL_BUFFER: usize = 64;

/// Buffer size for the caller-facing command channel.
pub const OP_CHANNEL_BUFFER: usize = 32;

/// Reply action that confirms a transformer deployment.
const TRANSFORMER_DEPLOYED_ACTION: &str = "transformer_deployed";

/// Error type for session-fatal supervisor failures.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// The engine build step exited non-zero.
    #[error("Engine build failed: {0}")]
    BuildFailed(#[from] BuildError),
    /// The engine process could not be spawned.
    #[error("Failed to spawn engine: {0}")]
    Spawn(#[from] SpawnError),
    /// The engine did not report readiness within the deadline.
    #[error("Engine not ready within {timeout:?}")]
    InitTimeout {
        /// The configured initialization deadline.
        timeout: Duration,
    },
    /// The engine exited before reporting readiness.
    #[error("Engine exited before readiness (code {code:?})")]
    ExitedBeforeReady {
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
    },
    /// Process stdout was not available.
    #[error("Engine stdout not available")]
    NoStdout,
    /// I/O failure controlling the process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a supervised session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorResult {
    /// Shutdown was requested and the engine was terminated.
    Shutdown,
    /// The engine exited unsolicited; the session drained in `Degraded`
    /// until shutdown was requested.
    EngineCrashed {
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
    },
}

impl From<WriteError> for CommandError {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::ClosedPipe => Self::ClosedPipe,
            WriteError::Io(e) => Self::WriteFailed(e.to_string()),
        }
    }
}

/// Caller-facing operations routed to the supervisor loop.
enum Op {
    Command {
        action: String,
        payload: serde_json::Value,
        timeout: Duration,
        reply_tx: oneshot::Sender<Result<Reply, CommandError>>,
    },
}

/// Build one outbound command frame.
///
/// The wire format is a single JSON object per line: the action, the
/// payload's fields flattened in, and the correlation token in the
/// `timestamp` field the engine echoes back.
fn command_frame(action: &str, payload: &serde_json::Value, token: u64) -> String {
    let mut obj = serde_json::Map::new();
    obj.insert("action".to_string(), action.into());
    if let Some(fields) = payload.as_object() {
        for (key, value) in fields {
            obj.insert(key.clone(), value.clone());
        }
    }
    obj.insert("timestamp".to_string(), token.into());
    serde_json::Value::Object(obj).to_string()
}

/// Handle for interacting with a running supervisor.
///
/// Cheap to clone; every clone talks to the same supervisor loop.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    op_tx: mpsc::Sender<Op>,
    status_rx: watch::Receiver<EngineStatus>,
    state_rx: watch::Receiver<SupervisorState>,
    cancel: CancellationToken,
    default_timeout: Duration,
}

impl SupervisorHandle {
    /// Send a raw command to the engine and await its correlated reply.
    ///
    /// # Errors
    ///
    /// Returns `CommandError` for this command only; other in-flight
    /// commands are unaffected.
    pub async fn send_command(
        &self,
        action: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<Reply, CommandError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.op_tx
            .send(Op::Command {
                action: action.to_string(),
                payload,
                timeout,
                reply_tx,
            })
            .await
            .map_err(|_| CommandError::ShuttingDown)?;

        reply_rx.await.map_err(|_| CommandError::ShuttingDown)?
    }

    /// Execute a trading strategy with the given capital amount.
    ///
    /// # Errors
    ///
    /// Returns `CommandError` if the command fails or times out.
    pub async fn execute_strategy(
        &self,
        strategy: &str,
        amount: f64,
    ) -> Result<Reply, CommandError> {
        self.send_command(
            "execute_strategy",
            serde_json::json!({ "strategy": strategy, "amount": amount }),
            self.default_timeout,
        )
        .await
    }

    /// Deploy a transformer model inside the engine.
    ///
    /// # Errors
    ///
    /// Returns `CommandError` if the command fails or times out.
    pub async fn deploy_transformer(&self, transformer_id: &str) -> Result<Reply, CommandError> {
        self.send_command(
            "deploy_transformer",
            serde_json::json!({ "transformer_id": transformer_id }),
            self.default_timeout,
        )
        .await
    }

    /// Activate a trading agent.
    ///
    /// # Errors
    ///
    /// Returns `CommandError` if the command fails or times out.
    pub async fn activate_agent(&self, agent_id: &str) -> Result<Reply, CommandError> {
        self.send_command(
            "activate_agent",
            serde_json::json!({ "agent_id": agent_id }),
            self.default_timeout,
        )
        .await
    }

    /// Push an updated wallet configuration to the engine.
    ///
    /// # Errors
    ///
    /// Returns `CommandError` if the command fails or times out.
    pub async fn update_wallets(
        &self,
        wallets: serde_json::Value,
    ) -> Result<Reply, CommandError> {
        self.send_command(
            "update_wallets",
            serde_json::json!({ "wallets": wallets }),
            self.default_timeout,
        )
        .await
    }

    /// Get an immutable snapshot copy of the engine status.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        *self.status_rx.borrow()
    }

    /// Subscribe to status snapshot updates.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status_rx.clone()
    }

    /// Get the supervisor's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// Request shutdown.
    ///
    /// Idempotent: repeated calls are no-ops observing the same completion.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until the supervisor reaches `Terminated`.
    pub async fn terminated(&self) {
        let mut state_rx = self.state_rx.clone();
        loop {
            if state_rx.borrow().is_terminal() {
                return;
            }
            // A closed sender means the loop is gone, which is terminal too.
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Supervisor for one engine session.
///
/// Construct with [`Supervisor::new`], keep the handle, and drive
/// [`Supervisor::run`] to completion (typically on a spawned task).
pub struct Supervisor {
    config: SupervisorConfig,
    op_rx: mpsc::Receiver<Op>,
    status: EngineStatus,
    status_tx: watch::Sender<EngineStatus>,
    state_tx: watch::Sender<SupervisorState>,
    state: StateMachine,
    correlator: Correlator,
    classifier: StatusClassifier,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor and its caller-facing handle.
    #[must_use]
    pub fn new(config: SupervisorConfig) -> (Self, SupervisorHandle) {
        let (op_tx, op_rx) = mpsc::channel(OP_CHANNEL_BUFFER);
        let (status_tx, status_rx) = watch::channel(EngineStatus::default());
        let (state_tx, state_rx) = watch::channel(SupervisorState::Idle);
        let cancel = CancellationToken::new();

        let handle = SupervisorHandle {
            op_tx,
            status_rx,
            state_rx,
            cancel: cancel.clone(),
            default_timeout: config.timeouts.command(),
        };

        let supervisor = Self {
            config,
            op_rx,
            status: EngineStatus::default(),
            status_tx,
            state_tx,
            state: StateMachine::new(),
            correlator: Correlator::new(),
            classifier: StatusClassifier::new(),
            cancel,
        };

        (supervisor, handle)
    }

    /// Run the session to completion: build, launch, supervise, terminate.
    ///
    /// Always ends in `Terminated`, including on error.
    ///
    /// # Errors
    ///
    /// Returns a session-fatal `SupervisorError` for build failures, spawn
    /// failures, or a missed initialization deadline. Per-command failures
    /// are reported through the command futures, never here.
    pub async fn run(mut self) -> Result<SupervisorResult, SupervisorError> {
        let outcome = self.run_session().await;
        self.transition(SupervisorState::Terminated);
        self.status.mark_exited();
        self.publish_status();
        match &outcome {
            Ok(result) => tracing::info!(?result, stats = ?self.state.stats(), "Session ended"),
            Err(error) => tracing::error!(%error, "Session failed"),
        }
        outcome
    }

    async fn run_session(&mut self) -> Result<SupervisorResult, SupervisorError> {
        let cancel = self.cancel.clone();

        // Building.
        if self.config.build.enabled {
            self.transition(SupervisorState::Building);
            let build = BuildCommand::new(
                self.config.build.program.clone(),
                self.config.build.args.clone(),
            );
            let build = match self.config.build.working_dir.clone() {
                Some(dir) => build.working_dir(dir),
                None => build,
            };
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Shutdown requested during build");
                    return Ok(SupervisorResult::Shutdown);
                }
                result = build.run() => {
                    result?;
                }
            }
        }

        // Launching.
        self.transition(SupervisorState::Launching);
        let mut builder = EngineProcessBuilder::new(self.config.engine.executable.clone())
            .args(self.config.engine.args.clone());
        for (key, value) in &self.config.engine.env {
            builder = builder.env(key, value);
        }
        if let Some(ref level) = self.config.engine.log_level {
            builder = builder.log_level(level);
        }
        if let Some(ref dir) = self.config.engine.working_dir {
            builder = builder.working_dir(dir);
        }

        let mut process = builder.spawn()?;
        let stdout = process.take_stdout().ok_or(SupervisorError::NoStdout)?;
        if let Some(stderr) = process.take_stderr() {
            spawn_stderr_logger(stderr);
        }

        let (line_tx, mut line_rx) = mpsc::channel(LINE_CHANNEL_BUFFER);
        let _reader = spawn_line_reader(stdout, self.config.decoder.max_line_len, line_tx);

        // Wait for readiness under the initialization deadline.
        match self.wait_for_ready(&mut process, &mut line_rx).await? {
            ReadyOutcome::Ready => {}
            ReadyOutcome::Cancelled => {
                self.shutdown_engine(&mut process).await;
                return Ok(SupervisorResult::Shutdown);
            }
        }

        // Ready.
        process.mark_running();
        self.transition(SupervisorState::Ready);
        self.status.running = true;
        self.publish_status();

        match self.supervise(&mut process, &mut line_rx).await {
            LoopEnd::Cancelled => {
                self.shutdown_engine(&mut process).await;
                Ok(SupervisorResult::Shutdown)
            }
            LoopEnd::Crashed { code } => {
                self.run_degraded(&mut line_rx).await;
                self.transition(SupervisorState::ShuttingDown);
                Ok(SupervisorResult::EngineCrashed { code })
            }
        }
    }

    /// Launching phase: wait for the readiness marker.
    async fn wait_for_ready(
        &mut self,
        process: &mut EngineProcess,
        line_rx: &mut mpsc::Receiver<String>,
    ) -> Result<ReadyOutcome, SupervisorError> {
        let timeout = self.config.timeouts.init();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::info!("Shutdown requested during launch");
                    return Ok(ReadyOutcome::Cancelled);
                }
                () = &mut deadline => {
                    tracing::error!(?timeout, "Engine readiness deadline missed");
                    self.shutdown_engine(process).await;
                    return Err(SupervisorError::InitTimeout { timeout });
                }
                exit = process.wait() => {
                    let code = exit.ok().and_then(|status| status.code());
                    return Err(SupervisorError::ExitedBeforeReady { code });
                }
                maybe_op = self.op_rx.recv() => {
                    match maybe_op {
                        Some(Op::Command { reply_tx, action, .. }) => {
                            tracing::warn!(%action, "Rejecting command, engine not ready");
                            let _ = reply_tx.send(Err(CommandError::NotReady));
                        }
                        // All handles dropped: nobody is left to drive the
                        // session, treat as a shutdown request.
                        None => return Ok(ReadyOutcome::Cancelled),
                    }
                }
                maybe_line = line_rx.recv() => {
                    match maybe_line {
                        Some(line) => {
                            let event = self.classifier.classify(&line);
                            let ready = matches!(event, StatusEvent::EngineReady);
                            self.apply_event(&event, &line);
                            if ready {
                                tracing::info!("Engine reported readiness");
                                return Ok(ReadyOutcome::Ready);
                            }
                        }
                        None => {
                            let code = process.wait().await.ok().and_then(|s| s.code());
                            return Err(SupervisorError::ExitedBeforeReady { code });
                        }
                    }
                }
            }
        }
    }

    /// Ready phase: the main supervision loop.
    async fn supervise(
        &mut self,
        process: &mut EngineProcess,
        line_rx: &mut mpsc::Receiver<String>,
    ) -> LoopEnd {
        let cancel = self.cancel.clone();
        let mut sweep = tokio::time::interval(self.config.timeouts.sweep());
        let mut stdout_open = true;

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::info!("Shutdown requested");
                    return LoopEnd::Cancelled;
                }
                exit = process.wait() => {
                    let code = exit.ok().and_then(|status| status.code());
                    tracing::warn!(?code, "Engine exited unsolicited");
                    self.enter_degraded(code);
                    return LoopEnd::Crashed { code };
                }
                maybe_line = line_rx.recv(), if stdout_open => {
                    match maybe_line {
                        Some(line) => {
                            let event = self.classifier.classify(&line);
                            self.apply_event(&event, &line);
                        }
                        // EOF on stdout; the exit arm will observe the
                        // process death itself.
                        None => stdout_open = false,
                    }
                }
                maybe_op = self.op_rx.recv() => {
                    match maybe_op {
                        Some(op) => self.handle_op(process, op).await,
                        None => return LoopEnd::Cancelled,
                    }
                }
                _ = sweep.tick() => {
                    let timed_out = self.correlator.sweep(Instant::now());
                    self.state.record_timeouts(timed_out);
                }
            }
        }
    }

    /// Degraded phase: drain residual output and fail commands fast until
    /// shutdown is requested.
    async fn run_degraded(&mut self, line_rx: &mut mpsc::Receiver<String>) {
        let cancel = self.cancel.clone();
        let mut stdout_open = true;

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => return,
                maybe_line = line_rx.recv(), if stdout_open => {
                    match maybe_line {
                        Some(line) => {
                            let event = self.classifier.classify(&line);
                            self.apply_event(&event, &line);
                        }
                        None => stdout_open = false,
                    }
                }
                maybe_op = self.op_rx.recv() => {
                    match maybe_op {
                        Some(Op::Command { reply_tx, action, .. }) => {
                            tracing::warn!(%action, "Rejecting command, engine has crashed");
                            let _ = reply_tx.send(Err(CommandError::WorkerCrashed));
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Register, frame, and transmit one command.
    async fn handle_op(&mut self, process: &mut EngineProcess, op: Op) {
        let Op::Command {
            action,
            payload,
            timeout,
            reply_tx,
        } = op;

        let token = self.correlator.register(timeout, reply_tx);
        self.state.record_command();
        let frame = command_frame(&action, &payload, token);

        tracing::debug!(%action, token, "Sending command");
        if let Err(e) = process.write_line(&frame).await {
            tracing::warn!(%action, token, error = %e, "Write failed, failing command");
            self.correlator.fail(token, e.into());
        }
    }

    /// Apply one classified event to the status snapshot and correlator.
    fn apply_event(&mut self, event: &StatusEvent, raw_line: &str) {
        match event {
            StatusEvent::Reply {
                token,
                action,
                payload,
            } => {
                // Token is authoritative for matching; the action only
                // informs status bookkeeping.
                if action == TRANSFORMER_DEPLOYED_ACTION {
                    self.status.deployed_transformers =
                        self.status.deployed_transformers.saturating_add(1);
                    self.publish_status();
                }
                let matched = self.correlator.resolve(
                    *token,
                    Reply {
                        action: action.clone(),
                        payload: payload.clone(),
                    },
                );
                if matched {
                    self.state.record_reply();
                }
            }
            StatusEvent::Unrecognized { raw } => {
                tracing::debug!(line = %raw, "Engine output");
            }
            other => {
                if self.status.apply(other) {
                    self.publish_status();
                }
                tracing::debug!(event = ?other, line = %raw_line, "Status event");
            }
        }
    }

    /// Unsolicited exit: fail everything in flight immediately.
    fn enter_degraded(&mut self, code: Option<i32>) {
        let failed = self.correlator.fail_all(&CommandError::WorkerCrashed);
        if failed > 0 {
            tracing::warn!(failed, "Failed in-flight commands after engine crash");
        }
        self.status.mark_exited();
        self.publish_status();
        self.transition(SupervisorState::Degraded);
        tracing::warn!(?code, "Supervisor degraded, awaiting shutdown");
    }

    /// Cooperative termination with force-kill escalation.
    async fn shutdown_engine(&mut self, process: &mut EngineProcess) {
        self.transition(SupervisorState::ShuttingDown);
        let cancelled = self.correlator.fail_all(&CommandError::ShuttingDown);
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled in-flight commands for shutdown");
        }

        match process.graceful_terminate(self.config.timeouts.grace()).await {
            Ok(status) => tracing::info!(code = ?status.code(), "Engine terminated"),
            Err(e) => tracing::error!(error = %e, "Failed to terminate engine"),
        }
        self.status.mark_exited();
        self.publish_status();
    }

    fn transition(&mut self, state: SupervisorState) {
        self.state.transition(state);
        let _ = self.state_tx.send(state);
    }

    fn publish_status(&self) {
        let _ = self.status_tx.send(self.status);
    }
}

enum ReadyOutcome {
    Ready,
    Cancelled,
}

enum LoopEnd {
    Cancelled,
    Crashed { code: Option<i32> },
}

/// Read raw stdout bytes, decode into lines, and feed the supervisor loop.
fn spawn_line_reader(
    mut stdout: tokio::process::ChildStdout,
    max_line_len: usize,
    tx: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoder = LineDecoder::new(max_line_len);
        let mut buf = [0u8; 4096];

        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for item in decoder.feed(&buf[..n]) {
                        match item {
                            Ok(line) => {
                                if tx.send(line).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Dropping engine output line");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Engine stdout read failed");
                    break;
                }
            }
        }

        if let Some(line) = decoder.flush() {
            let _ = tx.send(line).await;
        }
    })
}

/// Log engine stderr lines; they carry diagnostics, never control signals.
fn spawn_stderr_logger(stderr: tokio::process::ChildStderr) -> JoinHandle<()> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::warn!(target: "engine_stderr", "{line}");
        }
    })
}
