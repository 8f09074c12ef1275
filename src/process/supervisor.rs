use crate::config::{AppDescriptor, GlobalSettings};
use crate::error::{CorralError, Result};
use crate::logs::{spawn_pump, LogSink, SharedSink, StreamId};
use crate::process::handle::{ProcessHandle, Termination};
use crate::process::ready::wait_for_port;
use crate::process::restart::{decide, Decision, RestartEntry, RestartLimits, RestartRecord};
use crate::process::types::{AppStatus, ExitReason, ProcessState};
use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pending control commands per app
const COMMAND_BUFFER: usize = 16;

/// How long output pumps get to flush after their process is gone
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Slack added on top of an app's own timeouts when waiting for it to settle
const SETTLE_MARGIN: Duration = Duration::from_secs(5);

/// Control messages accepted by an app supervisor
#[derive(Debug)]
pub enum AppCommand {
    /// Acknowledged once the app is `Starting` (or already live)
    Start { reply: oneshot::Sender<()> },
    /// Answered once the app is `Stopped`
    Stop {
        graceful: bool,
        reply: oneshot::Sender<Result<Termination>>,
    },
    /// Stop if live, reset the crash window, start again. Acknowledged once
    /// the app is `Starting`.
    Restart { reply: oneshot::Sender<()> },
}

/// A spawned process together with its output pumps
struct Live {
    handle: ProcessHandle,
    pumps: Vec<JoinHandle<()>>,
}

enum Phase {
    Idle,
    Starting,
    Running(Live),
    /// `ready` is false when the run never reached `Running`
    Crashed {
        reason: ExitReason,
        uptime: Duration,
        ready: bool,
    },
    Done,
}

/// Owns one app's lifecycle: its process, restart history and log sink.
///
/// Runs as a single tokio task. Every state change is published on a
/// `watch` channel and written to the app's out log as a `[corral]` line.
pub struct AppSupervisor {
    descriptor: AppDescriptor,
    defaults: HashMap<String, String>,
    limits: RestartLimits,
    history: RestartRecord,
    sink: SharedSink,
    status: watch::Sender<AppStatus>,
    commands: mpsc::Receiver<AppCommand>,
    ticks: watch::Receiver<u64>,
    ticking: bool,
}

impl AppSupervisor {
    pub async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Starting => self.starting().await,
                Phase::Running(live) => self.running(live).await,
                Phase::Crashed {
                    reason,
                    uptime,
                    ready,
                } => self.crashed(reason, uptime, ready).await,
                Phase::Done => break,
            };
        }

        self.sink.lock().await.close().await;
        debug!("Supervisor for {} exited", self.descriptor.name);
    }

    async fn idle(&mut self) -> Phase {
        match self.commands.recv().await {
            None => Phase::Done,
            Some(AppCommand::Start { reply }) => {
                self.begin_start("start requested").await;
                let _ = reply.send(());
                Phase::Starting
            }
            Some(AppCommand::Restart { reply }) => {
                self.reset_window();
                self.begin_start("restart requested").await;
                let _ = reply.send(());
                Phase::Starting
            }
            Some(AppCommand::Stop { reply, .. }) => {
                if self.status.borrow().state != ProcessState::Stopped {
                    self.transition(ProcessState::Stopped, "stop requested before start")
                        .await;
                    self.sink.lock().await.close().await;
                }
                let _ = reply.send(Ok(Termination::AlreadyExited));
                Phase::Idle
            }
        }
    }

    async fn starting(&mut self) -> Phase {
        self.sink.lock().await.reopen().await;

        let mut handle = match ProcessHandle::spawn(&self.descriptor, &self.defaults) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to spawn {}: {}", self.descriptor.name, e);
                return Phase::Crashed {
                    reason: ExitReason::SpawnFailed(e.to_string()),
                    uptime: Duration::ZERO,
                    ready: false,
                };
            }
        };

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = handle.take_stdout() {
            pumps.push(spawn_pump(stdout, StreamId::Stdout, self.sink.clone()));
        }
        if let Some(stderr) = handle.take_stderr() {
            pumps.push(spawn_pump(stderr, StreamId::Stderr, self.sink.clone()));
        }

        let pid = handle.pid();
        let started_at = handle.started_at();
        self.status.send_modify(|s| {
            s.pid = Some(pid);
            s.started_at = Some(started_at);
            s.memory = None;
        });

        let mut live = Live { handle, pumps };

        let Some(port) = self.descriptor.ready_port else {
            // Without a probe, being alive right after spawn counts as ready
            if let Some(status) = live.handle.try_exit() {
                return self.exited(&mut live, Ok(status), false).await;
            }
            self.transition(ProcessState::Running, &format!("spawned with PID {}", pid))
                .await;
            return Phase::Running(live);
        };

        let probe = wait_for_port(port);
        tokio::pin!(probe);
        let deadline = tokio::time::sleep(self.descriptor.listen_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut probe => {
                    self.transition(
                        ProcessState::Running,
                        &format!("PID {} accepting connections on port {}", pid, port),
                    )
                    .await;
                    return Phase::Running(live);
                }
                exit = live.handle.wait() => {
                    return self.exited(&mut live, exit, false).await;
                }
                _ = &mut deadline => {
                    let timeout = CorralError::ReadyTimeout(
                        self.descriptor.name.clone(),
                        self.descriptor.listen_timeout,
                    );
                    warn!("{} (port {})", timeout, port);
                    let uptime = live.handle.uptime();
                    if let Err(e) = self.shut_down(&mut live, true).await {
                        error!("{}", e);
                    }
                    drain_pumps(&mut live).await;
                    return Phase::Crashed {
                        reason: ExitReason::ReadyTimeout,
                        uptime,
                        ready: false,
                    };
                }
                command = self.commands.recv() => {
                    if let Some(next) = self.live_command(&mut live, command).await {
                        return next;
                    }
                }
            }
        }
    }

    async fn running(&mut self, mut live: Live) -> Phase {
        loop {
            tokio::select! {
                exit = live.handle.wait() => {
                    return self.exited(&mut live, exit, true).await;
                }
                tick = self.ticks.changed(), if self.ticking => {
                    if tick.is_err() {
                        debug!("Monitor clock stopped; {} no longer sampled", self.descriptor.name);
                        self.ticking = false;
                        continue;
                    }
                    if let Some(reason) = self.sample(&mut live) {
                        warn!("{}: {}, terminating", self.descriptor.name, reason);
                        let uptime = live.handle.uptime();
                        if let Err(e) = self.shut_down(&mut live, true).await {
                            error!("{}", e);
                        }
                        drain_pumps(&mut live).await;
                        return Phase::Crashed { reason, uptime, ready: true };
                    }
                }
                command = self.commands.recv() => {
                    if let Some(next) = self.live_command(&mut live, command).await {
                        return next;
                    }
                }
            }
        }
    }

    async fn crashed(&mut self, reason: ExitReason, uptime: Duration, ready: bool) -> Phase {
        let entry = if ready {
            RestartEntry::now(reason.clone(), uptime)
        } else {
            RestartEntry::before_ready(reason.clone(), uptime)
        };
        self.history.record(entry);
        let cause = format!("{} after {:?}", reason, uptime);
        self.status
            .send_modify(|s| s.last_exit = Some(reason));
        warn!("{} crashed: {}", self.descriptor.name, cause);
        self.transition(ProcessState::Crashed, &cause).await;

        let delay = match decide(&self.history, &self.limits) {
            Decision::Restart { delay } => delay,
            Decision::GiveUp => return self.give_up().await,
        };

        let window = self.history.window(self.limits.min_uptime).len();
        self.status.send_modify(|s| {
            s.restarts = window;
            s.total_restarts += 1;
        });
        info!(
            "Restarting {} in {:?} ({} of {} restarts in window)",
            self.descriptor.name, delay, window, self.limits.max_restarts
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        tokio::select! {
            _ = &mut sleep => {
                self.transition(ProcessState::Starting, "automatic restart").await;
                Phase::Starting
            }
            command = self.commands.recv() => match command {
                None => Phase::Done,
                Some(AppCommand::Start { reply }) => {
                    self.begin_start("start requested").await;
                    let _ = reply.send(());
                    Phase::Starting
                }
                Some(AppCommand::Restart { reply }) => {
                    self.reset_window();
                    self.begin_start("restart requested").await;
                    let _ = reply.send(());
                    Phase::Starting
                }
                Some(AppCommand::Stop { reply, .. }) => {
                    self.transition(ProcessState::Stopped, "stop requested during restart delay")
                        .await;
                    self.sink.lock().await.close().await;
                    let _ = reply.send(Ok(Termination::AlreadyExited));
                    Phase::Idle
                }
            }
        }
    }

    async fn give_up(&mut self) -> Phase {
        let alert = if self.limits.enabled {
            let alert = format!(
                "restart budget exhausted: {} crashes within window (max_restarts {})",
                self.history.window(self.limits.min_uptime).len(),
                self.limits.max_restarts
            );
            error!(
                "{}: {}",
                CorralError::RestartBudgetExhausted(self.descriptor.name.clone()),
                alert
            );
            alert
        } else {
            info!("{} exited and autorestart is disabled", self.descriptor.name);
            "autorestart disabled".to_string()
        };

        self.status
            .send_modify(|s| s.alert = Some(alert.clone()));
        self.transition(ProcessState::Stopped, &alert).await;
        self.sink.lock().await.close().await;
        Phase::Idle
    }

    /// Handle a command that arrives while a process is live.
    /// `Some` ends the live phase.
    async fn live_command(&mut self, live: &mut Live, command: Option<AppCommand>) -> Option<Phase> {
        match command {
            None => {
                let _ = self.stop_live(live, true, "supervisor shutting down").await;
                Some(Phase::Done)
            }
            Some(AppCommand::Start { reply }) => {
                let _ = reply.send(());
                None
            }
            Some(AppCommand::Stop { graceful, reply }) => {
                let cause = if graceful {
                    "stop requested"
                } else {
                    "forced stop requested"
                };
                let result = self.stop_live(live, graceful, cause).await;
                let _ = reply.send(result);
                Some(Phase::Idle)
            }
            Some(AppCommand::Restart { reply }) => {
                if let Err(e) = self.stop_live(live, true, "restart requested").await {
                    warn!("{}", e);
                }
                self.reset_window();
                self.begin_start("restart requested").await;
                let _ = reply.send(());
                Some(Phase::Starting)
            }
        }
    }

    async fn stop_live(&mut self, live: &mut Live, graceful: bool, cause: &str) -> Result<Termination> {
        self.transition(ProcessState::Stopping, cause).await;

        let result = self.shut_down(live, graceful).await;
        if let Err(e) = &result {
            error!("{}", e);
        }

        drain_pumps(live).await;

        let detail = match &result {
            Ok(Termination::Graceful) => "exited gracefully",
            Ok(Termination::Forced) => "killed after timeout",
            Ok(Termination::AlreadyExited) => "already exited",
            Err(_) => "stop failed",
        };
        self.transition(ProcessState::Stopped, detail).await;
        self.sink.lock().await.close().await;

        result
    }

    /// Terminate (or kill) the live process, falling back to SIGKILL if the
    /// first attempt fails. Returns only once the process has been reaped.
    async fn shut_down(&mut self, live: &mut Live, graceful: bool) -> Result<Termination> {
        let first = if graceful {
            live.handle.terminate(self.descriptor.kill_timeout).await
        } else {
            live.handle.kill().await
        };

        let result = match first {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("Failed to stop {}: {}, sending SIGKILL", self.descriptor.name, e);
                live.handle.kill().await.map_err(|_| e)
            }
        };

        if live.handle.exit_status().is_none() {
            // Signals failed outright; block until the child is reaped anyway
            if let Err(e) = live.handle.wait().await {
                warn!("Failed to reap {}: {}", self.descriptor.name, e);
            }
        }

        result.map_err(|e| CorralError::StopError(self.descriptor.name.clone(), e.to_string()))
    }

    async fn exited(&mut self, live: &mut Live, exit: Result<ExitStatus>, ready: bool) -> Phase {
        let uptime = live.handle.uptime();
        let reason = match exit {
            Ok(status) => ExitReason::from_status(status),
            Err(e) => {
                warn!("Failed to collect exit status of {}: {}", self.descriptor.name, e);
                ExitReason::Exited {
                    code: None,
                    signal: None,
                }
            }
        };
        live.handle.kill_stragglers();
        drain_pumps(live).await;
        Phase::Crashed {
            reason,
            uptime,
            ready,
        }
    }

    /// Refresh memory in the published status; `Some` if over the limit
    fn sample(&mut self, live: &mut Live) -> Option<ExitReason> {
        let memory = live.handle.sample_memory();
        let dropped = self.sink.try_lock().ok().map(|sink| sink.dropped_lines());

        self.status.send_modify(|s| {
            s.memory = memory;
            if let Some(dropped) = dropped {
                s.dropped_log_lines = dropped;
            }
        });

        match (memory, self.descriptor.max_memory) {
            (Some(used), Some(limit)) if used > limit => Some(ExitReason::MemoryLimit { used, limit }),
            _ => None,
        }
    }

    async fn begin_start(&mut self, cause: &str) {
        self.status.send_modify(|s| s.alert = None);
        self.transition(ProcessState::Starting, cause).await;
    }

    fn reset_window(&mut self) {
        self.history.reset_window();
        self.status.send_modify(|s| {
            s.restarts = 0;
            s.alert = None;
        });
    }

    async fn transition(&mut self, state: ProcessState, cause: &str) {
        let previous = self.status.borrow().state;
        info!("{}: {} -> {} ({})", self.descriptor.name, previous, state, cause);

        let dropped = {
            let mut sink = self.sink.lock().await;
            sink.write_event(&format!("{} -> {}: {}", previous, state, cause))
                .await;
            sink.dropped_lines()
        };

        self.status.send_modify(|s| {
            s.state = state;
            s.dropped_log_lines = dropped;
            if !matches!(state, ProcessState::Starting | ProcessState::Running | ProcessState::Stopping) {
                s.pid = None;
                s.memory = None;
            }
        });
    }
}

async fn drain_pumps(live: &mut Live) {
    for mut pump in live.pumps.drain(..) {
        if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut pump)
            .await
            .is_err()
        {
            pump.abort();
        }
    }
}

/// Registry-side handle to a running `AppSupervisor` task
pub struct SupervisorHandle {
    name: String,
    commands: mpsc::Sender<AppCommand>,
    status: watch::Receiver<AppStatus>,
    task: JoinHandle<()>,
    settle_timeout: Duration,
    kill_timeout: Duration,
}

impl SupervisorHandle {
    /// Spawn the supervisor task for `descriptor`. The app stays
    /// `NotStarted` until a start command arrives.
    pub fn spawn(
        descriptor: AppDescriptor,
        settings: &GlobalSettings,
        ticks: watch::Receiver<u64>,
    ) -> Self {
        let paths = descriptor.log_paths(settings);
        let sink = LogSink::new(&paths, descriptor.merge_logs, descriptor.date_format(settings));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status_rx) = watch::channel(AppStatus::new(descriptor.name.clone()));

        let name = descriptor.name.clone();
        let settle_timeout = descriptor.listen_timeout + descriptor.kill_timeout + SETTLE_MARGIN;
        let kill_timeout = descriptor.kill_timeout;
        let limits = RestartLimits::from_descriptor(&descriptor);

        let supervisor = AppSupervisor {
            history: RestartRecord::for_limits(&limits),
            limits,
            defaults: settings.env.clone(),
            descriptor,
            sink: Arc::new(Mutex::new(sink)),
            status: status_tx,
            commands: command_rx,
            ticks,
            ticking: true,
        };

        let task = tokio::spawn(supervisor.run());

        Self {
            name,
            commands: command_tx,
            status: status_rx,
            task,
            settle_timeout,
            kill_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest published status
    pub fn status(&self) -> AppStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AppStatus> {
        self.status.clone()
    }

    /// How long a start may reasonably take to settle
    pub fn settle_timeout(&self) -> Duration {
        self.settle_timeout
    }

    pub fn kill_timeout(&self) -> Duration {
        self.kill_timeout
    }

    pub async fn start(&self) -> Result<()> {
        let (reply, ack) = oneshot::channel();
        self.send(AppCommand::Start { reply }).await?;
        ack.await.map_err(|_| self.gone())
    }

    pub async fn stop(&self, graceful: bool) -> Result<Termination> {
        let ack = self.request_stop(graceful).await?;
        self.await_stop(ack).await
    }

    /// Queue a stop without waiting for it; pair with `await_stop`
    pub async fn request_stop(&self, graceful: bool) -> Result<oneshot::Receiver<Result<Termination>>> {
        let (reply, ack) = oneshot::channel();
        self.send(AppCommand::Stop { graceful, reply }).await?;
        Ok(ack)
    }

    pub async fn await_stop(&self, ack: oneshot::Receiver<Result<Termination>>) -> Result<Termination> {
        ack.await.map_err(|_| self.gone())?
    }

    pub async fn restart(&self) -> Result<()> {
        let (reply, ack) = oneshot::channel();
        self.send(AppCommand::Restart { reply }).await?;
        ack.await.map_err(|_| self.gone())
    }

    /// Wait until the published status satisfies `predicate`
    pub async fn wait_until<F>(&self, timeout: Duration, what: &str, predicate: F) -> Result<AppStatus>
    where
        F: FnMut(&AppStatus) -> bool,
    {
        let mut status = self.status.clone();
        let result = match tokio::time::timeout(timeout, status.wait_for(predicate)).await {
            Ok(Ok(current)) => Ok(current.clone()),
            Ok(Err(_)) => Err(self.gone()),
            Err(_) => Err(CorralError::StateTimeout(self.name.clone(), what.to_string())),
        };
        result
    }

    /// Close the command channel and wait for the task to finish. A live
    /// process is stopped gracefully first.
    pub async fn join(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        let _ = task.await;
    }

    /// Tear the task down without stopping anything; used once the app is idle
    pub fn abort(&self) {
        self.task.abort();
    }

    async fn send(&self, command: AppCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.gone())
    }

    fn gone(&self) -> CorralError {
        CorralError::SupervisorGone(self.name.clone())
    }
}
