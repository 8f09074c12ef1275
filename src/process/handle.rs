use crate::config::AppDescriptor;
use crate::error::{CorralError, Result, SpawnError};
use crate::process::monitor::MemorySampler;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant, SystemTime};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// How a process should be asked to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// The app's configured stop signal
    Graceful,
    /// SIGKILL
    Force,
}

/// How a termination request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period
    Graceful,
    /// Killed after the grace period elapsed
    Forced,
    /// Was already gone when the request arrived
    AlreadyExited,
}

/// One OS child process owned by an app supervisor.
///
/// The child leads its own process group so signals also reach the
/// processes it spawns (`npm` -> `node`, for example).
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    child: Child,
    pid: u32,
    stop_signal: Signal,
    started_at: Instant,
    started_wall: SystemTime,
    exit: Option<ExitStatus>,
    sampler: MemorySampler,
}

impl ProcessHandle {
    /// Spawn the app described by `descriptor`.
    ///
    /// `defaults` fill in environment variables missing from the ambient
    /// environment; the descriptor's own `env` always wins.
    pub fn spawn(
        descriptor: &AppDescriptor,
        defaults: &HashMap<String, String>,
    ) -> std::result::Result<Self, SpawnError> {
        if let Some(ref cwd) = descriptor.cwd {
            if !cwd.is_dir() {
                return Err(SpawnError::WorkingDirMissing(cwd.clone()));
            }
        }

        let stop_signal = parse_signal(&descriptor.stop_signal)
            .map_err(|e| SpawnError::Io(e.to_string()))?;

        let mut command = Command::new(&descriptor.script);
        command.args(&descriptor.args);

        if let Some(ref cwd) = descriptor.cwd {
            command.current_dir(cwd);
        }

        let env = build_environment(std::env::vars_os(), defaults, &descriptor.env);
        command.env_clear().envs(env);

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => SpawnError::ExecutableNotFound(descriptor.script.clone()),
            ErrorKind::PermissionDenied => SpawnError::PermissionDenied(descriptor.script.clone()),
            _ => SpawnError::Io(format!("'{}': {}", descriptor.name, e)),
        })?;

        let pid = child
            .id()
            .ok_or_else(|| SpawnError::Io(format!("no PID for '{}'", descriptor.name)))?;

        tracing::debug!("Spawned {} (PID: {})", descriptor.name, pid);

        Ok(Self {
            name: descriptor.name.clone(),
            child,
            pid,
            stop_signal,
            started_at: Instant::now(),
            started_wall: SystemTime::now(),
            exit: None,
            sampler: MemorySampler::new(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_wall
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Exit status, if the process has been reaped
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Non-blocking check for exit; reaps the child if it has exited
    pub fn try_exit(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit = Some(status);
            }
        }
        self.exit
    }

    /// Send a signal to the process group
    pub fn signal(&mut self, kind: SignalKind) -> Result<()> {
        if self.try_exit().is_some() {
            return Err(CorralError::AlreadyExited(self.pid));
        }

        let sig = match kind {
            SignalKind::Graceful => self.stop_signal,
            SignalKind::Force => Signal::SIGKILL,
        };

        match signal::killpg(Pid::from_raw(self.pid as i32), sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(CorralError::AlreadyExited(self.pid)),
            Err(e) => Err(CorralError::SignalError(format!(
                "Failed to send {} to {} (PID: {}): {}",
                sig, self.name, self.pid, e
            ))),
        }
    }

    /// Wait for the process to exit. Returns immediately once it has.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(status)
    }

    /// Memory of the process tree in bytes, or `None` when unavailable
    pub fn sample_memory(&mut self) -> Option<u64> {
        if self.exit.is_some() {
            return None;
        }
        self.sampler.sample_tree(self.pid)
    }

    /// Graceful signal, wait up to `grace`, then SIGKILL. Returns once the
    /// process has been reaped.
    pub async fn terminate(&mut self, grace: Duration) -> Result<Termination> {
        match self.signal(SignalKind::Graceful) {
            Ok(()) => {}
            Err(CorralError::AlreadyExited(_)) => {
                self.wait().await?;
                self.kill_stragglers();
                return Ok(Termination::AlreadyExited);
            }
            Err(e) => return Err(e),
        }

        let outcome = match tokio::time::timeout(grace, self.wait()).await {
            Ok(status) => {
                status?;
                Termination::Graceful
            }
            Err(_) => {
                tracing::warn!(
                    "{} (PID: {}) did not exit within {:?}, sending SIGKILL",
                    self.name,
                    self.pid,
                    grace
                );
                match self.signal(SignalKind::Force) {
                    Ok(()) | Err(CorralError::AlreadyExited(_)) => {}
                    Err(e) => return Err(e),
                }
                self.wait().await?;
                Termination::Forced
            }
        };

        self.kill_stragglers();
        Ok(outcome)
    }

    /// SIGKILL the process group and reap the leader
    pub async fn kill(&mut self) -> Result<Termination> {
        let outcome = match self.signal(SignalKind::Force) {
            Ok(()) => Termination::Forced,
            Err(CorralError::AlreadyExited(_)) => Termination::AlreadyExited,
            Err(e) => return Err(e),
        };
        self.wait().await?;
        self.kill_stragglers();
        Ok(outcome)
    }

    /// Kill whatever is left in the process group once the leader is gone.
    ///
    /// A reaped leader's PID is only reissued after every member of its group
    /// has exited, so a live process under that PID means the group number
    /// now belongs to someone else and is left alone.
    pub fn kill_stragglers(&self) {
        let group = Pid::from_raw(self.pid as i32);
        if self.exit.is_some() && !matches!(signal::kill(group, None), Err(Errno::ESRCH)) {
            tracing::debug!(
                "PID {} of {} was reused, not signalling its group",
                self.pid,
                self.name
            );
            return;
        }
        let _ = signal::killpg(group, Signal::SIGKILL);
    }
}

/// Parse a signal name such as "SIGTERM"
pub fn parse_signal(signal_name: &str) -> Result<Signal> {
    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(CorralError::SignalError(format!(
            "Invalid signal name: {}",
            signal_name
        ))),
    }
}

/// Merge the child's environment: ambient first, then `defaults` for keys the
/// ambient environment lacks, then `overrides` unconditionally.
pub fn build_environment<I>(
    ambient: I,
    defaults: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> HashMap<OsString, OsString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: HashMap<OsString, OsString> = ambient.into_iter().collect();

    for (key, value) in defaults {
        env.entry(OsString::from(key))
            .or_insert_with(|| OsString::from(value));
    }

    for (key, value) in overrides {
        env.insert(OsString::from(key), OsString::from(value));
    }

    env
}
