use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// Lifecycle state of one supervised app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ProcessState {
    /// States in which no OS process is alive for the app
    pub fn is_idle(&self) -> bool {
        matches!(self, ProcessState::NotStarted | ProcessState::Stopped)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::NotStarted => write!(f, "not-started"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Crashed => write!(f, "crashed"),
        }
    }
}

/// Why a run of the process ended without being asked to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// The process exited on its own or was killed by a signal
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Readiness was not confirmed within `listen_timeout`
    ReadyTimeout,
    /// Sampled memory went above `max_memory`
    MemoryLimit { used: u64, limit: u64 },
    /// The process could not be spawned at all
    SpawnFailed(String),
}

impl ExitReason {
    #[cfg(unix)]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        ExitReason::Exited {
            code: status.code(),
            signal: status.signal(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        ExitReason::Exited {
            code: status.code(),
            signal: None,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Exited {
                code: Some(code), ..
            } => write!(f, "exited with code {}", code),
            ExitReason::Exited {
                signal: Some(signal),
                ..
            } => write!(f, "killed by signal {}", signal),
            ExitReason::Exited { .. } => write!(f, "exited"),
            ExitReason::ReadyTimeout => write!(f, "ready timeout"),
            ExitReason::MemoryLimit { used, limit } => {
                write!(f, "memory limit exceeded ({} > {} bytes)", used, limit)
            }
            ExitReason::SpawnFailed(msg) => write!(f, "spawn failed: {}", msg),
        }
    }
}

/// Snapshot of one app, published by its supervisor on every change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppStatus {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    /// When the current process was spawned
    pub started_at: Option<SystemTime>,
    /// Restarts consumed in the current crash-loop window
    pub restarts: usize,
    pub total_restarts: usize,
    pub memory: Option<u64>,
    pub last_exit: Option<ExitReason>,
    /// Operator-visible alert, set when the restart budget is exhausted
    pub alert: Option<String>,
    pub dropped_log_lines: u64,
}

impl AppStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ProcessState::NotStarted,
            pid: None,
            started_at: None,
            restarts: 0,
            total_restarts: 0,
            memory: None,
            last_exit: None,
            alert: None,
            dropped_log_lines: 0,
        }
    }

    pub fn uptime(&self) -> Option<Duration> {
        if self.state != ProcessState::Running {
            return None;
        }
        self.started_at
            .map(|at| SystemTime::now().duration_since(at).unwrap_or(Duration::ZERO))
    }
}

/// Result of a control request for one app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppOutcome {
    pub name: String,
    /// State once the request settled
    pub state: ProcessState,
    /// Why the requested state was not reached
    pub error: Option<String>,
}

impl AppOutcome {
    pub fn ok(name: impl Into<String>, state: ProcessState) -> Self {
        Self {
            name: name.into(),
            state,
            error: None,
        }
    }

    pub fn failed(name: impl Into<String>, state: ProcessState, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ProcessState::NotStarted.to_string(), "not-started");
        assert_eq!(ProcessState::Crashed.to_string(), "crashed");
        assert!(ProcessState::Stopped.is_idle());
        assert!(!ProcessState::Stopping.is_idle());
    }

    #[test]
    fn test_exit_reason_display() {
        let exited = ExitReason::Exited {
            code: Some(1),
            signal: None,
        };
        assert_eq!(exited.to_string(), "exited with code 1");

        let killed = ExitReason::Exited {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "killed by signal 9");
        assert_eq!(ExitReason::ReadyTimeout.to_string(), "ready timeout");
    }

    #[test]
    fn test_uptime_only_when_running() {
        let mut status = AppStatus::new("web");
        status.started_at = Some(SystemTime::now() - Duration::from_secs(30));
        assert!(status.uptime().is_none());

        status.state = ProcessState::Running;
        assert!(status.uptime().unwrap() >= Duration::from_secs(30));
    }
}
