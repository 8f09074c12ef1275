use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the corral supervisor
#[derive(Debug, Error)]
pub enum CorralError {
    // App-related errors
    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("Duplicate app name: {0}")]
    DuplicateName(String),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("Process {0} has already exited")]
    AlreadyExited(u32),

    #[error("App {0} did not become ready within {1:?}")]
    ReadyTimeout(String, Duration),

    #[error("Restart budget exhausted for {0}")]
    RestartBudgetExhausted(String),

    #[error("Failed to stop app {0}: {1}")]
    StopError(String, String),

    #[error("App {0} did not reach state {1} in time")]
    StateTimeout(String, String),

    #[error("Supervisor for {0} is no longer running")]
    SupervisorGone(String),

    // IPC-related errors
    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Failed to connect to supervisor: {0}")]
    ConnectionError(String),

    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    #[error("Supervisor not running")]
    DaemonNotRunning,

    #[error("Supervisor already running (pid {0})")]
    DaemonAlreadyRunning(u32),

    #[error("PID file error: {0}")]
    PidFileError(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // Log-related errors
    #[error("Log write failed: {0}")]
    LogWrite(String),

    #[error("Failed to open log file: {0}")]
    LogFileError(String),

    // System errors
    #[error("Signal error: {0}")]
    SignalError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Reasons a child process could not be spawned
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("executable not found: {0}")]
    ExecutableNotFound(PathBuf),

    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("working directory missing: {0}")]
    WorkingDirMissing(PathBuf),

    #[error("spawn failed: {0}")]
    Io(String),
}

/// Result type alias for corral operations
pub type Result<T> = std::result::Result<T, CorralError>;
