// Process module - Per-app supervision and the registry that owns it

pub mod handle;
pub mod monitor;
mod ready;
pub mod registry;
pub mod restart;
pub mod supervisor;
pub mod types;

pub use handle::{build_environment, ProcessHandle, SignalKind, Termination};
pub use monitor::{MemorySampler, MonitorClock};
pub use registry::SupervisorRegistry;
pub use restart::{decide, BackoffStrategy, Decision, RestartEntry, RestartLimits, RestartRecord};
pub use supervisor::{AppCommand, AppSupervisor, SupervisorHandle};
pub use types::{AppOutcome, AppStatus, ExitReason, ProcessState};
