// Daemon module - Foreground supervisor process

pub mod pid;
pub mod runner;

pub use pid::{PidFile, DEFAULT_PID_FILE};
pub use runner::{run, ExitCause, RunOptions};
