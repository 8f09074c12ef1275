// Library exports for the corral supervisor

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod logs;
pub mod process;

pub use error::{CorralError, Result, SpawnError};
