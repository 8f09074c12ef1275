// CLI module - User-facing command-line interface

mod output;

use crate::config::EcosystemConfig;
use crate::daemon::{self, ExitCause, RunOptions, DEFAULT_PID_FILE};
use crate::error::Result;
use crate::ipc::{Command, IpcClient, ResponseData, DEFAULT_SOCKET_PATH};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Corral - supervise a fixed set of long-running apps
#[derive(Parser)]
#[command(name = "corral")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Control socket of the running supervisor
    #[arg(long, global = true, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor in the foreground and start every app
    Run {
        /// Ecosystem file (.toml or .json)
        #[arg(short, long)]
        config: PathBuf,

        /// PID file guarding against a second supervisor
        #[arg(long, default_value = DEFAULT_PID_FILE)]
        pid_file: PathBuf,
    },

    /// Start one app, or every app when no name is given
    Start {
        name: Option<String>,
    },

    /// Stop one app, or every app when no name is given
    Stop {
        name: Option<String>,

        /// Send SIGKILL instead of the app's stop signal
        #[arg(short, long)]
        force: bool,
    },

    /// Restart an app and reset its crash-loop window
    Restart {
        name: String,
    },

    /// Show the state of every app
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Stop every app and exit the supervisor
    Shutdown,
}

impl Cli {
    /// Execute the parsed command. `Ok(false)` means the command ran but some
    /// app did not reach the requested state.
    pub fn execute(self) -> Result<bool> {
        let (request, progress, json) = match self.command {
            Commands::Run { config, pid_file } => {
                return run_foreground(&config, self.socket, pid_file)
            }
            Commands::Start { name } => (Command::Start { name }, Some("Starting..."), false),
            Commands::Stop { name, force } => {
                (Command::Stop { name, force }, Some("Stopping..."), false)
            }
            Commands::Restart { name } => (Command::Restart { name }, Some("Restarting..."), false),
            Commands::Status { json } => (Command::Status, None, json),
            Commands::Shutdown => (Command::Shutdown, Some("Shutting down..."), false),
        };

        init_tracing(None, "warn")?;
        send(&self.socket, request, progress, json)
    }
}

fn run_foreground(config_path: &Path, socket_path: PathBuf, pid_file: PathBuf) -> Result<bool> {
    let config = EcosystemConfig::from_file(config_path)?;
    init_tracing(config.global.log_file.as_deref(), "info")?;
    tracing::info!(
        "Loaded {} app(s) from {}",
        config.apps.len(),
        config_path.display()
    );
    for key in config.ignored_keys() {
        tracing::warn!("Ignoring unsupported key '{}' in {}", key, config_path.display());
    }

    let options = RunOptions {
        socket_path,
        pid_file,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let cause = runtime.block_on(daemon::run(config, options, |outcomes| {
        output::print_outcomes(outcomes);
    }))?;

    match cause {
        ExitCause::Signal(name) => output::print_info(&format!("Stopped on {}", name)),
        ExitCause::ShutdownCommand => output::print_info("Stopped by shutdown command"),
    }
    Ok(true)
}

/// Send one request to the running supervisor and print the answer
fn send(socket: &Path, request: Command, progress: Option<&str>, json: bool) -> Result<bool> {
    let client = IpcClient::with_socket_path(socket);
    let spinner = progress.map(output::create_progress_bar);
    let result = client.send_command(request);
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    let data = match result {
        Ok(data) => data,
        Err(e) => {
            output::print_error(&e.to_string());
            return Err(e);
        }
    };

    match &data {
        ResponseData::Status(apps) if json => output::print_status_json(apps)?,
        ResponseData::Status(apps) => output::print_status_table(apps),
        ResponseData::Outcomes(outcomes) => output::print_outcomes(outcomes),
        ResponseData::ShuttingDown(outcomes) => {
            output::print_outcomes(outcomes);
            output::print_info("Supervisor is exiting");
        }
    }

    Ok(data.all_ok())
}

/// Install the global tracing subscriber: `RUST_LOG` wins over `default_level`,
/// output goes to `log_file` when given, otherwise stderr.
pub fn init_tracing(log_file: Option<&Path>, default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let installed = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    // A subscriber may already be installed (tests); keep it
    if let Err(e) = installed {
        tracing::debug!("Tracing subscriber not installed: {}", e);
    }
    Ok(())
}
