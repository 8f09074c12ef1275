// Foreground supervisor: registry + control socket + signal handling

use crate::config::EcosystemConfig;
use crate::daemon::pid::PidFile;
use crate::error::Result;
use crate::ipc::{Command, IpcServer, ResponseData};
use crate::process::{AppOutcome, SupervisorRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Where the foreground supervisor keeps its runtime files
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
}

/// Why the supervisor is exiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    Signal(&'static str),
    ShutdownCommand,
}

/// Run every app in `config` until SIGINT/SIGTERM or a shutdown command.
///
/// `on_started` sees the outcome of the initial start-all. All apps are
/// stopped gracefully before this returns.
pub async fn run<F>(config: EcosystemConfig, options: RunOptions, on_started: F) -> Result<ExitCause>
where
    F: FnOnce(&[AppOutcome]),
{
    let pid_file = PidFile::with_path(&options.pid_file);
    pid_file.acquire()?;

    let result = serve(config, &options, on_started).await;

    if let Err(e) = pid_file.remove() {
        warn!("{}", e);
    }
    result
}

async fn serve<F>(config: EcosystemConfig, options: &RunOptions, on_started: F) -> Result<ExitCause>
where
    F: FnOnce(&[AppOutcome]),
{
    // Install handlers before any child exists
    let mut signals = ShutdownSignals::install()?;

    let registry = Arc::new(SupervisorRegistry::new(config.apps, &config.global)?);

    let mut server = IpcServer::with_socket_path(&options.socket_path);
    server.start()?;
    info!("Control socket listening on {}", server.socket_path().display());

    let outcomes = registry.start_all().await;
    for outcome in &outcomes {
        match &outcome.error {
            None => info!("{} is {}", outcome.name, outcome.state),
            Some(e) => error!("{} failed to start: {}", outcome.name, e),
        }
    }
    on_started(&outcomes);

    let shutdown_requested = Arc::new(Notify::new());
    let stop_server = Arc::new(Notify::new());

    let server_task = {
        let registry = Arc::clone(&registry);
        let shutdown_requested = Arc::clone(&shutdown_requested);
        let stop_server = Arc::clone(&stop_server);
        tokio::spawn(async move {
            let result = server
                .run(
                    move |command| {
                        let registry = Arc::clone(&registry);
                        let shutdown_requested = Arc::clone(&shutdown_requested);
                        async move { handle_command(command, &registry, &shutdown_requested).await }
                    },
                    async move { stop_server.notified().await },
                )
                .await;
            if let Err(e) = result {
                error!("Control socket error: {}", e);
            }
            // Dropping the server removes the socket file
            drop(server);
        })
    };

    let cause = tokio::select! {
        name = signals.recv() => ExitCause::Signal(name),
        _ = shutdown_requested.notified() => ExitCause::ShutdownCommand,
    };

    match cause {
        ExitCause::Signal(name) => {
            info!("Received {}, stopping all apps", name);
            registry.shutdown().await;
        }
        ExitCause::ShutdownCommand => info!("Shutdown requested over the control socket"),
    }

    stop_server.notify_one();
    if let Err(e) = server_task.await {
        error!("Control socket task failed: {}", e);
    }

    info!("Supervisor stopped");
    Ok(cause)
}

/// Execute one control command against the registry
pub async fn handle_command(
    command: Command,
    registry: &SupervisorRegistry,
    shutdown_requested: &Notify,
) -> Result<ResponseData> {
    match command {
        Command::Start { name: None } => Ok(ResponseData::Outcomes(registry.start_all().await)),
        Command::Start { name: Some(name) } => {
            Ok(ResponseData::Outcomes(vec![registry.start(&name).await?]))
        }
        Command::Stop { name: None, force } => {
            Ok(ResponseData::Outcomes(registry.stop_all(!force).await))
        }
        Command::Stop {
            name: Some(name),
            force,
        } => Ok(ResponseData::Outcomes(vec![
            registry.stop(&name, !force).await?,
        ])),
        Command::Restart { name } => Ok(ResponseData::Outcomes(vec![registry.restart(&name).await?])),
        Command::Status => Ok(ResponseData::Status(registry.status())),
        Command::Shutdown => {
            let outcomes = registry.shutdown().await;
            shutdown_requested.notify_one();
            Ok(ResponseData::ShuttingDown(outcomes))
        }
    }
}

struct ShutdownSignals {
    sigterm: Signal,
    sigint: Signal,
}

impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}
