// End-to-end tests for the foreground supervisor driven over its control socket

use corral::config::{AppDescriptor, EcosystemConfig, GlobalSettings};
use corral::daemon::{self, ExitCause, PidFile, RunOptions};
use corral::ipc::{Command, IpcClient, ResponseData};
use corral::process::{AppOutcome, ProcessState};
use corral::CorralError;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

fn config(dir: &TempDir) -> EcosystemConfig {
    let sleeper = |name: &str| {
        let mut app = AppDescriptor::new(name, "/bin/sh").with_args(["-c", "exec sleep 30"]);
        app.kill_timeout = Duration::from_millis(500);
        app
    };
    EcosystemConfig {
        global: GlobalSettings {
            log_dir: dir.path().join("logs"),
            monitor_delay: Duration::from_millis(200),
            ..GlobalSettings::default()
        },
        apps: vec![sleeper("web"), sleeper("worker")],
        ignored: Default::default(),
    }
}

fn options(dir: &TempDir) -> RunOptions {
    RunOptions {
        socket_path: dir.path().join("corral.sock"),
        pid_file: dir.path().join("corral.pid"),
    }
}

async fn send(socket_path: &Path, command: Command) -> corral::Result<ResponseData> {
    let client = IpcClient::with_socket_path(socket_path);
    tokio::task::spawn_blocking(move || client.send_command(command))
        .await
        .unwrap()
}

fn outcomes(data: ResponseData) -> Vec<AppOutcome> {
    match data {
        ResponseData::Outcomes(outcomes) | ResponseData::ShuttingDown(outcomes) => outcomes,
        other => panic!("unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_control_session() {
    let temp_dir = TempDir::new().unwrap();
    let options = options(&temp_dir);
    let socket_path = options.socket_path.clone();
    let pid_path = options.pid_file.clone();

    let (started_tx, started_rx) = oneshot::channel();
    let supervisor = tokio::spawn(daemon::run(config(&temp_dir), options, move |outcomes| {
        let _ = started_tx.send(outcomes.to_vec());
    }));

    let started = started_rx.await.unwrap();
    assert_eq!(started.len(), 2);
    assert!(started.iter().all(|o| o.is_ok()));
    assert_eq!(
        PidFile::with_path(&pid_path).read().unwrap(),
        std::process::id()
    );

    // Status lists apps in configuration order
    match send(&socket_path, Command::Status).await.unwrap() {
        ResponseData::Status(apps) => {
            let names: Vec<&str> = apps.iter().map(|a| a.name.as_str()).collect();
            assert_eq!(names, vec!["web", "worker"]);
            assert!(apps.iter().all(|a| a.state == ProcessState::Running));
        }
        other => panic!("unexpected response: {:?}", other),
    }

    let stopped = outcomes(
        send(
            &socket_path,
            Command::Stop {
                name: Some("worker".to_string()),
                force: false,
            },
        )
        .await
        .unwrap(),
    );
    assert_eq!(stopped[0].state, ProcessState::Stopped);

    let restarted = outcomes(
        send(
            &socket_path,
            Command::Start {
                name: Some("worker".to_string()),
            },
        )
        .await
        .unwrap(),
    );
    assert_eq!(restarted[0].state, ProcessState::Running);

    let unknown = send(
        &socket_path,
        Command::Restart {
            name: "ghost".to_string(),
        },
    )
    .await;
    assert!(matches!(unknown, Err(CorralError::IpcError(_))));

    let final_outcomes = outcomes(send(&socket_path, Command::Shutdown).await.unwrap());
    assert!(final_outcomes
        .iter()
        .all(|o| o.is_ok() && o.state == ProcessState::Stopped));

    let cause = tokio::time::timeout(Duration::from_secs(10), supervisor)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(cause, ExitCause::ShutdownCommand);
    assert!(!socket_path.exists());
    assert!(!pid_path.exists());
}

#[tokio::test]
async fn test_second_supervisor_refused() {
    let temp_dir = TempDir::new().unwrap();
    let options = options(&temp_dir);

    // init is always alive and is never this test process
    std::fs::write(&options.pid_file, "1").unwrap();

    let result = daemon::run(config(&temp_dir), options.clone(), |_| {}).await;
    assert!(matches!(result, Err(CorralError::DaemonAlreadyRunning(1))));
    assert!(options.pid_file.exists());
    assert!(!options.socket_path.exists());
}

#[tokio::test]
async fn test_stale_pid_file_taken_over() {
    let temp_dir = TempDir::new().unwrap();
    let options = options(&temp_dir);
    let socket_path = options.socket_path.clone();

    // Above any pid_max, so never alive
    std::fs::write(&options.pid_file, "999999999").unwrap();

    let (started_tx, started_rx) = oneshot::channel();
    let supervisor = tokio::spawn(daemon::run(config(&temp_dir), options, move |_| {
        let _ = started_tx.send(());
    }));
    started_rx.await.unwrap();

    send(&socket_path, Command::Shutdown).await.unwrap();
    let cause = tokio::time::timeout(Duration::from_secs(10), supervisor)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(cause, ExitCause::ShutdownCommand);
}
