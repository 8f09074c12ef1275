// Integration tests for supervising several apps through the registry

use corral::config::{AppDescriptor, GlobalSettings};
use corral::process::{ExitReason, ProcessState, SupervisorRegistry};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::Instant;

fn settings(dir: &TempDir) -> GlobalSettings {
    GlobalSettings {
        log_dir: dir.path().to_path_buf(),
        monitor_delay: Duration::from_millis(100),
        ..GlobalSettings::default()
    }
}

fn sh(name: &str, script: &str) -> AppDescriptor {
    let mut app = AppDescriptor::new(name, "/bin/sh").with_args(["-c", script]);
    app.kill_timeout = Duration::from_millis(500);
    app
}

/// For every new PID the app publishes, record whether the previous
/// process was already gone at that point
fn track_replacements(registry: &SupervisorRegistry, name: &str) -> JoinHandle<Vec<bool>> {
    let mut status = registry.get(name).unwrap().subscribe();
    tokio::spawn(async move {
        let mut previous: Option<u32> = None;
        let mut checks = Vec::new();
        loop {
            let pid = status.borrow_and_update().pid;
            if let Some(pid) = pid {
                if let Some(old) = previous.filter(|old| *old != pid) {
                    checks.push(kill(Pid::from_raw(old as i32), None) == Err(Errno::ESRCH));
                }
                previous = Some(pid);
            }
            if status.changed().await.is_err() {
                break;
            }
        }
        checks
    })
}

#[tokio::test]
async fn test_at_most_one_live_process_per_app() {
    let temp_dir = TempDir::new().unwrap();

    let mut crashing = sh("crashing", "exec sleep 0.3");
    crashing.min_uptime = Duration::from_millis(100);
    let mut hungry = sh("hungry", "exec sleep 30");
    hungry.max_memory = Some(1);
    hungry.max_restarts = 50;

    let registry = SupervisorRegistry::new(
        vec![sh("restarted", "exec sleep 30"), crashing, hungry],
        &settings(&temp_dir),
    )
    .unwrap();
    let trackers: Vec<_> = ["restarted", "crashing", "hungry"]
        .into_iter()
        .map(|name| track_replacements(&registry, name))
        .collect();

    registry.start_all().await;
    for _ in 0..2 {
        assert!(registry.restart("restarted").await.unwrap().is_ok());
    }
    for name in ["crashing", "hungry"] {
        registry
            .get(name)
            .unwrap()
            .wait_until(Duration::from_secs(20), "two restarts", |s| s.total_restarts >= 2)
            .await
            .unwrap();
    }
    registry.shutdown().await;

    for tracker in trackers {
        let checks = tracker.await.unwrap();
        assert!(checks.len() >= 2, "only {} replacements seen", checks.len());
        assert!(checks.iter().all(|gone| *gone), "overlapping processes: {:?}", checks);
    }
}

#[tokio::test]
async fn test_per_app_date_format() {
    let temp_dir = TempDir::new().unwrap();
    let mut settings = settings(&temp_dir);
    settings.log_date_format = "[global]".to_string();

    let mut stamped = sh("stamped", "echo hello; exec sleep 30");
    stamped.log_date_format = Some("YYYY".to_string());
    let plain = sh("plain", "echo hello; exec sleep 30");

    let registry = SupervisorRegistry::new(vec![stamped, plain], &settings).unwrap();
    registry.start_all().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    registry.shutdown().await;

    let year = chrono::Local::now().format("%Y").to_string();
    let stamped = fs::read_to_string(temp_dir.path().join("stamped-out.log")).unwrap();
    let plain = fs::read_to_string(temp_dir.path().join("plain-out.log")).unwrap();
    assert!(stamped.contains(&format!("[{}] hello\n", year)), "log was:\n{}", stamped);
    assert!(plain.contains("[global] hello\n"), "log was:\n{}", plain);
}

#[tokio::test]
async fn test_crash_loop_is_isolated() {
    let temp_dir = TempDir::new().unwrap();
    let mut crasher = sh("crasher", "exit 3");
    crasher.max_restarts = 2;
    crasher.min_uptime = Duration::from_secs(10);

    let registry =
        SupervisorRegistry::new(vec![crasher, sh("steady", "exec sleep 30")], &settings(&temp_dir))
            .unwrap();
    registry.start_all().await;

    let status = registry
        .wait_for_state("crasher", ProcessState::Stopped, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status.total_restarts, 2);
    assert!(status
        .alert
        .as_deref()
        .unwrap()
        .contains("restart budget exhausted"));
    assert_eq!(
        status.last_exit,
        Some(ExitReason::Exited {
            code: Some(3),
            signal: None
        })
    );

    let steady = registry.get("steady").unwrap().status();
    assert_eq!(steady.state, ProcessState::Running);
    assert_eq!(steady.total_restarts, 0);
    assert!(steady.alert.is_none());

    registry.shutdown().await;
}

#[tokio::test]
async fn test_restart_after_give_up() {
    let temp_dir = TempDir::new().unwrap();
    let mut app = sh("recovering", "exit 1");
    app.max_restarts = 1;
    let registry = SupervisorRegistry::new(vec![app], &settings(&temp_dir)).unwrap();

    registry.start_all().await;
    let status = registry
        .wait_for_state("recovering", ProcessState::Stopped, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(status.alert.is_some());

    registry.restart("recovering").await.unwrap();
    let status = registry
        .get("recovering")
        .unwrap()
        .wait_until(Duration::from_secs(10), "second give-up", |s| {
            s.state == ProcessState::Stopped && s.total_restarts == 2
        })
        .await
        .unwrap();
    assert_eq!(status.restarts, 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_merged_logs_keep_arrival_order() {
    let temp_dir = TempDir::new().unwrap();
    let mut app = sh(
        "merged",
        "echo first; sleep 0.2; echo second >&2; sleep 0.2; echo third; exec sleep 30",
    );
    app.merge_logs = true;
    app.out_file = Some(temp_dir.path().join("merged.log"));
    app.error_file = Some(temp_dir.path().join("merged-error.log"));

    let registry = SupervisorRegistry::new(vec![app], &settings(&temp_dir)).unwrap();
    registry.start_all().await;
    tokio::time::sleep(Duration::from_millis(800)).await;
    registry.shutdown().await;

    let log = fs::read_to_string(temp_dir.path().join("merged.log")).unwrap();
    let first = log.find("] first\n").unwrap();
    let second = log.find("] second\n").unwrap();
    let third = log.find("] third\n").unwrap();
    assert!(first < second && second < third, "log was:\n{}", log);

    let err_log = fs::read_to_string(temp_dir.path().join("merged-error.log")).unwrap_or_default();
    assert!(!err_log.contains("second"));
}

#[tokio::test]
async fn test_split_logs_and_timestamps() {
    let temp_dir = TempDir::new().unwrap();
    let app = sh("split", "echo to-out; echo to-err >&2; exec sleep 30");
    let mut settings = settings(&temp_dir);
    settings.log_date_format = "%Y".to_string();

    let registry = SupervisorRegistry::new(vec![app], &settings).unwrap();
    registry.start_all().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    registry.shutdown().await;

    let year = chrono::Local::now().format("%Y").to_string();
    let out = fs::read_to_string(temp_dir.path().join("split-out.log")).unwrap();
    let err = fs::read_to_string(temp_dir.path().join("split-error.log")).unwrap();
    assert!(out.contains(&format!("[{}] to-out\n", year)));
    assert!(!out.contains("to-err"));
    assert_eq!(err, format!("[{}] to-err\n", year));
}

#[tokio::test]
async fn test_environment_precedence() {
    std::env::set_var("CORRAL_IT_AMBIENT", "ambient");
    std::env::set_var("CORRAL_IT_OVERRIDE", "ambient");

    let temp_dir = TempDir::new().unwrap();
    let mut settings = settings(&temp_dir);
    settings.env = HashMap::from([
        ("CORRAL_IT_AMBIENT".to_string(), "default".to_string()),
        ("CORRAL_IT_DEFAULT".to_string(), "default".to_string()),
    ]);

    let mut app = sh(
        "env",
        "echo \"$CORRAL_IT_AMBIENT $CORRAL_IT_DEFAULT $CORRAL_IT_OVERRIDE\"; exec sleep 30",
    );
    app.env
        .insert("CORRAL_IT_OVERRIDE".to_string(), "app".to_string());

    let registry = SupervisorRegistry::new(vec![app], &settings).unwrap();
    registry.start_all().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    registry.shutdown().await;

    let out = fs::read_to_string(temp_dir.path().join("env-out.log")).unwrap();
    assert!(out.contains("] ambient default app\n"), "log was:\n{}", out);
}

#[tokio::test]
async fn test_graceful_stop_runs_app_handler() {
    let temp_dir = TempDir::new().unwrap();
    let app = sh(
        "polite",
        "trap 'echo goodbye; exit 0' TERM; while true; do sleep 0.1; done",
    );
    let registry = SupervisorRegistry::new(vec![app], &settings(&temp_dir)).unwrap();
    registry.start_all().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = registry.stop("polite", true).await.unwrap();
    assert!(outcome.is_ok());
    assert_eq!(outcome.state, ProcessState::Stopped);

    let out = fs::read_to_string(temp_dir.path().join("polite-out.log")).unwrap();
    assert!(out.contains("] goodbye\n"));
    assert!(out.contains("exited gracefully"));
    registry.shutdown().await;
}

#[tokio::test]
async fn test_force_stop_skips_grace_period() {
    let temp_dir = TempDir::new().unwrap();
    let mut app = sh("stubborn", "trap '' TERM; while true; do sleep 0.1; done");
    app.kill_timeout = Duration::from_secs(20);
    let registry = SupervisorRegistry::new(vec![app], &settings(&temp_dir)).unwrap();
    registry.start_all().await;

    let started = Instant::now();
    let outcome = registry.stop("stubborn", false).await.unwrap();
    assert!(outcome.is_ok());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        registry.states()["stubborn"],
        ProcessState::Stopped
    );
    registry.shutdown().await;
}

#[tokio::test]
async fn test_stop_then_start_again() {
    let temp_dir = TempDir::new().unwrap();
    let registry =
        SupervisorRegistry::new(vec![sh("cycle", "exec sleep 30")], &settings(&temp_dir)).unwrap();

    registry.start_all().await;
    let first_pid = registry.get("cycle").unwrap().status().pid;
    assert!(first_pid.is_some());

    registry.stop("cycle", true).await.unwrap();
    assert!(registry.get("cycle").unwrap().status().pid.is_none());

    let outcome = registry.start("cycle").await.unwrap();
    assert!(outcome.is_ok());
    let status = registry.get("cycle").unwrap().status();
    assert_eq!(status.state, ProcessState::Running);
    assert_ne!(status.pid, first_pid);
    assert_eq!(status.total_restarts, 0);

    registry.shutdown().await;
}
