use crate::config::{AppDescriptor, GlobalSettings};
use crate::error::{CorralError, Result};
use crate::process::handle::Termination;
use crate::process::monitor::MonitorClock;
use crate::process::supervisor::SupervisorHandle;
use crate::process::types::{AppOutcome, AppStatus, ProcessState};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// The set of supervised apps.
///
/// Control operations are serialized; status reads go straight to each
/// app's published snapshot and never wait on a control operation.
pub struct SupervisorRegistry {
    /// In configuration order
    apps: Vec<SupervisorHandle>,
    index: HashMap<String, usize>,
    clock: MonitorClock,
    control: Mutex<()>,
}

impl SupervisorRegistry {
    /// Build one supervisor per descriptor. Nothing is spawned unless every
    /// descriptor is valid and every name is unique.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(descriptors: Vec<AppDescriptor>, settings: &GlobalSettings) -> Result<Self> {
        settings.validate()?;

        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            descriptor.validate()?;
            if !seen.insert(descriptor.name.as_str()) {
                return Err(CorralError::DuplicateName(descriptor.name.clone()));
            }
        }

        let clock = MonitorClock::start(settings.monitor_delay);
        let mut apps = Vec::with_capacity(descriptors.len());
        let mut index = HashMap::with_capacity(descriptors.len());

        for (position, descriptor) in descriptors.into_iter().enumerate() {
            index.insert(descriptor.name.clone(), position);
            apps.push(SupervisorHandle::spawn(descriptor, settings, clock.subscribe()));
        }

        info!(
            "Registry created with {} app(s), monitor every {:?}",
            apps.len(),
            clock.period()
        );

        Ok(Self {
            apps,
            index,
            clock,
            control: Mutex::new(()),
        })
    }

    /// Start every app and wait for each to settle in `Running` or `Stopped`
    pub async fn start_all(&self) -> Vec<AppOutcome> {
        let _guard = self.control.lock().await;

        let mut acked = Vec::with_capacity(self.apps.len());
        for app in &self.apps {
            acked.push(app.start().await);
        }

        let mut outcomes = Vec::with_capacity(self.apps.len());
        for (app, ack) in self.apps.iter().zip(acked) {
            outcomes.push(match ack {
                Ok(()) => settle_start(app).await,
                Err(e) => AppOutcome::failed(app.name(), app.status().state, e.to_string()),
            });
        }
        outcomes
    }

    pub async fn start(&self, name: &str) -> Result<AppOutcome> {
        let app = self.get(name)?;
        let _guard = self.control.lock().await;
        app.start().await?;
        Ok(settle_start(app).await)
    }

    /// Stop every app concurrently. Returns once all are `Stopped`, bounded by
    /// the largest `kill_timeout`.
    pub async fn stop_all(&self, graceful: bool) -> Vec<AppOutcome> {
        let _guard = self.control.lock().await;
        self.stop_all_locked(graceful).await
    }

    async fn stop_all_locked(&self, graceful: bool) -> Vec<AppOutcome> {
        let mut pending = Vec::with_capacity(self.apps.len());
        for app in &self.apps {
            pending.push(app.request_stop(graceful).await);
        }

        let mut outcomes = Vec::with_capacity(self.apps.len());
        for (app, ack) in self.apps.iter().zip(pending) {
            let result = match ack {
                Ok(ack) => app.await_stop(ack).await,
                Err(e) => Err(e),
            };
            outcomes.push(stop_outcome(app, result));
        }
        outcomes
    }

    pub async fn stop(&self, name: &str, graceful: bool) -> Result<AppOutcome> {
        let app = self.get(name)?;
        let _guard = self.control.lock().await;
        let result = app.stop(graceful).await;
        Ok(stop_outcome(app, result))
    }

    /// Stop (if live) and start again, resetting this app's crash window only
    pub async fn restart(&self, name: &str) -> Result<AppOutcome> {
        let app = self.get(name)?;
        let _guard = self.control.lock().await;
        info!("Restarting {}", name);
        app.restart().await?;
        Ok(settle_start(app).await)
    }

    /// Snapshot of every app in configuration order
    pub fn status(&self) -> Vec<AppStatus> {
        self.apps.iter().map(|app| app.status()).collect()
    }

    pub fn states(&self) -> HashMap<String, ProcessState> {
        self.apps
            .iter()
            .map(|app| (app.name().to_string(), app.status().state))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.apps.iter().map(|app| app.name())
    }

    pub fn get(&self, name: &str) -> Result<&SupervisorHandle> {
        self.index
            .get(name)
            .map(|&position| &self.apps[position])
            .ok_or_else(|| CorralError::AppNotFound(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Wait until `name` reaches `state`
    pub async fn wait_for_state(
        &self,
        name: &str,
        state: ProcessState,
        timeout: Duration,
    ) -> Result<AppStatus> {
        self.get(name)?
            .wait_until(timeout, &state.to_string(), |s| s.state == state)
            .await
    }

    /// Gracefully stop everything, then tear down the app tasks and the
    /// monitor clock. Later control requests fail with `SupervisorGone`.
    pub async fn shutdown(&self) -> Vec<AppOutcome> {
        let _guard = self.control.lock().await;
        info!("Shutting down {} app(s)", self.apps.len());
        let outcomes = self.stop_all_locked(true).await;

        self.clock.shutdown();
        for app in &self.apps {
            app.abort();
        }

        outcomes
    }
}

async fn settle_start(app: &SupervisorHandle) -> AppOutcome {
    let settled = app
        .wait_until(app.settle_timeout(), "running", |s| {
            matches!(s.state, ProcessState::Running | ProcessState::Stopped)
        })
        .await;

    match settled {
        Ok(status) if status.state == ProcessState::Running => {
            AppOutcome::ok(app.name(), status.state)
        }
        Ok(status) => {
            let reason = status
                .alert
                .clone()
                .or_else(|| status.last_exit.as_ref().map(|r| r.to_string()))
                .unwrap_or_else(|| "stopped".to_string());
            AppOutcome::failed(app.name(), status.state, reason)
        }
        Err(e) => {
            warn!("{}", e);
            AppOutcome::failed(app.name(), app.status().state, e.to_string())
        }
    }
}

fn stop_outcome(app: &SupervisorHandle, result: Result<Termination>) -> AppOutcome {
    let state = app.status().state;
    match result {
        Ok(_) => AppOutcome::ok(app.name(), state),
        Err(e) => AppOutcome::failed(app.name(), state, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::Instant;

    fn settings(dir: &TempDir) -> GlobalSettings {
        GlobalSettings {
            log_dir: dir.path().to_path_buf(),
            monitor_delay: Duration::from_millis(100),
            ..GlobalSettings::default()
        }
    }

    fn sh(name: &str, script: &str) -> AppDescriptor {
        AppDescriptor::new(name, "/bin/sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let result = SupervisorRegistry::new(
            vec![sh("web", "sleep 1"), sh("worker", "sleep 1"), sh("web", "sleep 1")],
            &settings(&temp_dir),
        );
        assert!(matches!(result, Err(CorralError::DuplicateName(name)) if name == "web"));
    }

    #[tokio::test]
    async fn test_invalid_descriptor_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut bad = sh("bad", "sleep 1");
        bad.max_restarts = 0;
        let result = SupervisorRegistry::new(vec![sh("ok", "sleep 1"), bad], &settings(&temp_dir));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_all_and_status_order() {
        let temp_dir = TempDir::new().unwrap();
        let registry = SupervisorRegistry::new(
            vec![sh("b", "exec sleep 30"), sh("a", "exec sleep 30")],
            &settings(&temp_dir),
        )
        .unwrap();

        assert!(registry
            .states()
            .values()
            .all(|s| *s == ProcessState::NotStarted));

        let outcomes = registry.start_all().await;
        assert!(outcomes.iter().all(|o| o.is_ok()));

        let names: Vec<String> = registry.status().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(registry.states()["a"], ProcessState::Running);

        let outcomes = registry.shutdown().await;
        assert!(outcomes.iter().all(|o| o.state == ProcessState::Stopped));
    }

    #[tokio::test]
    async fn test_unknown_app() {
        let temp_dir = TempDir::new().unwrap();
        let registry =
            SupervisorRegistry::new(vec![sh("only", "exec sleep 30")], &settings(&temp_dir)).unwrap();

        assert!(matches!(
            registry.start("missing").await,
            Err(CorralError::AppNotFound(_))
        ));
        assert!(matches!(
            registry.stop("missing", true).await,
            Err(CorralError::AppNotFound(_))
        ));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_all_bounded_by_largest_kill_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let stubborn = |name: &str, kill_ms: u64| {
            let mut app = sh(name, "trap '' TERM; while true; do sleep 0.1; done");
            app.kill_timeout = Duration::from_millis(kill_ms);
            app
        };
        let registry = SupervisorRegistry::new(
            vec![stubborn("one", 500), stubborn("two", 1000), stubborn("three", 800)],
            &settings(&temp_dir),
        )
        .unwrap();
        registry.start_all().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let outcomes = registry.stop_all(true).await;
        let elapsed = started.elapsed();

        assert!(outcomes.iter().all(|o| o.is_ok()));
        assert!(elapsed >= Duration::from_millis(1000));
        // Sequential stops would take at least 2.3s
        assert!(elapsed < Duration::from_millis(2200), "took {:?}", elapsed);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_reports_outcome() {
        let temp_dir = TempDir::new().unwrap();
        let mut app = sh("broken", "exit 1");
        app.autorestart = false;
        let mut missing = AppDescriptor::new("missing", "/nonexistent/bin");
        missing.autorestart = false;
        let registry = SupervisorRegistry::new(vec![app, missing], &settings(&temp_dir)).unwrap();

        let outcome = registry.start("missing").await.unwrap();
        assert!(!outcome.is_ok());
        assert_eq!(outcome.state, ProcessState::Stopped);

        // The other app is unaffected
        assert_eq!(registry.states()["broken"], ProcessState::NotStarted);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_all_before_start_reports_stopped() {
        let temp_dir = TempDir::new().unwrap();
        let registry = SupervisorRegistry::new(
            vec![sh("web", "exec sleep 30"), sh("worker", "exec sleep 30")],
            &settings(&temp_dir),
        )
        .unwrap();

        let outcomes = registry.stop_all(true).await;
        assert!(outcomes
            .iter()
            .all(|o| o.is_ok() && o.state == ProcessState::Stopped));
        assert!(registry
            .states()
            .values()
            .all(|s| *s == ProcessState::Stopped));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_single_app() {
        let temp_dir = TempDir::new().unwrap();
        let registry = SupervisorRegistry::new(
            vec![sh("web", "exec sleep 30"), sh("worker", "exec sleep 30")],
            &settings(&temp_dir),
        )
        .unwrap();
        registry.start_all().await;

        let web_pid = registry.get("web").unwrap().status().pid;
        let worker_pid = registry.get("worker").unwrap().status().pid;

        let outcome = registry.restart("web").await.unwrap();
        assert!(outcome.is_ok());
        assert_ne!(registry.get("web").unwrap().status().pid, web_pid);
        assert_eq!(registry.get("worker").unwrap().status().pid, worker_pid);

        registry.shutdown().await;
    }
}
