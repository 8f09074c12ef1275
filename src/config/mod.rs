// Ecosystem configuration: app descriptors plus supervisor-wide settings

pub mod units;

use crate::error::{CorralError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Signals accepted as `stop_signal`
pub const VALID_STOP_SIGNALS: [&str; 6] =
    ["SIGTERM", "SIGINT", "SIGQUIT", "SIGHUP", "SIGUSR1", "SIGUSR2"];

/// Immutable description of one supervised app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppDescriptor {
    /// App name (unique key)
    pub name: String,

    /// Executable to run, resolved through PATH when it has no separator
    pub script: PathBuf,

    /// Command-line arguments, as a list or a whitespace-separated string
    #[serde(default, deserialize_with = "deserialize_args")]
    pub args: Vec<String>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Environment variables set explicitly for this app
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Number of instances; only 1 is supported
    #[serde(default = "default_instances")]
    pub instances: usize,

    /// Execution mode; only "fork" is supported
    #[serde(default = "default_exec_mode")]
    pub exec_mode: String,

    /// Whether to restart automatically after a crash
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,

    /// Memory ceiling in bytes; exceeding it at a monitor tick counts as a crash
    #[serde(default, alias = "max_memory_restart", with = "units::opt_memory")]
    pub max_memory: Option<u64>,

    /// Restarts allowed within one crash-loop window
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,

    /// A run at least this long closes the crash-loop window
    #[serde(default = "default_min_uptime", with = "units::duration")]
    pub min_uptime: Duration,

    /// Fixed delay before each restart
    #[serde(default, with = "units::duration")]
    pub restart_delay: Duration,

    /// Initial delay for exponential restart backoff (overrides `restart_delay`)
    #[serde(default, with = "units::opt_duration")]
    pub exp_backoff_restart_delay: Option<Duration>,

    /// Signal sent for a graceful stop
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Grace period between the stop signal and SIGKILL
    #[serde(default = "default_kill_timeout", with = "units::duration")]
    pub kill_timeout: Duration,

    /// Maximum time between spawn and readiness
    #[serde(default = "default_listen_timeout", with = "units::duration")]
    pub listen_timeout: Duration,

    /// TCP port probed on 127.0.0.1 to confirm readiness
    #[serde(default)]
    pub ready_port: Option<u16>,

    /// Stdout log file (also receives stderr when `merge_logs` is set)
    #[serde(default)]
    pub out_file: Option<PathBuf>,

    /// Stderr log file
    #[serde(default)]
    pub error_file: Option<PathBuf>,

    /// Interleave stdout and stderr into `out_file`
    #[serde(default)]
    pub merge_logs: bool,

    /// Timestamp format for this app's log lines; overrides the global one
    #[serde(default)]
    pub log_date_format: Option<String>,

    /// Keys this supervisor does not understand (`watch`, for example)
    #[serde(flatten, default, skip_serializing)]
    pub ignored: BTreeMap<String, serde_json::Value>,
}

/// Destinations for one app's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub out: PathBuf,
    pub err: PathBuf,
}

// Default value functions for serde
fn default_instances() -> usize {
    1
}

fn default_exec_mode() -> String {
    "fork".to_string()
}

fn default_autorestart() -> bool {
    true
}

fn default_max_restarts() -> usize {
    16
}

fn default_min_uptime() -> Duration {
    Duration::from_secs(1)
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_kill_timeout() -> Duration {
    Duration::from_millis(1600)
}

fn default_listen_timeout() -> Duration {
    Duration::from_millis(3000)
}

fn deserialize_args<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Args {
        List(Vec<String>),
        Line(String),
    }

    Ok(match Args::deserialize(deserializer)? {
        Args::List(list) => list,
        Args::Line(line) => line.split_whitespace().map(str::to_string).collect(),
    })
}

impl AppDescriptor {
    /// Descriptor with default limits for the given executable
    pub fn new(name: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            instances: default_instances(),
            exec_mode: default_exec_mode(),
            autorestart: default_autorestart(),
            max_memory: None,
            max_restarts: default_max_restarts(),
            min_uptime: default_min_uptime(),
            restart_delay: Duration::ZERO,
            exp_backoff_restart_delay: None,
            stop_signal: default_stop_signal(),
            kill_timeout: default_kill_timeout(),
            listen_timeout: default_listen_timeout(),
            ready_port: None,
            out_file: None,
            error_file: None,
            merge_logs: false,
            log_date_format: None,
            ignored: BTreeMap::new(),
        }
    }

    /// Set arguments (builder style)
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Validate the descriptor
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CorralError::MissingConfigField("name".to_string()));
        }

        if self.script.as_os_str().is_empty() {
            return Err(CorralError::MissingConfigField(format!(
                "script (app '{}')",
                self.name
            )));
        }

        if self.instances != 1 {
            return Err(CorralError::ConfigValidationError(format!(
                "app '{}': only a single instance is supported, got {}",
                self.name, self.instances
            )));
        }

        if self.exec_mode != "fork" && self.exec_mode != "fork_mode" {
            return Err(CorralError::ConfigValidationError(format!(
                "app '{}': exec_mode must be 'fork', got '{}'",
                self.name, self.exec_mode
            )));
        }

        if self.max_restarts == 0 {
            return Err(CorralError::ConfigValidationError(format!(
                "app '{}': max_restarts must be at least 1",
                self.name
            )));
        }

        if !VALID_STOP_SIGNALS.contains(&self.stop_signal.as_str()) {
            return Err(CorralError::ConfigValidationError(format!(
                "app '{}': invalid stop_signal {}. Must be one of: {}",
                self.name,
                self.stop_signal,
                VALID_STOP_SIGNALS.join(", ")
            )));
        }

        if self.kill_timeout.is_zero() {
            return Err(CorralError::ConfigValidationError(format!(
                "app '{}': kill_timeout must be greater than zero",
                self.name
            )));
        }

        if self.max_memory == Some(0) {
            return Err(CorralError::ConfigValidationError(format!(
                "app '{}': max_memory must be greater than zero",
                self.name
            )));
        }

        if let Some(ref format) = self.log_date_format {
            units::parse_date_format(format).map_err(|e| {
                CorralError::ConfigValidationError(format!("app '{}': {}", self.name, e))
            })?;
        }

        Ok(())
    }

    /// strftime format for this app's log timestamps
    pub fn date_format(&self, settings: &GlobalSettings) -> String {
        let raw = self
            .log_date_format
            .as_deref()
            .unwrap_or(&settings.log_date_format);
        units::parse_date_format(raw).unwrap_or_else(|_| raw.to_string())
    }

    /// Resolve log destinations, falling back to `<log_dir>/<name>-{out,error}.log`
    pub fn log_paths(&self, settings: &GlobalSettings) -> LogPaths {
        LogPaths {
            out: self
                .out_file
                .clone()
                .unwrap_or_else(|| settings.log_dir.join(format!("{}-out.log", self.name))),
            err: self
                .error_file
                .clone()
                .unwrap_or_else(|| settings.log_dir.join(format!("{}-error.log", self.name))),
        }
    }

    fn expand_env_vars(&mut self) {
        self.script = expand_env_in_path(&self.script);
        if let Some(ref cwd) = self.cwd {
            self.cwd = Some(expand_env_in_path(cwd));
        }
        self.args = self.args.iter().map(|arg| expand_env_in_string(arg)).collect();
        self.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env_in_string(v)))
            .collect();
        if let Some(ref out) = self.out_file {
            self.out_file = Some(expand_env_in_path(out));
        }
        if let Some(ref err) = self.error_file {
            self.error_file = Some(expand_env_in_path(err));
        }
    }
}

/// Settings shared by every app in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Memory sampling cadence
    #[serde(default = "default_monitor_delay", with = "units::duration")]
    pub monitor_delay: Duration,

    /// Directory for app logs without explicit paths
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// File receiving the supervisor's own log output
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Log line timestamp format, strftime or moment.js style
    #[serde(default = "default_log_date_format")]
    pub log_date_format: String,

    /// Default environment; ambient variables take precedence
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_monitor_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp/corral_logs")
}

fn default_log_date_format() -> String {
    "%Y-%m-%d %H:%M:%S %z".to_string()
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            monitor_delay: default_monitor_delay(),
            log_dir: default_log_dir(),
            log_file: None,
            log_date_format: default_log_date_format(),
            env: HashMap::new(),
        }
    }
}

impl GlobalSettings {
    pub fn validate(&self) -> Result<()> {
        if self.monitor_delay.is_zero() {
            return Err(CorralError::ConfigValidationError(
                "monitor_delay must be greater than zero".to_string(),
            ));
        }
        units::parse_date_format(&self.log_date_format)
            .map_err(|e| CorralError::ConfigValidationError(e.to_string()))?;
        Ok(())
    }
}

/// A whole ecosystem file: global settings at the top level plus the app list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcosystemConfig {
    #[serde(flatten)]
    pub global: GlobalSettings,

    #[serde(default, alias = "processes")]
    pub apps: Vec<AppDescriptor>,

    /// Unrecognized top-level keys, such as a global `out_file`
    #[serde(flatten, default, skip_serializing)]
    pub ignored: BTreeMap<String, serde_json::Value>,
}

impl EcosystemConfig {
    /// Load an ecosystem file (TOML or JSON, chosen by extension)
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CorralError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(CorralError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        for app in &mut config.apps {
            app.expand_env_vars();
        }
        if let Some(ref log_file) = config.global.log_file {
            config.global.log_file = Some(expand_env_in_path(log_file));
        }
        config.global.log_dir = expand_env_in_path(&config.global.log_dir);

        config.validate()?;
        Ok(config)
    }

    fn parse_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| CorralError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    fn parse_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents)
            .map_err(|e| CorralError::InvalidConfig(format!("Failed to parse JSON: {}", e)))
    }

    /// Keys present in the file that have no effect, as `key` or `app.key`
    pub fn ignored_keys(&self) -> Vec<String> {
        let top = self.ignored.keys().cloned();
        let per_app = self.apps.iter().flat_map(|app| {
            app.ignored
                .keys()
                .map(move |key| format!("{}.{}", app.name, key))
        });
        top.chain(per_app).collect()
    }

    /// Validate global settings and every app. Name collisions are left to the registry.
    pub fn validate(&self) -> Result<()> {
        if self.apps.is_empty() {
            return Err(CorralError::InvalidConfig(
                "No apps defined in configuration".to_string(),
            ));
        }
        self.global.validate()?;
        for app in &self.apps {
            app.validate()?;
        }
        Ok(())
    }
}

/// Expand `$VAR` and `${VAR}` references from the ambient environment.
/// Unknown variables are left untouched.
fn expand_env_in_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match (name.is_empty(), std::env::var(name)) {
            (false, Ok(value)) => result.push_str(&value),
            _ => result.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }

    result.push_str(rest);
    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}
