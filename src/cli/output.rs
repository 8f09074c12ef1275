// Output formatting and display for CLI

use crate::error::{CorralError, Result};
use crate::process::{AppOutcome, AppStatus, ProcessState};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print one line per app outcome
pub fn print_outcomes(outcomes: &[AppOutcome]) {
    for outcome in outcomes {
        match &outcome.error {
            None => println!(
                "{} {} {}",
                "✓".green().bold(),
                outcome.name.cyan(),
                format_state_colored(&outcome.state)
            ),
            Some(error) => eprintln!(
                "{} {} {}: {}",
                "✗".red().bold(),
                outcome.name.cyan(),
                format_state_colored(&outcome.state),
                error
            ),
        }
    }
}

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print the status snapshot as pretty JSON
pub fn print_status_json(apps: &[AppStatus]) -> Result<()> {
    let json = serde_json::to_string_pretty(apps)
        .map_err(|e| CorralError::SerializationError(e.to_string()))?;
    println!("{}", json);
    Ok(())
}

/// Print a formatted table of apps
pub fn print_status_table(apps: &[AppStatus]) {
    if apps.is_empty() {
        println!("{}", "No apps configured".yellow());
        return;
    }

    let rows: Vec<StatusRow> = apps.iter().map(StatusRow::from).collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);

    let alerts = apps.iter().filter(|a| a.alert.is_some()).count();
    let summary = format!("Total: {} app(s)", apps.len());
    if alerts > 0 {
        println!(
            "{} {}",
            summary.dimmed().italic(),
            format!("({} alert(s))", alerts).red().bold()
        );
    } else {
        println!("{}", summary.dimmed().italic());
    }
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "Uptime")]
    uptime: String,
    #[tabled(rename = "Restarts")]
    restarts: String,
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "Alert")]
    alert: String,
}

impl From<&AppStatus> for StatusRow {
    fn from(app: &AppStatus) -> Self {
        let mut alert = app.alert.as_deref().map(|a| truncate(a, 40)).unwrap_or_default();
        if app.dropped_log_lines > 0 {
            if !alert.is_empty() {
                alert.push_str("; ");
            }
            alert.push_str(&format!("{} log line(s) dropped", app.dropped_log_lines));
        }

        Self {
            name: truncate(&app.name, 20),
            state: format_state_colored(&app.state),
            pid: app
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            uptime: app
                .uptime()
                .map(|d| format_duration(&d))
                .unwrap_or_else(|| "-".to_string()),
            restarts: format!("{} / {}", app.restarts, app.total_restarts),
            memory: app
                .memory
                .map(format_memory)
                .unwrap_or_else(|| "-".to_string()),
            alert: if alert.is_empty() {
                "-".to_string()
            } else {
                alert.red().to_string()
            },
        }
    }
}

/// Format a process state with color coding
fn format_state_colored(state: &ProcessState) -> String {
    match state {
        ProcessState::Running => state.to_string().green().to_string(),
        ProcessState::Starting => state.to_string().yellow().to_string(),
        ProcessState::Stopping => state.to_string().yellow().to_string(),
        ProcessState::Stopped => state.to_string().bright_black().to_string(),
        ProcessState::NotStarted => state.to_string().bright_black().to_string(),
        ProcessState::Crashed => state.to_string().red().bold().to_string(),
    }
}

/// Format a duration in human-readable format
fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

/// Format memory usage in human-readable format
fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

/// Truncate a string to at most `max_len` characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Spinner shown while waiting on the supervisor
pub fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
