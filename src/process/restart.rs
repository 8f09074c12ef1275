use crate::config::AppDescriptor;
use crate::process::types::ExitReason;
use std::time::{Duration, SystemTime};

/// Upper bound for exponential restart backoff
const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(15);

/// Minimum number of history entries kept per app
const MIN_RETAINED_ENTRIES: usize = 64;

/// Crash-loop limits for one app
#[derive(Debug, Clone, PartialEq)]
pub struct RestartLimits {
    /// Whether automatic restart is enabled
    pub enabled: bool,
    /// Restarts allowed within one window
    pub max_restarts: usize,
    /// A run at least this long closes the window
    pub min_uptime: Duration,
    /// Delay strategy between restarts
    pub backoff: BackoffStrategy,
}

impl RestartLimits {
    pub fn new(max_restarts: usize, min_uptime: Duration) -> Self {
        Self {
            enabled: true,
            max_restarts,
            min_uptime,
            backoff: BackoffStrategy::Fixed {
                delay: Duration::ZERO,
            },
        }
    }

    pub fn from_descriptor(descriptor: &AppDescriptor) -> Self {
        let backoff = match descriptor.exp_backoff_restart_delay {
            Some(initial) => BackoffStrategy::Exponential {
                initial,
                max: MAX_BACKOFF_DELAY,
            },
            None => BackoffStrategy::Fixed {
                delay: descriptor.restart_delay,
            },
        };

        Self {
            enabled: descriptor.autorestart,
            max_restarts: descriptor.max_restarts,
            min_uptime: descriptor.min_uptime,
            backoff,
        }
    }
}

/// Backoff strategy for restart delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between restarts
    Fixed { delay: Duration },
    /// Exponential backoff with maximum delay
    Exponential { initial: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Delay before the next restart, given the restarts already consumed in the window
    pub fn calculate_delay(&self, restarts_consumed: usize) -> Duration {
        match *self {
            BackoffStrategy::Fixed { delay } => delay,
            BackoffStrategy::Exponential { initial, max } => {
                // initial * 2^restarts_consumed
                let factor = 2_u32.saturating_pow(restarts_consumed.min(31) as u32);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// One crash (or crash-equivalent event) of an app
#[derive(Debug, Clone, PartialEq)]
pub struct RestartEntry {
    pub at: SystemTime,
    pub reason: ExitReason,
    /// How long the run lasted before it ended
    pub uptime: Duration,
    /// Whether the run was confirmed ready before it ended
    pub ready: bool,
}

impl RestartEntry {
    /// Crash of a run that had reached `Running`
    pub fn now(reason: ExitReason, uptime: Duration) -> Self {
        Self {
            at: SystemTime::now(),
            reason,
            uptime,
            ready: true,
        }
    }

    /// Crash before readiness was confirmed: spawn failure, ready timeout,
    /// or an exit while still starting
    pub fn before_ready(reason: ExitReason, uptime: Duration) -> Self {
        Self {
            ready: false,
            ..Self::now(reason, uptime)
        }
    }

    /// A healthy run: ready and up for at least `min_uptime`
    pub fn closes_window(&self, min_uptime: Duration) -> bool {
        self.ready && self.uptime >= min_uptime
    }
}

/// Ordered crash history for one app
#[derive(Debug, Clone)]
pub struct RestartRecord {
    entries: Vec<RestartEntry>,
    /// Index of the first entry after the last manual reset
    window_start: usize,
    retain: usize,
}

impl RestartRecord {
    /// History sized so a full window always fits
    pub fn for_limits(limits: &RestartLimits) -> Self {
        Self {
            entries: Vec::new(),
            window_start: 0,
            retain: (limits.max_restarts + 1).max(MIN_RETAINED_ENTRIES),
        }
    }

    /// Append a crash entry, dropping the oldest beyond the retention bound
    pub fn record(&mut self, entry: RestartEntry) {
        self.entries.push(entry);
        if self.entries.len() > self.retain {
            let excess = self.entries.len() - self.retain;
            self.entries.drain(..excess);
            self.window_start = self.window_start.saturating_sub(excess);
        }
    }

    /// Start a fresh window (manual restart). Earlier entries stay in history.
    pub fn reset_window(&mut self) {
        self.window_start = self.entries.len();
    }

    /// Entries in the current unresolved window: after the last reset, starting
    /// at the most recent ready run that lasted at least `min_uptime`
    pub fn window(&self, min_uptime: Duration) -> &[RestartEntry] {
        let since_reset = &self.entries[self.window_start..];
        match since_reset.iter().rposition(|e| e.closes_window(min_uptime)) {
            Some(idx) => &since_reset[idx..],
            None => since_reset,
        }
    }

    /// Restarts already consumed in the window, not counting the latest crash
    pub fn restarts_consumed(&self, min_uptime: Duration) -> usize {
        self.window(min_uptime).len().saturating_sub(1)
    }

    pub fn entries(&self) -> &[RestartEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&RestartEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of the restart decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Restart { delay: Duration },
    GiveUp,
}

/// Decide whether the latest crash in `history` earns another restart.
///
/// Crashes are counted within the current window. A run that lasted at least
/// `min_uptime` resets the window so only its own crash counts.
pub fn decide(history: &RestartRecord, limits: &RestartLimits) -> Decision {
    if !limits.enabled {
        return Decision::GiveUp;
    }

    let consumed = history.restarts_consumed(limits.min_uptime);
    if consumed < limits.max_restarts {
        Decision::Restart {
            delay: limits.backoff.calculate_delay(consumed),
        }
    } else {
        Decision::GiveUp
    }
}
