use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Deepest parent chain walked when attributing descendants to a process
const MAX_TREE_DEPTH: usize = 32;

/// Registry-wide sampling cadence.
///
/// Subscribers observe a counter that increments every `monitor_delay`. A slow
/// subscriber only ever sees the latest value, so missed ticks are skipped
/// rather than queued.
pub struct MonitorClock {
    ticks: watch::Receiver<u64>,
    task: JoinHandle<()>,
    period: Duration,
}

impl MonitorClock {
    /// Start ticking. Must be called from within a tokio runtime.
    pub fn start(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let (tx, rx) = watch::channel(0u64);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                tx.send_modify(|n| *n = n.wrapping_add(1));
            }
        });

        Self {
            ticks: rx,
            task,
            period,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.ticks.clone()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stop ticking; subscribers see the channel close
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for MonitorClock {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Memory sampler backed by sysinfo
pub struct MemorySampler {
    system: System,
}

impl MemorySampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Resident memory in bytes of `pid` plus all of its descendants.
    /// `None` if the process is no longer visible to the OS.
    pub fn sample_tree(&mut self, pid: u32) -> Option<u64> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        let root = Pid::from_u32(pid);
        let mut total = self.system.process(root)?.memory();

        for (candidate, process) in self.system.processes() {
            if *candidate != root && self.descends_from(process.parent(), root) {
                total = total.saturating_add(process.memory());
            }
        }

        Some(total)
    }

    fn descends_from(&self, mut parent: Option<Pid>, root: Pid) -> bool {
        for _ in 0..MAX_TREE_DEPTH {
            match parent {
                Some(p) if p == root => return true,
                Some(p) => parent = self.system.process(p).and_then(|proc_| proc_.parent()),
                None => return false,
            }
        }
        false
    }
}

impl std::fmt::Debug for MemorySampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MemorySampler")
    }
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self::new()
    }
}
