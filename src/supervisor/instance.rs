use crate::supervisor::policy::FailureTracker;
use std::time::{Duration, Instant};

/// Stable identifier for one instance slot; assigned at startup and kept
/// across restarts of that slot.
pub type InstanceId = u32;

/// Lifecycle state of one worker instance.
///
/// `Starting -> Running -> {Restarting -> Starting, Stopping -> Stopped, Failed}`.
/// Failed is terminal; Stopping is entered only via shutdown or a
/// memory-exceeded forced restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceState {
    /// Whether the instance currently has (or is about to have) a live process
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            InstanceState::Starting | InstanceState::Running | InstanceState::Stopping
        )
    }

    /// Whether the instance can never run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Restarting => write!(f, "restarting"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Failed => write!(f, "failed"),
        }
    }
}

/// Runtime statistics for one instance
#[derive(Debug, Clone)]
pub struct InstanceStats {
    pub pid: u32,
    pub started_at: Instant,
    pub memory_usage: u64,
    pub last_restart: Option<Instant>,
    pub memory_violations: usize,
}

impl InstanceStats {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            started_at: Instant::now(),
            memory_usage: 0,
            last_restart: None,
            memory_violations: 0,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn record_restart(&mut self, new_pid: u32) {
        self.last_restart = Some(Instant::now());
        self.started_at = Instant::now();
        self.pid = new_pid;
        self.memory_usage = 0;
    }

    pub fn record_memory_violation(&mut self) {
        self.memory_violations += 1;
    }
}

/// One worker instance slot under supervision.
///
/// The child process handle itself is held by the supervisor's waiter
/// task; the slot keeps the pid for signalling.
#[derive(Debug)]
pub struct WorkerInstance {
    pub id: InstanceId,
    pub state: InstanceState,
    pub stats: InstanceStats,
    pub tracker: FailureTracker,
}

impl WorkerInstance {
    pub fn new(id: InstanceId, pid: u32) -> Self {
        Self {
            id,
            state: InstanceState::Starting,
            stats: InstanceStats::new(pid),
            tracker: FailureTracker::new(),
        }
    }

    pub fn mark_running(&mut self) {
        self.state = InstanceState::Running;
    }

    pub fn mark_restarting(&mut self) {
        self.state = InstanceState::Restarting;
    }

    pub fn mark_stopping(&mut self) {
        self.state = InstanceState::Stopping;
    }

    pub fn mark_stopped(&mut self) {
        self.state = InstanceState::Stopped;
    }

    pub fn mark_failed(&mut self) {
        self.state = InstanceState::Failed;
    }
}
