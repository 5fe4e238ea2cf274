use std::collections::HashMap;
use sysinfo::{Pid, ProcessRefreshKind, System};

/// Samples resident memory for supervised processes via the OS process
/// table. The supervisor calls this on a bounded interval from its
/// control loop.
pub struct MemoryMonitor {
    system: System,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Sample resident memory (bytes) for one pid. Returns `None` when
    /// the process is no longer in the process table.
    pub fn sample(&mut self, pid: u32) -> Option<u64> {
        let sys_pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        self.system.process(sys_pid).map(|p| p.memory())
    }

    /// Sample resident memory for a set of pids in one refresh pass.
    /// Pids that have disappeared are omitted from the result.
    pub fn sample_all(&mut self, pids: &[u32]) -> HashMap<u32, u64> {
        let sys_pids: Vec<Pid> = pids.iter().map(|&p| Pid::from_u32(p)).collect();
        self.system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&sys_pids),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        pids.iter()
            .filter_map(|&pid| {
                self.system
                    .process(Pid::from_u32(pid))
                    .map(|p| (pid, p.memory()))
            })
            .collect()
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_sample_live_process() {
        let mut monitor = MemoryMonitor::new();

        let mut child = Command::new("/bin/sleep")
            .arg("5")
            .spawn()
            .expect("Failed to spawn process");
        let pid = child.id().expect("Failed to get PID");

        let memory = monitor.sample(pid);
        assert!(memory.is_some());
        assert!(memory.unwrap() > 0);

        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_sample_dead_process_returns_none() {
        let mut monitor = MemoryMonitor::new();

        let mut child = Command::new("/bin/sleep")
            .arg("5")
            .spawn()
            .expect("Failed to spawn process");
        let pid = child.id().expect("Failed to get PID");

        child.kill().await.expect("Failed to kill process");
        let _ = child.wait().await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(monitor.sample(pid).is_none());
    }

    #[tokio::test]
    async fn test_sample_all_skips_missing() {
        let mut monitor = MemoryMonitor::new();

        let mut child = Command::new("/bin/sleep")
            .arg("5")
            .spawn()
            .expect("Failed to spawn process");
        let pid = child.id().expect("Failed to get PID");

        // Pid 0 is never a supervised process
        let samples = monitor.sample_all(&[pid, 0]);
        assert!(samples.contains_key(&pid));
        assert!(!samples.contains_key(&0));

        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}
