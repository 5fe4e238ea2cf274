// Supervisor module - core instance lifecycle management

mod instance;
mod monitor;
mod policy;
mod spawner;

pub use instance::{InstanceId, InstanceState, InstanceStats, WorkerInstance};
pub use monitor::MemoryMonitor;
pub use policy::{FailureTracker, RestartDecision, RestartPolicy};
pub use spawner::{spawn_instance, SpawnedInstance};

use crate::config::SupervisorConfig;
use crate::error::{Result, VigilError};
use crate::logs::{pump_stream, LogSink, LogStream};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often instance memory is sampled
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Events delivered to the supervisor's control loop
#[derive(Debug)]
enum InstanceEvent {
    /// A child process exited (waiter task reaped it)
    Exited {
        id: InstanceId,
        code: Option<i32>,
    },
    /// The restart delay for an instance has elapsed
    RestartDue { id: InstanceId },
}

/// Clonable handle used to request a graceful shutdown from outside the
/// control loop (typically a signal handler). Requesting twice has no
/// additional effect.
#[derive(Clone)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Process supervisor: launches and keeps alive N worker instances of the
/// managed script, enforcing the restart policy and memory ceiling.
///
/// All per-instance state is mutated only by the control loop (single
/// writer); worker instances are independently scheduled OS processes.
pub struct Supervisor {
    config: SupervisorConfig,
    production: bool,
    policy: RestartPolicy,
    instances: HashMap<InstanceId, WorkerInstance>,
    sink: Arc<LogSink>,
    memory: MemoryMonitor,
    events_tx: mpsc::UnboundedSender<InstanceEvent>,
    events_rx: mpsc::UnboundedReceiver<InstanceEvent>,
    shutdown_notify: Arc<Notify>,
    shutdown_requested: Arc<AtomicBool>,
    shutting_down: bool,
}

impl Supervisor {
    /// Start the supervisor: resolve the instance count and spawn every
    /// instance. Any spawn failure at this stage is fatal.
    pub async fn start(config: SupervisorConfig, production: bool) -> Result<Self> {
        config.validate()?;
        let policy = RestartPolicy::from_config(&config)?;
        let count = config.resolved_instances();

        let sink = LogSink::open(&config.out_file, &config.error_file, &config.log_file).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut supervisor = Self {
            config,
            production,
            policy,
            instances: HashMap::new(),
            sink,
            memory: MemoryMonitor::new(),
            events_tx,
            events_rx,
            shutdown_notify: Arc::new(Notify::new()),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            shutting_down: false,
        };

        info!(
            "Starting {} instance(s) of '{}' ({} mode)",
            count,
            supervisor.config.name,
            match supervisor.config.exec_mode {
                crate::config::ExecMode::Fork => "fork",
                crate::config::ExecMode::Cluster => "cluster",
            }
        );

        for id in 0..count as InstanceId {
            let pid = supervisor.launch(id).await?;
            let mut instance = WorkerInstance::new(id, pid);
            instance.mark_running();
            info!("Instance {} started (pid {})", id, pid);
            supervisor.instances.insert(id, instance);
        }

        Ok(supervisor)
    }

    /// Get a handle for requesting shutdown from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            notify: Arc::clone(&self.shutdown_notify),
            requested: Arc::clone(&self.shutdown_requested),
        }
    }

    /// Run the supervision loop.
    ///
    /// Wakes on whichever comes first across all instances: a child exit,
    /// an elapsed restart delay, the periodic memory sample, or a
    /// shutdown request. Returns once every instance has reached a
    /// terminal state: `Ok` after a shutdown, or
    /// [`VigilError::AllInstancesFailed`] when every instance exhausted
    /// its restart budget.
    pub async fn run(&mut self) -> Result<()> {
        let shutdown_notify = Arc::clone(&self.shutdown_notify);
        let mut sample = interval(MEMORY_SAMPLE_INTERVAL);
        sample.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.instances.values().all(|i| i.state.is_terminal()) {
                if self.instances.values().all(|i| i.state == InstanceState::Failed) {
                    error!("All instances have exhausted their restart budget");
                    return Err(VigilError::AllInstancesFailed);
                }
                info!("Supervisor finished");
                return Ok(());
            }

            tokio::select! {
                _ = shutdown_notify.notified(), if !self.shutting_down => {
                    let grace = self.config.shutdown_grace();
                    self.shutdown(grace).await?;
                }
                maybe_event = self.events_rx.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_event(event).await?,
                        None => return Ok(()),
                    }
                }
                _ = sample.tick(), if !self.shutting_down => {
                    self.sample_memory().await?;
                }
            }
        }
    }

    /// Request cooperative termination of every live instance, wait up to
    /// `grace` for them to exit, then force-kill whatever is left.
    /// Idempotent: a second call has no additional effect.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        if self.shutting_down {
            debug!("Shutdown already in progress");
            return Ok(());
        }
        self.shutting_down = true;
        self.shutdown_requested.store(true, Ordering::SeqCst);

        let stop_signal = parse_signal(&self.config.stop_signal)?;

        let mut pending: Vec<(InstanceId, u32)> = Vec::new();
        for instance in self.instances.values_mut() {
            match instance.state {
                InstanceState::Running | InstanceState::Starting | InstanceState::Stopping => {
                    instance.mark_stopping();
                    pending.push((instance.id, instance.stats.pid));
                }
                // nothing to signal for a slot waiting on its restart delay
                InstanceState::Restarting => instance.mark_stopped(),
                InstanceState::Stopped | InstanceState::Failed => {}
            }
        }

        info!(
            "Shutting down: sending {} to {} instance(s), grace {:?}",
            self.config.stop_signal,
            pending.len(),
            grace
        );

        for &(id, pid) in &pending {
            if let Err(e) = send_signal(pid, stop_signal) {
                debug!("Failed to signal instance {}: {}", id, e);
            }
        }

        // Cooperative phase: collect exits until the grace deadline
        let deadline = Instant::now() + grace;
        while self.live_count() > 0 {
            match timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(InstanceEvent::Exited { id, .. })) => {
                    if let Some(instance) = self.instances.get_mut(&id) {
                        if instance.state.is_live() {
                            debug!("Instance {} exited cooperatively", id);
                            instance.mark_stopped();
                        }
                    }
                }
                Ok(Some(InstanceEvent::RestartDue { .. })) => continue,
                Ok(None) => break,
                Err(_) => break, // grace elapsed
            }
        }

        // Forced phase: kill stragglers and reap them
        let stragglers: Vec<(InstanceId, u32)> = self
            .instances
            .values()
            .filter(|i| i.state.is_live())
            .map(|i| (i.id, i.stats.pid))
            .collect();

        if !stragglers.is_empty() {
            for &(id, pid) in &stragglers {
                warn!("{}; force-killing pid {}", VigilError::ShutdownTimeout(id), pid);
                if let Err(e) = send_signal(pid, Signal::SIGKILL) {
                    debug!("Failed to kill instance {}: {}", id, e);
                }
            }

            let reap_deadline = Instant::now() + self.config.reap_timeout();
            while self.live_count() > 0 {
                match timeout_at(reap_deadline, self.events_rx.recv()).await {
                    Ok(Some(InstanceEvent::Exited { id, .. })) => {
                        if let Some(instance) = self.instances.get_mut(&id) {
                            if instance.state.is_live() {
                                instance.mark_stopped();
                            }
                        }
                    }
                    Ok(Some(InstanceEvent::RestartDue { .. })) => continue,
                    Ok(None) | Err(_) => break,
                }
            }

            // SIGKILL cannot be ignored; the slots are done either way
            for (id, _) in stragglers {
                if let Some(instance) = self.instances.get_mut(&id) {
                    if instance.state.is_live() {
                        instance.mark_stopped();
                    }
                }
            }
        }

        info!("All instances stopped");
        Ok(())
    }

    /// Number of instances holding a live process
    pub fn live_count(&self) -> usize {
        self.instances
            .values()
            .filter(|i| i.state.is_live())
            .count()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn instance_state(&self, id: InstanceId) -> Option<InstanceState> {
        self.instances.get(&id).map(|i| i.state)
    }

    pub fn instances(&self) -> impl Iterator<Item = &WorkerInstance> {
        self.instances.values()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Spawn the child for one instance slot and wire up its log pumps
    /// and exit waiter.
    async fn launch(&mut self, id: InstanceId) -> Result<u32> {
        let spawned = spawn_instance(&self.config, id, self.production).await?;
        let pid = spawned.pid;
        let mut child = spawned.child;

        if let Some(stdout) = child.stdout.take() {
            pump_stream(Arc::clone(&self.sink), LogStream::Out, id, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            pump_stream(Arc::clone(&self.sink), LogStream::Err, id, stderr);
        }

        // The waiter owns the child handle; the slot keeps only the pid
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    debug!("Wait failed for instance {}: {}", id, e);
                    None
                }
            };
            let _ = tx.send(InstanceEvent::Exited { id, code });
        });

        Ok(pid)
    }

    async fn handle_event(&mut self, event: InstanceEvent) -> Result<()> {
        match event {
            InstanceEvent::Exited { id, code } => self.handle_exit(id, code).await,
            InstanceEvent::RestartDue { id } => self.handle_restart_due(id).await,
        }
    }

    /// Apply the restart policy to an instance exit
    async fn handle_exit(&mut self, id: InstanceId, code: Option<i32>) -> Result<()> {
        let state = match self.instances.get(&id) {
            Some(instance) => instance.state,
            None => return Ok(()),
        };

        if self.shutting_down {
            if let Some(instance) = self.instances.get_mut(&id) {
                if instance.state.is_live() {
                    instance.mark_stopped();
                }
            }
            return Ok(());
        }

        match state {
            // Exit of a force-killed instance: restart without delay
            InstanceState::Stopping => {
                let decision = match self.instances.get_mut(&id) {
                    Some(instance) => self.policy.decide_memory_exceeded(&mut instance.tracker),
                    None => return Ok(()),
                };
                self.apply_decision(id, decision);
                Ok(())
            }
            InstanceState::Running | InstanceState::Starting => {
                let decision = match self.instances.get_mut(&id) {
                    Some(instance) => {
                        let uptime = instance.stats.uptime();
                        info!(
                            "Instance {} exited with code {:?} after {:?} \
                             (consecutive failures: {})",
                            id,
                            code,
                            uptime,
                            instance.tracker.consecutive_failures()
                        );
                        self.policy.decide_exit(uptime, &mut instance.tracker)
                    }
                    None => return Ok(()),
                };
                self.apply_decision(id, decision);
                Ok(())
            }
            _ => {
                debug!("Ignoring exit event for instance {} in state {}", id, state);
                Ok(())
            }
        }
    }

    fn apply_decision(&mut self, id: InstanceId, decision: RestartDecision) {
        match decision {
            RestartDecision::Restart { delay } => {
                if delay.is_zero() {
                    info!("Restarting instance {} immediately", id);
                } else {
                    info!("Restarting instance {} in {:?}", id, delay);
                }
                self.schedule_restart(id, delay);
            }
            RestartDecision::Retire => {
                warn!(
                    "{}; retiring after {} restart(s)",
                    VigilError::RestartBudgetExhausted(id),
                    self.policy.max_restarts
                );
                if let Some(instance) = self.instances.get_mut(&id) {
                    instance.mark_failed();
                }
            }
        }
    }

    /// Move the slot to Restarting and deliver a RestartDue event once
    /// the delay has elapsed.
    fn schedule_restart(&mut self, id: InstanceId, delay: Duration) {
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.mark_restarting();
        }
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send(InstanceEvent::RestartDue { id });
        });
    }

    async fn handle_restart_due(&mut self, id: InstanceId) -> Result<()> {
        if self.shutting_down {
            return Ok(());
        }
        match self.instances.get(&id) {
            Some(instance) if instance.state == InstanceState::Restarting => {}
            _ => return Ok(()),
        }

        if let Err(e) = self.relaunch(id).await {
            error!("Failed to relaunch instance {}: {}", id, e);

            // A failed spawn consumes budget like an immediate crash
            let decision = match self.instances.get_mut(&id) {
                Some(instance) => self
                    .policy
                    .decide_exit(Duration::ZERO, &mut instance.tracker),
                None => return Ok(()),
            };
            self.apply_decision(id, decision);
        }
        Ok(())
    }

    /// Relaunch the child for an instance slot after a restart decision
    async fn relaunch(&mut self, id: InstanceId) -> Result<()> {
        let pid = self.launch(id).await?;

        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(VigilError::InstanceNotFound(id))?;
        instance.stats.record_restart(pid);
        instance.tracker.record_restart();
        instance.mark_running();

        info!(
            "Instance {} relaunched (pid {}, restart #{})",
            id,
            pid,
            instance.tracker.total_restarts()
        );
        Ok(())
    }

    /// Sample memory for every running instance and force-restart any
    /// that breach the ceiling.
    async fn sample_memory(&mut self) -> Result<()> {
        let running: Vec<(InstanceId, u32)> = self
            .instances
            .values()
            .filter(|i| i.state == InstanceState::Running)
            .map(|i| (i.id, i.stats.pid))
            .collect();
        if running.is_empty() {
            return Ok(());
        }

        let pids: Vec<u32> = running.iter().map(|&(_, pid)| pid).collect();
        let samples = self.memory.sample_all(&pids);

        let mut exceeded = Vec::new();
        for (id, pid) in running {
            if let Some(&usage) = samples.get(&pid) {
                if let Some(instance) = self.instances.get_mut(&id) {
                    instance.stats.memory_usage = usage;
                }
                if self.policy.memory_exceeded(usage) {
                    exceeded.push((id, usage));
                }
            }
        }

        for (id, usage) in exceeded {
            warn!(
                "Instance {} exceeded memory ceiling ({} > {:?} bytes)",
                id, usage, self.policy.max_memory
            );
            self.on_memory_exceeded(id)?;
        }
        Ok(())
    }

    /// Force-terminate an instance that breached the memory ceiling.
    ///
    /// Bypasses the grace window: fast recovery beats graceful cleanup
    /// once memory is exhausted. The restart happens when the exit event
    /// arrives, without the normal delay, and consumes one restart from
    /// the budget.
    fn on_memory_exceeded(&mut self, id: InstanceId) -> Result<()> {
        let pid = match self.instances.get_mut(&id) {
            Some(instance) if instance.state == InstanceState::Running => {
                instance.stats.record_memory_violation();
                instance.mark_stopping();
                instance.stats.pid
            }
            _ => return Ok(()),
        };

        send_signal(pid, Signal::SIGKILL)
    }
}

fn parse_signal(signal_name: &str) -> Result<Signal> {
    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(VigilError::SignalError(format!(
            "Invalid signal name: {}",
            signal_name
        ))),
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    signal::kill(Pid::from_raw(pid as i32), signal).map_err(|e| {
        VigilError::SignalError(format!("Failed to send {} to pid {}: {}", signal, pid, e))
    })
}
