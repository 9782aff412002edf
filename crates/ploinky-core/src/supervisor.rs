//! Generic process/container watchdog
//!
//! One supervisor instance watches both the router child process and the
//! set of monitored containers. Per entry it applies exponential backoff
//! between restarts, a sliding-window circuit breaker, and an optional
//! pluggable health check. Typed [`SupervisorEvent`]s on a bounded
//! channel are the only integration surface.

use crate::{CoreError, Result, SupervisorEvent};
use futures::future::BoxFuture;
use ploinky_provider::ContainerRuntime;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const BACKOFF_MULTIPLIER: u32 = 2;
pub const CIRCUIT_THRESHOLD: usize = 5;
pub const CIRCUIT_WINDOW: Duration = Duration::from_secs(60);
pub const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(60);
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
pub const HEALTH_THRESHOLD: u32 = 3;
/// Grace between SIGTERM and SIGKILL on stop.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Pluggable health predicate; true means healthy.
pub type HealthCheck = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Exponential backoff between restart attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: INITIAL_BACKOFF,
            max: MAX_BACKOFF,
            multiplier: BACKOFF_MULTIPLIER,
        }
    }
}

impl BackoffPolicy {
    /// Delay before restart attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Sliding-window circuit breaker.
#[derive(Debug, Clone, Copy)]
pub struct CircuitPolicy {
    /// Failures within `window` that open the circuit
    pub threshold: usize,
    pub window: Duration,
    /// How long the circuit refuses restarts once open
    pub cooldown: Duration,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            threshold: CIRCUIT_THRESHOLD,
            window: CIRCUIT_WINDOW,
            cooldown: CIRCUIT_COOLDOWN,
        }
    }
}

/// Health probing policy for one entry.
#[derive(Clone)]
pub struct HealthPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub threshold: u32,
    pub check: HealthCheck,
}

impl HealthPolicy {
    pub fn new(check: HealthCheck) -> Self {
        Self {
            interval: HEALTH_INTERVAL,
            timeout: HEALTH_TIMEOUT,
            threshold: HEALTH_THRESHOLD,
            check,
        }
    }
}

impl std::fmt::Debug for HealthPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthPolicy")
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("threshold", &self.threshold)
            .finish()
    }
}

/// What the supervisor is in charge of: a child process it spawns, or a
/// container whose exits are reported by the monitor.
#[derive(Debug, Clone)]
pub enum Charge {
    Process {
        command: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
        env: HashMap<String, String>,
    },
    Container {
        container: String,
    },
}

/// Per-entry supervision configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub name: String,
    pub charge: Charge,
    pub auto_restart: bool,
    /// -1 means unbounded; a non-negative value transitions to Failed
    /// terminally once exhausted
    pub max_restarts: i64,
    pub backoff: BackoffPolicy,
    pub circuit: CircuitPolicy,
    pub health: Option<HealthPolicy>,
}

impl WatchConfig {
    pub fn process(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            charge: Charge::Process {
                command: command.into(),
                args,
                cwd: None,
                env: HashMap::new(),
            },
            auto_restart: true,
            max_restarts: -1,
            backoff: BackoffPolicy::default(),
            circuit: CircuitPolicy::default(),
            health: None,
        }
    }

    pub fn container(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            charge: Charge::Container {
                container: name.clone(),
            },
            name,
            auto_restart: true,
            max_restarts: -1,
            backoff: BackoffPolicy::default(),
            circuit: CircuitPolicy::default(),
            health: None,
        }
    }
}

/// Entry lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
    CircuitOpen,
}

/// Snapshot returned by [`Supervisor::status`].
#[derive(Debug, Clone)]
pub struct WatchStatus {
    pub name: String,
    pub state: WatchState,
    pub pid: Option<u32>,
    pub start_count: u32,
    pub restart_count: u32,
    pub health_failures: u32,
    pub circuit_open: bool,
    pub last_error: Option<String>,
}

struct Entry {
    config: WatchConfig,
    state: WatchState,
    pid: Option<u32>,
    start_count: u32,
    restart_count: u32,
    backoff_attempt: u32,
    health_failures: u32,
    last_error: Option<String>,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    manual_stop: bool,
    /// Bumped on every start; guards stale waiter and kill tasks
    epoch: u64,
    health_cancel: Option<CancellationToken>,
}

impl Entry {
    fn new(config: WatchConfig) -> Self {
        Self {
            config,
            state: WatchState::Stopped,
            pid: None,
            start_count: 0,
            restart_count: 0,
            backoff_attempt: 0,
            health_failures: 0,
            last_error: None,
            failures: VecDeque::new(),
            opened_at: None,
            manual_stop: false,
            epoch: 0,
            health_cancel: None,
        }
    }

    fn snapshot(&self) -> WatchStatus {
        WatchStatus {
            name: self.config.name.clone(),
            state: self.state,
            pid: self.pid,
            start_count: self.start_count,
            restart_count: self.restart_count,
            health_failures: self.health_failures,
            circuit_open: self.state == WatchState::CircuitOpen,
            last_error: self.last_error.clone(),
        }
    }
}

enum ExitOutcome {
    Ignore,
    Stopped,
    Circuit,
    Failed,
    Restart { delay: Duration, attempt: u32 },
}

/// Generic watchdog over processes and containers.
pub struct Supervisor {
    entries: Mutex<HashMap<String, Entry>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    pub fn new(runtime: Option<Arc<dyn ContainerRuntime>>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            runtime,
            events,
        })
    }

    /// Subscribe to supervisor events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }

    /// Register an entry; returns false if the name is taken.
    pub async fn register(&self, config: WatchConfig) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&config.name) {
            return false;
        }
        entries.insert(config.name.clone(), Entry::new(config));
        true
    }

    /// Whether an entry with this name exists.
    pub async fn is_registered(&self, name: &str) -> bool {
        self.entries.lock().await.contains_key(name)
    }

    /// Remove an entry without stopping it.
    pub async fn unregister(&self, name: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(mut entry) = entries.remove(name) {
            if let Some(cancel) = entry.health_cancel.take() {
                cancel.cancel();
            }
        }
    }

    /// Start an entry. Returns false when the start is refused (already
    /// running, or the circuit is open and cooldown has not elapsed).
    pub fn start<'a>(self: &'a Arc<Self>, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
        let (charge, health, epoch) = {
            let mut entries = self.entries.lock().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| CoreError::InvalidState(format!("unknown entry: {name}")))?;

            match entry.state {
                WatchState::Running | WatchState::Starting | WatchState::Stopping => {
                    return Ok(false)
                }
                WatchState::CircuitOpen => {
                    let opened = entry.opened_at.unwrap_or_else(Instant::now);
                    if opened.elapsed() < entry.config.circuit.cooldown {
                        return Ok(false);
                    }
                    entry.state = WatchState::Stopped;
                    entry.failures.clear();
                    entry.opened_at = None;
                    self.emit(SupervisorEvent::CircuitReset {
                        name: name.to_string(),
                    });
                }
                WatchState::Stopped | WatchState::Failed => {}
            }

            entry.state = WatchState::Starting;
            entry.manual_stop = false;
            entry.epoch += 1;
            (
                entry.config.charge.clone(),
                entry.config.health.clone(),
                entry.epoch,
            )
        };
        eprintln!("DEBUG start() entered match for {name}, epoch={epoch}");

        match charge {
            Charge::Process {
                command,
                args,
                cwd,
                env,
            } => {
                let mut cmd = tokio::process::Command::new(&command);
                cmd.args(&args).envs(&env).stdin(std::process::Stdio::null());
                if let Some(cwd) = cwd {
                    cmd.current_dir(cwd);
                }

                let mut child = match cmd.spawn() {
                    Ok(child) => child,
                    Err(e) => {
                        let message = e.to_string();
                        let mut entries = self.entries.lock().await;
                        if let Some(entry) = entries.get_mut(name) {
                            entry.state = WatchState::Failed;
                            entry.last_error = Some(message.clone());
                        }
                        self.emit(SupervisorEvent::Error {
                            name: name.to_string(),
                            message,
                        });
                        return Err(CoreError::Io(e));
                    }
                };

                let pid = child.id();
                {
                    let mut entries = self.entries.lock().await;
                    if let Some(entry) = entries.get_mut(name) {
                        entry.state = WatchState::Running;
                        entry.pid = pid;
                        entry.start_count += 1;
                    }
                }
                self.emit(SupervisorEvent::Started {
                    name: name.to_string(),
                    pid,
                });

                let sup = Arc::clone(self);
                let entry_name = name.to_string();
                tokio::spawn(async move {
                    let exit_code = match child.wait().await {
                        Ok(status) => status.code().map(|c| c as i64),
                        Err(_) => None,
                    };
                    sup.on_charge_exit(&entry_name, exit_code, Some(epoch)).await;
                });
            }
            Charge::Container { container } => {
                let runtime = self.runtime.clone().ok_or_else(|| {
                    CoreError::InvalidState("no container runtime attached".to_string())
                })?;

                if let Err(e) = runtime.start(&container).await {
                    let message = e.to_string();
                    let mut entries = self.entries.lock().await;
                    if let Some(entry) = entries.get_mut(name) {
                        entry.state = WatchState::Stopped;
                        entry.last_error = Some(message.clone());
                    }
                    self.emit(SupervisorEvent::Error {
                        name: name.to_string(),
                        message,
                    });
                    return Err(e.into());
                }

                {
                    let mut entries = self.entries.lock().await;
                    if let Some(entry) = entries.get_mut(name) {
                        entry.state = WatchState::Running;
                        entry.start_count += 1;
                    }
                }
                eprintln!("DEBUG emit Started(container)");
                self.emit(SupervisorEvent::Started {
                    name: name.to_string(),
                    pid: None,
                });
            }
        }

        if let Some(policy) = health {
            self.spawn_health_loop(name, epoch, policy).await;
        }

        Ok(true)
        })
    }

    /// Stop an entry. Disables auto-restart until the next `start`.
    pub async fn stop(self: &Arc<Self>, name: &str) -> Result<()> {
        let (charge, pid, epoch) = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(name) else {
                return Ok(());
            };
            if entry.state != WatchState::Running && entry.state != WatchState::Starting {
                return Ok(());
            }
            entry.state = WatchState::Stopping;
            entry.manual_stop = true;
            if let Some(cancel) = entry.health_cancel.take() {
                cancel.cancel();
            }
            (entry.config.charge.clone(), entry.pid, entry.epoch)
        };

        match charge {
            Charge::Process { .. } => {
                if let Some(pid) = pid {
                    send_signal(pid, nix::sys::signal::Signal::SIGTERM);
                }
                // escalate to SIGKILL if the waiter has not seen an exit
                let sup = Arc::clone(self);
                let entry_name = name.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(STOP_GRACE).await;
                    let entries = sup.entries.lock().await;
                    if let Some(entry) = entries.get(&entry_name) {
                        if entry.epoch == epoch && entry.state == WatchState::Stopping {
                            if let Some(pid) = entry.pid {
                                send_signal(pid, nix::sys::signal::Signal::SIGKILL);
                            }
                        }
                    }
                });
            }
            Charge::Container { container } => {
                let runtime = self.runtime.clone().ok_or_else(|| {
                    CoreError::InvalidState("no container runtime attached".to_string())
                })?;
                runtime
                    .stop(&container, Some(STOP_GRACE.as_secs() as u32))
                    .await?;

                let mut entries = self.entries.lock().await;
                if let Some(entry) = entries.get_mut(name) {
                    if entry.state == WatchState::Stopping {
                        entry.state = WatchState::Stopped;
                        entry.pid = None;
                        self.emit(SupervisorEvent::Stopped {
                            name: name.to_string(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Stop then start, waiting for the exit to land in between.
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<bool> {
        self.emit(SupervisorEvent::Restarting {
            name: name.to_string(),
            delay: Duration::ZERO,
            attempt: 0,
        });
        self.stop(name).await?;

        // wait for the waiter task to mark the entry stopped
        let deadline = Instant::now() + STOP_GRACE + Duration::from_secs(2);
        loop {
            {
                let entries = self.entries.lock().await;
                match entries.get(name) {
                    Some(entry) if entry.state == WatchState::Stopping => {}
                    _ => break,
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.start(name).await
    }

    /// Health-status cascade from the monitor. Idempotent under
    /// duplicate delivery: a restart already in flight absorbs it.
    pub async fn note_unhealthy(self: &Arc<Self>, name: &str) {
        let running = {
            let entries = self.entries.lock().await;
            entries
                .get(name)
                .map(|e| e.state == WatchState::Running)
                .unwrap_or(false)
        };
        if running {
            if let Err(e) = self.restart(name).await {
                tracing::warn!("restart after unhealthy status failed for {name}: {e}");
            }
        }
    }

    /// An exit observed by the monitor (containers) or a waiter task
    /// (processes).
    pub async fn handle_exit(self: &Arc<Self>, name: &str, exit_code: Option<i64>) {
        eprintln!("DEBUG handle_exit called for {name}");
        self.on_charge_exit(name, exit_code, None).await;
        eprintln!("DEBUG handle_exit finished for {name}");
    }

    /// Force-close the circuit, allowing an immediate retry.
    pub async fn reset_circuit(&self, name: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(name) {
            if entry.state == WatchState::CircuitOpen {
                entry.state = WatchState::Stopped;
            }
            entry.failures.clear();
            entry.opened_at = None;
            self.emit(SupervisorEvent::CircuitReset {
                name: name.to_string(),
            });
        }
    }

    /// Status snapshot of one entry or all entries.
    pub async fn status(&self, name: Option<&str>) -> Vec<WatchStatus> {
        let entries = self.entries.lock().await;
        match name {
            Some(name) => entries.get(name).map(|e| e.snapshot()).into_iter().collect(),
            None => {
                let mut all: Vec<_> = entries.values().map(|e| e.snapshot()).collect();
                all.sort_by(|a, b| a.name.cmp(&b.name));
                all
            }
        }
    }

    /// Disable auto-restart everywhere and stop every entry.
    pub async fn shutdown(self: &Arc<Self>) {
        let names: Vec<String> = {
            let mut entries = self.entries.lock().await;
            for entry in entries.values_mut() {
                entry.config.auto_restart = false;
            }
            entries.keys().cloned().collect()
        };

        for name in names {
            if let Err(e) = self.stop(&name).await {
                tracing::warn!("failed to stop {name} during shutdown: {e}");
            }
        }
    }

    async fn spawn_health_loop(self: &Arc<Self>, name: &str, epoch: u64, policy: HealthPolicy) {
        let cancel = CancellationToken::new();
        {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(name) else {
                return;
            };
            if entry.epoch != epoch {
                return;
            }
            if let Some(previous) = entry.health_cancel.replace(cancel.clone()) {
                previous.cancel();
            }
        }

        let sup = Arc::clone(self);
        let entry_name = name.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(policy.interval) => {}
                }

                let healthy = tokio::time::timeout(policy.timeout, (policy.check)())
                    .await
                    .unwrap_or(false);

                if healthy {
                    let mut entries = sup.entries.lock().await;
                    if let Some(entry) = entries.get_mut(&entry_name) {
                        entry.health_failures = 0;
                        // success resets restart counting but not the
                        // circuit window
                        entry.restart_count = 0;
                        entry.backoff_attempt = 0;
                    }
                    drop(entries);
                    sup.emit(SupervisorEvent::HealthOk {
                        name: entry_name.clone(),
                    });
                    continue;
                }

                let failures = {
                    let mut entries = sup.entries.lock().await;
                    match entries.get_mut(&entry_name) {
                        Some(entry) => {
                            entry.health_failures += 1;
                            entry.health_failures
                        }
                        None => return,
                    }
                };
                sup.emit(SupervisorEvent::HealthFailed {
                    name: entry_name.clone(),
                    failures,
                });

                if failures >= policy.threshold {
                    {
                        let mut entries = sup.entries.lock().await;
                        if let Some(entry) = entries.get_mut(&entry_name) {
                            entry.health_failures = 0;
                        }
                    }
                    if let Err(e) = sup.restart(&entry_name).await {
                        tracing::warn!("health-driven restart of {entry_name} failed: {e}");
                    }
                    return;
                }
            }
        });
    }

    async fn on_charge_exit(self: &Arc<Self>, name: &str, exit_code: Option<i64>, epoch: Option<u64>) {
        let outcome = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(name) else {
                return;
            };
            if let Some(epoch) = epoch {
                if entry.epoch != epoch {
                    return;
                }
            }

            match entry.state {
                WatchState::Stopping => {
                    entry.state = WatchState::Stopped;
                    entry.pid = None;
                    ExitOutcome::Stopped
                }
                WatchState::Running | WatchState::Starting => {
                    entry.state = WatchState::Stopped;
                    entry.pid = None;
                    if let Some(cancel) = entry.health_cancel.take() {
                        cancel.cancel();
                    }
                    eprintln!("DEBUG emit Exited");
                    self.emit(SupervisorEvent::Exited {
                        name: name.to_string(),
                        exit_code,
                    });

                    let now = Instant::now();
                    entry.failures.push_back(now);
                    let window = entry.config.circuit.window;
                    while entry
                        .failures
                        .front()
                        .map(|t| now.duration_since(*t) > window)
                        .unwrap_or(false)
                    {
                        entry.failures.pop_front();
                    }

                    if entry.failures.len() >= entry.config.circuit.threshold {
                        entry.state = WatchState::CircuitOpen;
                        entry.opened_at = Some(now);
                        ExitOutcome::Circuit
                    } else if !entry.config.auto_restart || entry.manual_stop {
                        ExitOutcome::Ignore
                    } else if entry.config.max_restarts >= 0
                        && i64::from(entry.restart_count) >= entry.config.max_restarts
                    {
                        entry.state = WatchState::Failed;
                        ExitOutcome::Failed
                    } else {
                        let delay = entry.config.backoff.delay(entry.backoff_attempt);
                        entry.backoff_attempt += 1;
                        entry.restart_count += 1;
                        ExitOutcome::Restart {
                            delay,
                            attempt: entry.restart_count,
                        }
                    }
                }
                // duplicate delivery after the state already settled
                _ => ExitOutcome::Ignore,
            }
        };

        match outcome {
            ExitOutcome::Ignore => {}
            ExitOutcome::Stopped => self.emit(SupervisorEvent::Stopped {
                name: name.to_string(),
            }),
            ExitOutcome::Circuit => { eprintln!("DEBUG emit CircuitOpen"); self.emit(SupervisorEvent::CircuitOpen {
                name: name.to_string(),
            }) },
            ExitOutcome::Failed => self.emit(SupervisorEvent::MaxRestarts {
                name: name.to_string(),
            }),
            ExitOutcome::Restart { delay, attempt } => {
                self.emit(SupervisorEvent::Restarting {
                    name: name.to_string(),
                    delay,
                    attempt,
                });
                let sup = Arc::clone(self);
                let entry_name = name.to_string();
                tokio::spawn(async move {
                    eprintln!("DEBUG scheduled restart task sleeping {delay:?} for {entry_name}");
                    tokio::time::sleep(delay).await;
                    eprintln!("DEBUG scheduled restart task calling start for {entry_name}");
                    if let Err(e) = sup.start(&entry_name).await {
                        tracing::warn!("scheduled restart of {entry_name} failed: {e}");
                    }
                    eprintln!("DEBUG scheduled restart task finished start for {entry_name}");
                });
            }
        }
    }
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    if let Err(e) = nix::sys::signal::kill(pid, signal) {
        tracing::debug!("signal {signal} to {pid} failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRuntime;

    fn fast_container_config(name: &str, threshold: usize) -> WatchConfig {
        let mut config = WatchConfig::container(name);
        config.backoff = BackoffPolicy {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
            multiplier: 2,
        };
        config.circuit = CircuitPolicy {
            threshold,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
        };
        config
    }

    async fn wait_for_event(
        rx: &mut broadcast::Receiver<SupervisorEvent>,
        want: impl Fn(&SupervisorEvent) -> bool,
    ) -> SupervisorEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[test]
    fn test_backoff_delays() {
        let backoff = BackoffPolicy::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(16));
        assert_eq!(backoff.delay(5), Duration::from_secs(30));
        assert_eq!(backoff.delay(30), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold_failures() {
        let runtime = MockRuntime::shared();
        runtime.add_container("c1", true).await;
        let sup = Supervisor::new(Some(runtime.dyn_clone()));
        let mut rx = sup.subscribe();

        sup.register(fast_container_config("c1", 3)).await;
        sup.start("c1").await.unwrap();

        // threshold unexpected exits in a tight window
        sup.handle_exit("c1", Some(1)).await;
        // each restart is scheduled; wait for it to run, then fail again
        for _ in 0..2 {
            wait_for_event(&mut rx, |e| matches!(e, SupervisorEvent::Started { .. })).await;
            sup.handle_exit("c1", Some(1)).await;
        }

        wait_for_event(&mut rx, |e| matches!(e, SupervisorEvent::CircuitOpen { .. })).await;

        // further starts are refused while the circuit is open
        assert!(!sup.start("c1").await.unwrap());
        let status = sup.status(Some("c1")).await;
        assert_eq!(status[0].state, WatchState::CircuitOpen);

        // ResetCircuit allows an immediate retry
        sup.reset_circuit("c1").await;
        assert!(sup.start("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_manual_stop_disables_auto_restart() {
        let runtime = MockRuntime::shared();
        runtime.add_container("c1", false).await;
        let sup = Supervisor::new(Some(runtime.dyn_clone()));
        let mut rx = sup.subscribe();

        sup.register(fast_container_config("c1", 5)).await;
        sup.start("c1").await.unwrap();
        wait_for_event(&mut rx, |e| matches!(e, SupervisorEvent::Started { .. })).await;

        sup.stop("c1").await.unwrap();
        wait_for_event(&mut rx, |e| matches!(e, SupervisorEvent::Stopped { .. })).await;

        // no restart is scheduled after a manual stop
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = sup.status(Some("c1")).await;
        assert_eq!(status[0].state, WatchState::Stopped);
        assert_eq!(status[0].restart_count, 0);

        // start() re-arms the entry
        assert!(sup.start("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unexpected_exit_schedules_restart_with_backoff() {
        let runtime = MockRuntime::shared();
        runtime.add_container("c1", true).await;
        let sup = Supervisor::new(Some(runtime.dyn_clone()));
        let mut rx = sup.subscribe();

        sup.register(fast_container_config("c1", 10)).await;
        sup.start("c1").await.unwrap();

        sup.handle_exit("c1", Some(137)).await;
        let event =
            wait_for_event(&mut rx, |e| matches!(e, SupervisorEvent::Restarting { .. })).await;
        match event {
            SupervisorEvent::Restarting { attempt, .. } => assert_eq!(attempt, 1),
            _ => unreachable!(),
        }

        wait_for_event(&mut rx, |e| matches!(e, SupervisorEvent::Started { .. })).await;
        let status = sup.status(Some("c1")).await;
        assert_eq!(status[0].state, WatchState::Running);
        assert_eq!(status[0].restart_count, 1);
    }

    #[tokio::test]
    async fn test_max_restarts_transitions_to_failed() {
        let runtime = MockRuntime::shared();
        runtime.add_container("c1", true).await;
        let sup = Supervisor::new(Some(runtime.dyn_clone()));
        let mut rx = sup.subscribe();

        let mut config = fast_container_config("c1", 100);
        config.max_restarts = 1;
        sup.register(config).await;
        sup.start("c1").await.unwrap();

        sup.handle_exit("c1", Some(1)).await;
        wait_for_event(&mut rx, |e| matches!(e, SupervisorEvent::Started { .. })).await;
        sup.handle_exit("c1", Some(1)).await;

        wait_for_event(&mut rx, |e| matches!(e, SupervisorEvent::MaxRestarts { .. })).await;
        let status = sup.status(Some("c1")).await;
        assert_eq!(status[0].state, WatchState::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_exit_delivery_is_idempotent() {
        let runtime = MockRuntime::shared();
        runtime.add_container("c1", true).await;
        let sup = Supervisor::new(Some(runtime.dyn_clone()));
        let mut rx = sup.subscribe();

        sup.register(fast_container_config("c1", 10)).await;
        sup.start("c1").await.unwrap();

        sup.handle_exit("c1", Some(1)).await;
        // duplicate delivery of the same exit must not double-count
        sup.handle_exit("c1", Some(1)).await;

        wait_for_event(&mut rx, |e| matches!(e, SupervisorEvent::Started { .. })).await;
        let status = sup.status(Some("c1")).await;
        assert_eq!(status[0].restart_count, 1);
    }

    #[tokio::test]
    async fn test_shutdown_disables_restart_for_all() {
        let runtime = MockRuntime::shared();
        runtime.add_container("c1", false).await;
        runtime.add_container("c2", false).await;
        let sup = Supervisor::new(Some(runtime.dyn_clone()));

        sup.register(fast_container_config("c1", 5)).await;
        sup.register(fast_container_config("c2", 5)).await;
        sup.start("c1").await.unwrap();
        sup.start("c2").await.unwrap();

        sup.shutdown().await;

        for status in sup.status(None).await {
            assert_eq!(status.state, WatchState::Stopped, "{}", status.name);
        }
    }
}
