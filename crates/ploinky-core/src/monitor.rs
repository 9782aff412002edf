//! Container monitor
//!
//! Long-lived consumer of the runtime's event stream, restarted with a
//! short fixed delay on EOF or error. A periodic reconcile pass keeps
//! the monitored set in sync with the workspace store: new agents get a
//! supervisor entry and probe workers, removed agents are untracked.

use crate::{
    workspace_digest, AgentStatus, MonitorEvent, ProbeRunner, Supervisor, SupervisorEvent,
    WatchConfig, WorkspaceStore,
};
use ploinky_provider::{ContainerRuntime, EventAction, EventFilter, HealthState, RuntimeEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

/// Cadence of the store reconcile pass.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);
/// Fixed delay before re-opening a dead event stream.
pub const EVENT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct ContainerMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<WorkspaceStore>,
    supervisor: Arc<Supervisor>,
    prober: Arc<ProbeRunner>,
    cancel: CancellationToken,
    events: broadcast::Sender<MonitorEvent>,
    probes: Mutex<HashMap<String, CancellationToken>>,
}

impl ContainerMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<WorkspaceStore>,
        supervisor: Arc<Supervisor>,
        prober: Arc<ProbeRunner>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            runtime,
            store,
            supervisor,
            prober,
            cancel,
            events,
            probes: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }

    /// Spawn the event consumer, the reconcile loop and the supervisor
    /// event listener.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor.event_task().await;
        });

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                monitor.reconcile_once().await;
            }
        });

        let monitor = Arc::clone(self);
        let mut events = self.supervisor.subscribe();
        tokio::spawn(async move {
            use tokio::sync::broadcast::error::RecvError;
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(event) => monitor.apply_supervisor_event(&event).await,
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        });
    }

    /// Persist supervisor circuit transitions into the agent record so
    /// the router's on-disk snapshot can refuse traffic with a 503.
    pub async fn apply_supervisor_event(&self, event: &SupervisorEvent) {
        match event {
            SupervisorEvent::CircuitOpen { name } => {
                self.update_status(name, AgentStatus::CircuitOpen).await;
            }
            SupervisorEvent::CircuitReset { name } => {
                // retry allowed again; the next start event flips it to
                // Running
                if let Err(e) = self
                    .store
                    .update_agent(name, |r| {
                        if r.status == AgentStatus::CircuitOpen {
                            r.status = AgentStatus::Exited;
                        }
                    })
                    .await
                {
                    tracing::debug!("circuit-reset update for {name}: {e}");
                }
            }
            _ => {}
        }
    }

    /// One reconcile pass against the workspace store.
    pub async fn reconcile_once(&self) {
        let agents = self.store.load_agents();

        for (name, record) in &agents {
            if !self.supervisor.is_registered(name).await {
                self.supervisor
                    .register(WatchConfig::container(name.clone()))
                    .await;
            }

            if let Some(ref health) = record.manifest.health {
                let mut probes = self.probes.lock().await;
                if !probes.contains_key(name) {
                    let token = self.cancel.child_token();
                    self.prober.spawn_probes(name, health, &token);
                    probes.insert(name.clone(), token);
                }
            }
        }

        // untrack removed agents
        let mut probes = self.probes.lock().await;
        let stale: Vec<String> = probes
            .keys()
            .filter(|name| !agents.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(token) = probes.remove(&name) {
                token.cancel();
            }
            self.supervisor.unregister(&name).await;
        }
    }

    /// Apply one runtime event. Idempotent and safe under duplicate
    /// delivery.
    pub async fn handle_event(&self, event: &RuntimeEvent) {
        if event.name.is_empty() || !self.store.load_agents().contains_key(&event.name) {
            return;
        }
        let name = event.name.clone();

        match &event.action {
            EventAction::Start => {
                self.update_status(&name, AgentStatus::Running).await;
                self.emit(MonitorEvent::ContainerStarted { name });
            }
            EventAction::Die | EventAction::Kill | EventAction::Stop => {
                let exit_code = event.exit_code();
                self.update_status(&name, AgentStatus::Exited).await;
                self.emit(MonitorEvent::ContainerExited {
                    name: name.clone(),
                    exit_code,
                });
                self.supervisor.handle_exit(&name, exit_code).await;
            }
            EventAction::HealthStatus(state) => {
                let healthy = *state == HealthState::Healthy;
                if let Err(e) = self
                    .store
                    .update_agent(&name, move |r| r.healthy = Some(healthy))
                    .await
                {
                    tracing::debug!("health update for {name}: {e}");
                }
                self.emit(MonitorEvent::HealthChanged {
                    name: name.clone(),
                    healthy,
                });
                if !healthy {
                    self.supervisor.note_unhealthy(&name).await;
                }
            }
            _ => {}
        }
    }

    async fn update_status(&self, name: &str, status: AgentStatus) {
        if let Err(e) = self.store.update_agent(name, move |r| r.status = status).await {
            tracing::debug!("status update for {name}: {e}");
        }
    }

    async fn event_task(self: Arc<Self>) {
        let filter = EventFilter {
            label: Some(format!(
                "ploinky.workspace={}",
                workspace_digest(self.store.root())
            )),
        };

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match self.runtime.events(&filter).await {
                Ok(mut stream) => loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        item = stream.next() => match item {
                            Some(Ok(event)) => self.handle_event(&event).await,
                            Some(Err(e)) => {
                                tracing::warn!("event stream error: {e}");
                                break;
                            }
                            None => break,
                        }
                    }
                },
                Err(e) => {
                    tracing::warn!("failed to open event stream: {e}");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(EVENT_RETRY_DELAY) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRuntime;
    use crate::{AgentRecord, SupervisorEvent};
    use ploinky_config::Manifest;
    use std::collections::HashMap as StdHashMap;
    use std::path::PathBuf;

    async fn seeded(
        tmp: &std::path::Path,
        container: &str,
        with_health: bool,
    ) -> (Arc<MockRuntime>, Arc<WorkspaceStore>, Arc<ContainerMonitor>) {
        let runtime = MockRuntime::shared();
        runtime.add_container(container, true).await;

        let store = Arc::new(WorkspaceStore::open(tmp).unwrap());
        let manifest: Manifest = if with_health {
            serde_json::from_str(
                r#"{"image": "alpine", "health": {"liveness": {"script": "alive.sh"}}}"#,
            )
            .unwrap()
        } else {
            Manifest::default()
        };
        let record = AgentRecord::new(
            "demo",
            "basic",
            "alpine",
            manifest,
            container,
            PathBuf::from(tmp),
        );
        store.upsert_agent(&record).await.unwrap();

        let supervisor = Supervisor::new(Some(runtime.dyn_clone()));
        let prober = ProbeRunner::new(runtime.dyn_clone(), store.clone());
        let monitor = ContainerMonitor::new(
            runtime.dyn_clone(),
            store.clone(),
            supervisor,
            prober,
            CancellationToken::new(),
        );
        (runtime, store, monitor)
    }

    fn runtime_event(name: &str, action: EventAction, exit_code: Option<&str>) -> RuntimeEvent {
        let mut attributes = StdHashMap::new();
        if let Some(code) = exit_code {
            attributes.insert("exitCode".to_string(), code.to_string());
        }
        attributes.insert("name".to_string(), name.to_string());
        RuntimeEvent {
            action,
            name: name.to_string(),
            attributes,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_reconcile_registers_and_spawns_probes() {
        let tmp = tempfile::tempdir().unwrap();
        let (_runtime, _store, monitor) = seeded(tmp.path(), "c1", true).await;

        monitor.reconcile_once().await;

        assert!(monitor.supervisor.is_registered("c1").await);
        assert!(monitor.probes.lock().await.contains_key("c1"));
    }

    #[tokio::test]
    async fn test_reconcile_untracks_removed_agents() {
        let tmp = tempfile::tempdir().unwrap();
        let (_runtime, store, monitor) = seeded(tmp.path(), "c1", true).await;

        monitor.reconcile_once().await;
        assert!(monitor.supervisor.is_registered("c1").await);

        store.remove_agent("c1").await.unwrap();
        monitor.reconcile_once().await;

        assert!(!monitor.supervisor.is_registered("c1").await);
        assert!(!monitor.probes.lock().await.contains_key("c1"));
    }

    #[tokio::test]
    async fn test_die_event_updates_record_and_cascades() {
        let tmp = tempfile::tempdir().unwrap();
        let (_runtime, store, monitor) = seeded(tmp.path(), "c1", false).await;

        monitor.reconcile_once().await;
        monitor.supervisor.start("c1").await.unwrap();
        let mut rx = monitor.supervisor.subscribe();

        monitor
            .handle_event(&runtime_event("c1", EventAction::Die, Some("1")))
            .await;

        assert_eq!(store.load_agents()["c1"].status, AgentStatus::Exited);

        // the supervisor saw the exit and scheduled a restart
        let event = tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                let event = rx.recv().await.unwrap();
                if matches!(event, SupervisorEvent::Restarting { .. }) {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.name(), "c1");
    }

    #[tokio::test]
    async fn test_start_event_marks_running() {
        let tmp = tempfile::tempdir().unwrap();
        let (_runtime, store, monitor) = seeded(tmp.path(), "c1", false).await;

        monitor
            .handle_event(&runtime_event("c1", EventAction::Start, None))
            .await;
        assert_eq!(store.load_agents()["c1"].status, AgentStatus::Running);
    }

    #[tokio::test]
    async fn test_unknown_container_events_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let (_runtime, store, monitor) = seeded(tmp.path(), "c1", false).await;

        monitor
            .handle_event(&runtime_event("stranger", EventAction::Die, Some("1")))
            .await;
        assert_eq!(store.load_agents().len(), 1);
        assert_eq!(store.load_agents()["c1"].status, AgentStatus::NotCreated);
    }

    #[tokio::test]
    async fn test_circuit_open_event_persists_status() {
        let tmp = tempfile::tempdir().unwrap();
        let (_runtime, store, monitor) = seeded(tmp.path(), "c1", false).await;

        monitor
            .apply_supervisor_event(&SupervisorEvent::CircuitOpen {
                name: "c1".to_string(),
            })
            .await;
        assert_eq!(store.load_agents()["c1"].status, AgentStatus::CircuitOpen);

        monitor
            .apply_supervisor_event(&SupervisorEvent::CircuitReset {
                name: "c1".to_string(),
            })
            .await;
        assert_eq!(store.load_agents()["c1"].status, AgentStatus::Exited);
    }

    #[tokio::test]
    async fn test_circuit_reset_leaves_other_statuses_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let (_runtime, store, monitor) = seeded(tmp.path(), "c1", false).await;

        store
            .update_agent("c1", |r| r.status = AgentStatus::Running)
            .await
            .unwrap();
        monitor
            .apply_supervisor_event(&SupervisorEvent::CircuitReset {
                name: "c1".to_string(),
            })
            .await;
        assert_eq!(store.load_agents()["c1"].status, AgentStatus::Running);
    }

    #[tokio::test]
    async fn test_supervisor_circuit_flows_into_record_via_listener() {
        let tmp = tempfile::tempdir().unwrap();
        let (_runtime, store, monitor) = seeded(tmp.path(), "c1", false).await;

        // fast policy so the circuit trips within the test
        let mut config = WatchConfig::container("c1");
        config.backoff = crate::BackoffPolicy {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
            multiplier: 2,
        };
        config.circuit = crate::CircuitPolicy {
            threshold: 2,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
        };
        monitor.supervisor.register(config).await;
        monitor.start();

        let mut rx = monitor.supervisor.subscribe();
        monitor.supervisor.start("c1").await.unwrap();
        // consume the initial start, then fail twice within the window
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if matches!(rx.recv().await, Ok(SupervisorEvent::Started { .. })) {
                    break;
                }
            }
        })
        .await
        .unwrap();
        monitor.supervisor.handle_exit("c1", Some(1)).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if matches!(rx.recv().await, Ok(SupervisorEvent::Started { .. })) {
                    break;
                }
            }
        })
        .await
        .unwrap();
        monitor.supervisor.handle_exit("c1", Some(1)).await;

        // the listener persists the open circuit into the record
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.load_agents()["c1"].status == AgentStatus::CircuitOpen {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        monitor.supervisor.reset_circuit("c1").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.load_agents()["c1"].status == AgentStatus::Exited {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unhealthy_event_updates_health() {
        let tmp = tempfile::tempdir().unwrap();
        let (_runtime, store, monitor) = seeded(tmp.path(), "c1", false).await;

        monitor
            .handle_event(&runtime_event(
                "c1",
                EventAction::HealthStatus(HealthState::Unhealthy),
                None,
            ))
            .await;
        assert_eq!(store.load_agents()["c1"].healthy, Some(false));
    }
}
