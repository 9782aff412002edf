//! Health probe loops
//!
//! One liveness loop and one readiness loop per container, independent
//! of each other. Probes exec a script under `/code` inside the
//! container; liveness failures restart the container with crash-loop
//! backoff, readiness failures only gate the router.

use crate::{AgentStatus, MonitorEvent, WorkspaceStore};
use ploinky_config::{validate_probe_script, HealthConfig, ProbeConfig};
use ploinky_provider::{ContainerRuntime, ContainerStatus, ExecSpec};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Crash-loop backoff base delay.
pub const LIVENESS_BACKOFF_BASE: Duration = Duration::from_secs(10);
/// Crash-loop backoff ceiling.
pub const LIVENESS_BACKOFF_MAX: Duration = Duration::from_secs(300);
/// Continuous running time after which the retry counter resets.
pub const LIVENESS_RESET_WINDOW: Duration = Duration::from_secs(600);
/// How long to wait for `running` after a probe-driven restart.
const RESTART_DEADLINE: Duration = Duration::from_secs(60);

/// Spawns and runs probe loops for containers.
pub struct ProbeRunner {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<WorkspaceStore>,
    events: broadcast::Sender<MonitorEvent>,
}

impl ProbeRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: Arc<WorkspaceStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            runtime,
            store,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }

    /// Spawn the configured probe loops for one container. Liveness and
    /// readiness run independently and must not block each other.
    pub fn spawn_probes(
        self: &Arc<Self>,
        container: &str,
        health: &HealthConfig,
        cancel: &CancellationToken,
    ) {
        if let Some(probe) = health.liveness.clone() {
            let runner = Arc::clone(self);
            let container = container.to_string();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                runner.liveness_loop(container, probe, cancel).await;
            });
        }

        if let Some(probe) = health.readiness.clone() {
            let runner = Arc::clone(self);
            let container = container.to_string();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                runner.readiness_loop(container, probe, cancel).await;
            });
        }
    }

    /// One probe attempt. `Err(())` means the probe is unusable and its
    /// loop must stop.
    async fn probe_attempt(
        &self,
        container: &str,
        probe: &ProbeConfig,
    ) -> std::result::Result<bool, ()> {
        if let Err(e) = validate_probe_script(&probe.script) {
            self.emit(MonitorEvent::ProbeFault {
                name: container.to_string(),
                message: e.to_string(),
            });
            return Err(());
        }

        let exec_spec = ExecSpec {
            argv: vec!["sh".to_string(), probe.script.clone()],
            working_dir: Some("/code".to_string()),
            ..Default::default()
        };
        let exec = self.runtime.exec(container, &exec_spec);

        match tokio::time::timeout(Duration::from_secs(probe.timeout.max(1)), exec).await {
            Ok(Ok(outcome)) => Ok(outcome.success()),
            Ok(Err(e)) => {
                tracing::debug!("probe exec failed for {container}: {e}");
                Ok(false)
            }
            // timeout counts as failure
            Err(_) => Ok(false),
        }
    }

    async fn liveness_loop(
        self: Arc<Self>,
        container: String,
        probe: ProbeConfig,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(probe.interval.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut fail_streak = 0u32;
        let mut success_streak = 0u32;
        let mut retry_count = 0u32;
        let mut last_restart: Option<Instant> = None;
        let mut healthy: Option<bool> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let ok = match self.probe_attempt(&container, &probe).await {
                Ok(ok) => ok,
                Err(()) => return,
            };

            if ok {
                success_streak += 1;
                fail_streak = 0;

                if success_streak >= probe.success_threshold && healthy != Some(true) {
                    healthy = Some(true);
                    self.set_health(&container, true).await;
                    self.emit(MonitorEvent::HealthChanged {
                        name: container.clone(),
                        healthy: true,
                    });
                }

                // a long stretch of continuous running forgives past restarts
                if let Some(at) = last_restart {
                    if at.elapsed() >= LIVENESS_RESET_WINDOW {
                        retry_count = 0;
                        last_restart = None;
                    }
                }
                continue;
            }

            fail_streak += 1;
            success_streak = 0;
            if fail_streak < probe.failure_threshold {
                continue;
            }
            fail_streak = 0;

            if healthy != Some(false) {
                healthy = Some(false);
                self.set_health(&container, false).await;
                self.emit(MonitorEvent::HealthChanged {
                    name: container.clone(),
                    healthy: false,
                });
            }

            if let Some(at) = last_restart {
                if at.elapsed() >= LIVENESS_RESET_WINDOW {
                    retry_count = 0;
                }
            }

            tracing::warn!("liveness failed for {container}, restarting");
            if let Err(e) = self.restart_container(&container).await {
                tracing::warn!("probe-driven restart of {container} failed: {e}");
            }

            let delay = crash_loop_delay(retry_count);
            self.emit(MonitorEvent::ProbeRestart {
                name: container.clone(),
                retry: retry_count,
                delay,
            });
            retry_count = retry_count.saturating_add(1);
            last_restart = Some(Instant::now());

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn readiness_loop(
        self: Arc<Self>,
        container: String,
        probe: ProbeConfig,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(probe.interval.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut fail_streak = 0u32;
        let mut success_streak = 0u32;
        let mut ready: Option<bool> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let ok = match self.probe_attempt(&container, &probe).await {
                Ok(ok) => ok,
                Err(()) => return,
            };

            if ok {
                success_streak += 1;
                fail_streak = 0;
                if success_streak >= probe.success_threshold && ready != Some(true) {
                    ready = Some(true);
                    self.set_ready(&container, true).await;
                }
                continue;
            }

            fail_streak += 1;
            success_streak = 0;
            if fail_streak < probe.failure_threshold {
                continue;
            }
            fail_streak = 0;

            // readiness never restarts; it only gates routing
            if ready != Some(false) {
                ready = Some(false);
                self.set_ready(&container, false).await;
            }
            self.emit(MonitorEvent::ReadinessWarning {
                name: container.clone(),
            });
        }
    }

    async fn restart_container(&self, container: &str) -> crate::Result<()> {
        if let Err(e) = self.runtime.stop(container, Some(10)).await {
            tracing::debug!("stop before probe restart failed for {container}: {e}");
        }
        self.runtime.start(container).await?;

        let deadline = Instant::now() + RESTART_DEADLINE;
        loop {
            let details = self.runtime.inspect(container).await?;
            if details.status == ContainerStatus::Running {
                if let Err(e) = self
                    .store
                    .update_agent(container, |r| r.status = AgentStatus::Running)
                    .await
                {
                    tracing::debug!("record update for {container}: {e}");
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(crate::CoreError::Runtime(
                    ploinky_provider::RuntimeError::Timeout,
                ));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn set_health(&self, container: &str, healthy: bool) {
        if let Err(e) = self
            .store
            .update_agent(container, move |r| r.healthy = Some(healthy))
            .await
        {
            tracing::debug!("health update for {container}: {e}");
        }
    }

    async fn set_ready(&self, container: &str, ready: bool) {
        if let Err(e) = self
            .store
            .update_agent(container, move |r| r.ready = Some(ready))
            .await
        {
            tracing::debug!("readiness update for {container}: {e}");
        }
    }
}

/// `min(BASE * 2^retry, MAX)`
pub fn crash_loop_delay(retry_count: u32) -> Duration {
    LIVENESS_BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(retry_count.min(16)))
        .min(LIVENESS_BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockCall, MockRuntime};
    use crate::AgentRecord;
    use ploinky_config::Manifest;
    use std::path::PathBuf;

    fn probe(interval: u64, failure_threshold: u32, success_threshold: u32) -> ProbeConfig {
        serde_json::from_value(serde_json::json!({
            "script": "health.sh",
            "interval": interval,
            "timeout": 5,
            "failureThreshold": failure_threshold,
            "successThreshold": success_threshold,
        }))
        .unwrap()
    }

    async fn seeded_store(tmp: &std::path::Path, container: &str) -> Arc<WorkspaceStore> {
        let store = Arc::new(WorkspaceStore::open(tmp).unwrap());
        let record = AgentRecord::new(
            "demo",
            "basic",
            "alpine",
            Manifest::default(),
            container,
            PathBuf::from(tmp),
        );
        store.upsert_agent(&record).await.unwrap();
        store
    }

    #[test]
    fn test_crash_loop_delay_progression() {
        assert_eq!(crash_loop_delay(0), Duration::from_secs(10));
        assert_eq!(crash_loop_delay(1), Duration::from_secs(20));
        assert_eq!(crash_loop_delay(4), Duration::from_secs(160));
        assert_eq!(crash_loop_delay(5), Duration::from_secs(300));
        assert_eq!(crash_loop_delay(20), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_restarts_once_then_recovers() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::shared();
        runtime.add_container("c1", true).await;
        let store = seeded_store(tmp.path(), "c1").await;

        // failures up to the threshold, then healthy forever
        runtime.push_exec_response(1, "");
        runtime.push_exec_response(1, "");

        let runner = ProbeRunner::new(runtime.dyn_clone(), store.clone());
        let mut rx = runner.subscribe();
        let cancel = CancellationToken::new();
        runner.spawn_probes(
            "c1",
            &HealthConfig {
                liveness: Some(probe(1, 2, 1)),
                readiness: None,
            },
            &cancel,
        );

        // unhealthy after the failure streak, restart, then healthy again
        let mut saw_unhealthy = false;
        let mut saw_restart = false;
        let mut saw_healthy = false;
        let deadline = tokio::time::timeout(Duration::from_secs(120), async {
            while let Ok(event) = rx.recv().await {
                match event {
                    MonitorEvent::HealthChanged { healthy: false, .. } => saw_unhealthy = true,
                    MonitorEvent::ProbeRestart { retry, .. } => {
                        assert_eq!(retry, 0);
                        saw_restart = true;
                    }
                    MonitorEvent::HealthChanged { healthy: true, .. } => {
                        saw_healthy = true;
                        break;
                    }
                    _ => {}
                }
            }
        })
        .await;
        deadline.unwrap();
        cancel.cancel();

        assert!(saw_unhealthy && saw_restart && saw_healthy);

        // restarted exactly once
        let stops = runtime
            .get_calls()
            .iter()
            .filter(|c| matches!(c, MockCall::Stop { .. }))
            .count();
        assert_eq!(stops, 1);

        let record = &store.load_agents()["c1"];
        assert_eq!(record.healthy, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_failure_warns_without_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::shared();
        runtime.add_container("c1", true).await;
        let store = seeded_store(tmp.path(), "c1").await;

        // every probe fails
        for _ in 0..8 {
            runtime.push_exec_response(1, "");
        }

        let runner = ProbeRunner::new(runtime.dyn_clone(), store.clone());
        let mut rx = runner.subscribe();
        let cancel = CancellationToken::new();
        runner.spawn_probes(
            "c1",
            &HealthConfig {
                liveness: None,
                readiness: Some(probe(1, 3, 1)),
            },
            &cancel,
        );

        let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .unwrap()
            .unwrap();
        cancel.cancel();
        assert!(matches!(event, MonitorEvent::ReadinessWarning { .. }));

        assert!(!runtime
            .get_calls()
            .iter()
            .any(|c| matches!(c, MockCall::Stop { .. } | MockCall::Start { .. })));
        assert_eq!(store.load_agents()["c1"].ready, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsafe_script_fails_fast_without_exec() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::shared();
        runtime.add_container("c1", true).await;
        let store = seeded_store(tmp.path(), "c1").await;

        let runner = ProbeRunner::new(runtime.dyn_clone(), store);
        let mut rx = runner.subscribe();
        let cancel = CancellationToken::new();

        let mut bad = probe(1, 1, 1);
        bad.script = "../escape.sh".to_string();
        runner.spawn_probes(
            "c1",
            &HealthConfig {
                liveness: Some(bad),
                readiness: None,
            },
            &cancel,
        );

        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .unwrap()
            .unwrap();
        cancel.cancel();
        assert!(matches!(event, MonitorEvent::ProbeFault { .. }));
        assert!(!runtime
            .get_calls()
            .iter()
            .any(|c| matches!(c, MockCall::Exec { .. })));
    }
}
