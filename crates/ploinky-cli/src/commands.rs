//! Command implementations and the lifecycle orchestrator
//!
//! `start` composes the collaborators: lifecycle engine materializes
//! the fleet, the monitor and prober watch it, the supervisor watches
//! both the containers and the router child process. Signals drive a
//! graceful drain; the PID file is removed on every exit path.

use anyhow::Context;
use ploinky_config::GlobalConfig;
use ploinky_core::{
    AgentSpec, ContainerMonitor, HealthPolicy, LifecycleEngine, ProbeRunner, Supervisor,
    WatchConfig, WorkspaceStore,
};
use ploinky_provider::{detect_runtime, ContainerRuntime};
use ploinky_router::RouterConfig;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Name the router child is supervised under.
const ROUTER_ENTRY: &str = "router";

struct Workspace {
    global: GlobalConfig,
    store: Arc<WorkspaceStore>,
    runtime: Arc<dyn ContainerRuntime>,
}

async fn open_workspace() -> anyhow::Result<Workspace> {
    let global = GlobalConfig::load().context("loading global config")?;
    let cwd = std::env::current_dir().context("resolving working directory")?;
    let store = Arc::new(WorkspaceStore::open(&cwd)?);
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        detect_runtime(&global.runtime)
            .await
            .context("selecting container runtime")?,
    );
    Ok(Workspace {
        global,
        store,
        runtime,
    })
}

/// Discover declared agents: every `manifest.json` under
/// `.ploinky/repos/<repo>/<agent>/`.
fn discover_specs(store: &WorkspaceStore) -> anyhow::Result<Vec<AgentSpec>> {
    let mut specs = Vec::new();
    let repos_dir = store.repos_dir();
    let Ok(repos) = std::fs::read_dir(&repos_dir) else {
        return Ok(specs);
    };

    for repo in repos.flatten() {
        if !repo.path().is_dir() {
            continue;
        }
        let repo_name = repo.file_name().to_string_lossy().to_string();
        let Ok(agents) = std::fs::read_dir(repo.path()) else {
            continue;
        };
        for agent in agents.flatten() {
            let manifest_path = agent.path().join("manifest.json");
            if !manifest_path.is_file() {
                continue;
            }
            let agent_name = agent.file_name().to_string_lossy().to_string();
            match ploinky_config::Manifest::load(&manifest_path) {
                Ok(manifest) => specs.push(AgentSpec {
                    agent_name,
                    repo_name: repo_name.clone(),
                    alias: None,
                    manifest,
                    code_dir: agent.path(),
                }),
                Err(e) => {
                    tracing::warn!("skipping {repo_name}/{agent_name}: {e}");
                }
            }
        }
    }

    specs.sort_by(|a, b| (&a.repo_name, &a.agent_name).cmp(&(&b.repo_name, &b.agent_name)));
    Ok(specs)
}

/// `ploinky start [port]`
pub async fn start(port: Option<u16>) -> anyhow::Result<()> {
    let ws = open_workspace().await?;
    let specs = discover_specs(&ws.store)?;
    if specs.is_empty() {
        anyhow::bail!("no agents declared under {}", ws.store.repos_dir().display());
    }

    let engine = Arc::new(LifecycleEngine::new(
        ws.runtime.clone(),
        ws.store.clone(),
        ws.global.clone(),
    ));

    tracing::info!("materializing {} agent(s)", specs.len());
    let mut failed = 0usize;
    for (agent, result) in engine.start_fleet(&specs).await {
        match result {
            Ok(outcome) if outcome.created => {
                tracing::info!("{agent}: container {} created", outcome.container_name)
            }
            Ok(outcome) => tracing::info!("{agent}: container {} up to date", outcome.container_name),
            Err(e) => {
                failed += 1;
                tracing::error!("{agent}: {e}");
            }
        }
    }
    if failed == specs.len() {
        anyhow::bail!("every agent failed to start");
    }

    let router_port = port
        .or(ws.global.router_port)
        .unwrap_or_else(|| ws.store.load_routing().port);
    ws.store
        .update_routing(|table| table.port = router_port)
        .await?;

    // watchdogs
    let cancel = CancellationToken::new();
    let supervisor = Supervisor::new(Some(ws.runtime.clone()));
    let prober = ProbeRunner::new(ws.runtime.clone(), ws.store.clone());
    let monitor = ContainerMonitor::new(
        ws.runtime.clone(),
        ws.store.clone(),
        supervisor.clone(),
        prober.clone(),
        cancel.clone(),
    );
    monitor.reconcile_once().await;
    monitor.start();

    spawn_event_loggers(&supervisor, &monitor, &prober);
    register_router(&supervisor, router_port).await?;
    supervisor.start(ROUTER_ENTRY).await?;

    tracing::info!("fleet is up; router on port {router_port} (ctrl-c to stop)");
    wait_for_shutdown_signal().await;

    // drain order: router (and its sessions) first, then the containers
    tracing::info!("shutting down");
    cancel.cancel();
    supervisor.shutdown().await;
    engine.stop_fleet(false).await?;
    Ok(())
}

/// `ploinky stop [--fast]`
pub async fn stop(fast: bool) -> anyhow::Result<()> {
    let ws = open_workspace().await?;
    let engine = LifecycleEngine::new(ws.runtime, ws.store, ws.global);
    engine.stop_fleet(fast).await?;
    tracing::info!("fleet stopped");
    Ok(())
}

/// `ploinky destroy [--fast]`
pub async fn destroy(fast: bool) -> anyhow::Result<()> {
    let ws = open_workspace().await?;
    let engine = LifecycleEngine::new(ws.runtime, ws.store, ws.global);
    engine.destroy_fleet(fast).await?;
    tracing::info!("fleet destroyed");
    Ok(())
}

/// `ploinky status`
pub async fn status() -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let store = WorkspaceStore::open(&cwd)?;

    let agents = store.load_agents();
    let report = if agents.is_empty() {
        "no agents in this workspace\n".to_string()
    } else {
        let mut records: Vec<_> = agents.values().collect();
        records.sort_by(|a, b| {
            (&a.repo_name, &a.agent_name).cmp(&(&b.repo_name, &b.agent_name))
        });

        let mut report = String::new();
        for record in records {
            let health = match record.healthy {
                Some(true) => "healthy",
                Some(false) => "unhealthy",
                None => "unknown",
            };
            let ready = match record.ready {
                Some(true) => "ready",
                Some(false) => "not-ready",
                None => "unknown",
            };
            let _ = writeln!(
                report,
                "{}/{}  {}  [{}] {} {}",
                record.repo_name,
                record.agent_name,
                record.container_name,
                record.status,
                health,
                ready,
            );
            if let Some(ref error) = record.last_error {
                let _ = writeln!(report, "    last error: {error}");
            }
        }
        report
    };

    write_stdout(&report);
    Ok(())
}

/// Write to stdout without dying on a closed pipe: `ploinky status |
/// head` must not fail when the reader goes away.
fn write_stdout(report: &str) {
    use std::io::Write;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let result = out.write_all(report.as_bytes()).and_then(|()| out.flush());
    if let Err(e) = result {
        if e.kind() == std::io::ErrorKind::BrokenPipe {
            tracing::debug!("stdout closed early: {e}");
        } else {
            tracing::warn!("failed to write status output: {e}");
        }
    }
}

/// `ploinky router [port]` — the router process itself.
pub async fn router(port: Option<u16>) -> anyhow::Result<()> {
    let global = GlobalConfig::load()?;
    let cwd = std::env::current_dir()?;

    let _pid_file = global
        .router_pid_file
        .as_ref()
        .map(|path| PidFile::create(path))
        .transpose()?;

    let mut config = RouterConfig::from_global(&cwd, &global);
    if port.is_some() {
        config.port = port;
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    ploinky_router::run(config, shutdown).await
}

async fn register_router(supervisor: &Arc<Supervisor>, port: u16) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("resolving own executable")?;
    let mut env = std::collections::HashMap::new();
    env.insert("PLOINKY_ROUTER_PORT".to_string(), port.to_string());

    let mut config = WatchConfig::process(
        ROUTER_ENTRY,
        exe.to_string_lossy().to_string(),
        vec!["router".to_string(), port.to_string()],
    );
    if let ploinky_core::Charge::Process { env: charge_env, .. } = &mut config.charge {
        *charge_env = env;
    }

    let status_url = format!("http://127.0.0.1:{port}/status/api");
    config.health = Some(HealthPolicy::new(Arc::new(move || {
        let url = status_url.clone();
        Box::pin(async move {
            match reqwest::get(&url).await {
                Ok(response) => response.status().is_success(),
                Err(_) => false,
            }
        })
    })));

    supervisor.register(config).await;
    Ok(())
}

fn spawn_event_loggers(
    supervisor: &Arc<Supervisor>,
    monitor: &Arc<ContainerMonitor>,
    prober: &Arc<ProbeRunner>,
) {
    let mut supervisor_rx = supervisor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = supervisor_rx.recv().await {
            tracing::info!("supervisor: {event:?}");
        }
    });

    let mut monitor_rx = monitor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = monitor_rx.recv().await {
            tracing::info!("monitor: {event:?}");
        }
    });

    let mut prober_rx = prober.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = prober_rx.recv().await {
            tracing::info!("probe: {event:?}");
        }
    });
}

/// Block until SIGINT, SIGTERM or SIGQUIT.
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::error!("signal handler failed: {e}");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::error!("signal handler failed: {e}");
            return;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::error!("signal handler failed: {e}");
            return;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
}

/// RAII PID file; removed on every exit path.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, std::process::id().to_string())
            .with_context(|| format!("writing PID file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!("failed to remove PID file: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_specs_scans_repo_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::open(tmp.path()).unwrap();

        let agent_dir = store.repos_dir().join("basic/demo");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(
            agent_dir.join("manifest.json"),
            r#"{"image": "node:20"}"#,
        )
        .unwrap();

        // a second agent with a broken manifest is skipped
        let broken_dir = store.repos_dir().join("basic/broken");
        std::fs::create_dir_all(&broken_dir).unwrap();
        std::fs::write(broken_dir.join("manifest.json"), "not json").unwrap();

        let specs = discover_specs(&store).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].agent_name, "demo");
        assert_eq!(specs[0].repo_name, "basic");
        assert_eq!(specs[0].code_dir, agent_dir);
    }

    #[test]
    fn test_discover_specs_empty_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::open(tmp.path()).unwrap();
        assert!(discover_specs(&store).unwrap().is_empty());
    }

    #[test]
    fn test_pid_file_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("router.pid");
        {
            let _pid = PidFile::create(&path).unwrap();
            assert!(path.exists());
            let content = std::fs::read_to_string(&path).unwrap();
            assert_eq!(content, std::process::id().to_string());
        }
        assert!(!path.exists());
    }
}
