//! Lifecycle engine
//!
//! Makes the container world match the declared agents: deterministic
//! identity, env-hash recreation, mount/port materialization and the
//! hook pipeline. Per-agent operations are serialized through a
//! per-agent lock; fleet operations parallelize across agents.
//!
//! Hook ordering is a hard contract:
//! 1. `hosthook_aftercreation` (host)
//! 2. `install` (disposable container)
//! 3. container start
//! 4. `postinstall` (exec in the running container, then restart)
//! 5. `hosthook_postinstall` (host)
//! 6. readiness probe success
//! 7. agent announced to the router

use crate::{
    compose_mounts, container_name, manifest_env_hash, parse_manifest_ports, workspace_digest,
    AgentRecord, AgentSpec, AgentStatus, CoreError, HostBinding, MountOptions, Result,
    WorkspaceStore,
};
use ploinky_config::{GlobalConfig, RouteEntry};
use ploinky_provider::{
    BindMount, ContainerRuntime, ContainerStatus, CreateSpec, DisposableSpec, ExecSpec, ImageShell,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Label carrying the env hash; the sole trigger for re-creation.
pub const ENVHASH_LABEL: &str = "ploinky.envhash";
pub const AGENT_LABEL: &str = "ploinky.agent";
pub const REPO_LABEL: &str = "ploinky.repo";
pub const WORKSPACE_LABEL: &str = "ploinky.workspace";

/// How long to wait for a container to reach `running` after start.
const START_DEADLINE: Duration = Duration::from_secs(60);
/// SIGTERM-to-SIGKILL wait on normal stops, in seconds.
const STOP_TIMEOUT: u32 = 10;
/// Fast mode collapses the wait to roughly 100 ms.
const FAST_STOP_TIMEOUT: u32 = 0;

/// What `ensure_agent` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub container_name: String,
    /// A container was created in this call
    pub created: bool,
    /// An existing container was replaced because its env hash changed
    pub recreated: bool,
}

/// Drives containers to match declared agents.
pub struct LifecycleEngine {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<WorkspaceStore>,
    config: GlobalConfig,
    agent_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LifecycleEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<WorkspaceStore>,
        config: GlobalConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            config,
            agent_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<WorkspaceStore> {
        &self.store
    }

    /// Idempotent: bring one agent's container up to date with its
    /// manifest. Re-creates the container only when the resolved env
    /// hash differs from the `ploinky.envhash` label.
    pub async fn ensure_agent(&self, spec: &AgentSpec) -> Result<EnsureOutcome> {
        let name = container_name(&spec.repo_name, &spec.agent_name, self.store.root());
        let lock = self.agent_lock(&name).await;
        let _guard = lock.lock().await;

        let secrets = self.store.load_secrets();
        let (resolved_env, env_hash) = manifest_env_hash(&spec.manifest, &secrets);

        let mut recreated = false;
        if self.runtime.exists(&name).await? {
            let details = self.runtime.inspect(&name).await?;
            if details.labels.get(ENVHASH_LABEL) == Some(&env_hash) {
                if details.status != ContainerStatus::Running {
                    self.runtime.start(&name).await?;
                    self.wait_running(&name).await?;
                }
                self.sync_agent_config(spec, &name)?;
                self.refresh_record(spec, &name, &env_hash).await?;
                return Ok(EnsureOutcome {
                    container_name: name,
                    created: false,
                    recreated: false,
                });
            }

            tracing::info!("env hash changed for {name}, recreating container");
            if let Err(e) = self.runtime.stop(&name, Some(STOP_TIMEOUT)).await {
                tracing::debug!("stop before recreate failed for {name}: {e}");
            }
            self.runtime.remove(&name, true).await?;
            recreated = true;
        }

        let shell = self.runtime.probe_image_shell(&spec.manifest.image).await?;
        let ports = parse_manifest_ports(&spec.manifest.ports)?;
        let mounts = self.compose_agent_mounts(spec)?;

        let mut env: Vec<(String, String)> = resolved_env.into_iter().collect();
        env.push(("WORKSPACE_PATH".to_string(), "/agent".to_string()));

        let mut labels = HashMap::new();
        labels.insert(ENVHASH_LABEL.to_string(), env_hash.clone());
        labels.insert(AGENT_LABEL.to_string(), spec.agent_name.clone());
        labels.insert(REPO_LABEL.to_string(), spec.repo_name.clone());
        labels.insert(
            WORKSPACE_LABEL.to_string(),
            workspace_digest(self.store.root()),
        );

        let create_spec = CreateSpec {
            image: spec.manifest.image.clone(),
            name: name.clone(),
            cmd: shellify(shell, spec.manifest.agent_entry()),
            env,
            working_dir: Some("/code".to_string()),
            mounts,
            ports: ports.clone(),
            labels,
            interactive: true,
        };
        self.runtime.create(&create_spec).await?;

        let mut record = AgentRecord::new(
            spec.agent_name.clone(),
            spec.repo_name.clone(),
            spec.manifest.image.clone(),
            spec.manifest.clone(),
            name.clone(),
            self.store.root().to_path_buf(),
        );
        record.alias = spec.alias.clone();
        record.env_hash = env_hash.clone();
        record.status = AgentStatus::Created;
        record.host_port_bindings = ports
            .iter()
            .map(|p| {
                (
                    p.container_port,
                    HostBinding {
                        host_ip: p.host_ip.clone(),
                        host_port: p.host_port,
                    },
                )
            })
            .collect();
        self.store.upsert_agent(&record).await?;

        if let Some(ref hook) = spec.manifest.hosthook_aftercreation {
            if let Err(e) = self.run_host_hook("hosthook_aftercreation", hook).await {
                let _ = self.runtime.remove(&name, true).await;
                self.mark_failed(&name, &e).await;
                return Err(e);
            }
        }

        if let Some(ref install) = spec.manifest.install {
            for command in install.commands() {
                let outcome = self
                    .runtime
                    .run_disposable(&DisposableSpec {
                        image: spec.manifest.image.clone(),
                        env: Vec::new(),
                        mounts: vec![BindMount::ro(spec.code_dir.to_string_lossy(), "/code")],
                        working_dir: Some("/code".to_string()),
                        argv: shellify(shell, command),
                    })
                    .await?;
                if !outcome.success() {
                    let err = CoreError::HookFailed {
                        hook: "install".to_string(),
                        message: truncate_output(&outcome.output),
                    };
                    self.mark_failed(&name, &err).await;
                    return Err(err);
                }
            }
        }

        self.runtime.start(&name).await?;
        self.wait_running(&name).await?;

        if let Some(ref postinstall) = spec.manifest.postinstall {
            for command in postinstall.commands() {
                let outcome = self
                    .runtime
                    .exec(
                        &name,
                        &ExecSpec {
                            argv: shellify(shell, command),
                            working_dir: Some("/code".to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                if !outcome.success() {
                    let err = CoreError::HookFailed {
                        hook: "postinstall".to_string(),
                        message: truncate_output(&outcome.output),
                    };
                    self.mark_failed(&name, &err).await;
                    return Err(err);
                }
            }

            // restart so the agent reloads whatever postinstall wrote
            self.runtime.stop(&name, Some(STOP_TIMEOUT)).await?;
            self.runtime.start(&name).await?;
            self.wait_running(&name).await?;
        }

        if let Some(ref hook) = spec.manifest.hosthook_postinstall {
            if let Err(e) = self.run_host_hook("hosthook_postinstall", hook).await {
                let _ = self.runtime.stop(&name, Some(STOP_TIMEOUT)).await;
                self.mark_failed(&name, &e).await;
                return Err(e);
            }
        }

        if let Some(ref sidecar) = spec.manifest.start {
            self.runtime
                .exec(
                    &name,
                    &ExecSpec {
                        argv: shellify(shell, sidecar),
                        detach: true,
                        ..Default::default()
                    },
                )
                .await?;
        }

        self.sync_agent_config(spec, &name)?;
        self.store
            .update_agent(&name, |r| {
                r.status = AgentStatus::Running;
                r.ready = Some(false);
                r.last_error = None;
            })
            .await?;

        Ok(EnsureOutcome {
            container_name: name,
            created: true,
            recreated,
        })
    }

    /// Add the agent's route to `routing.json` (step 7 of the pipeline).
    pub async fn announce_route(&self, spec: &AgentSpec, outcome: &EnsureOutcome) -> Result<()> {
        let route_name = spec.agent_name.clone();
        let container = outcome.container_name.clone();
        let alias = spec.alias.clone();
        self.store
            .update_routing(move |table| {
                table.routes.insert(
                    route_name.clone(),
                    RouteEntry {
                        host_path: Some(format!("/{route_name}")),
                        container: Some(container),
                        alias,
                        ..Default::default()
                    },
                );
            })
            .await?;
        Ok(())
    }

    /// Ensure every declared agent, in parallel.
    pub async fn start_fleet(
        &self,
        specs: &[AgentSpec],
    ) -> Vec<(String, Result<EnsureOutcome>)> {
        let tasks = specs.iter().map(|spec| async {
            let result = self.ensure_agent(spec).await;
            if let Ok(ref outcome) = result {
                if let Err(e) = self.announce_route(spec, outcome).await {
                    tracing::warn!("failed to announce route for {}: {e}", spec.agent_name);
                }
            }
            (spec.agent_name.clone(), result)
        });
        futures::future::join_all(tasks).await
    }

    /// Stop every container in the workspace.
    pub async fn stop_fleet(&self, fast: bool) -> Result<()> {
        let agents = self.store.load_agents();
        let timeout = if fast { FAST_STOP_TIMEOUT } else { STOP_TIMEOUT };

        let tasks = agents.keys().map(|name| {
            let name = name.clone();
            async move {
                if let Err(e) = self.runtime.stop(&name, Some(timeout)).await {
                    tracing::debug!("stop {name}: {e}");
                }
                if let Err(e) = self
                    .store
                    .update_agent(&name, |r| {
                        r.status = AgentStatus::Exited;
                        r.ready = Some(false);
                    })
                    .await
                {
                    tracing::debug!("record update for {name}: {e}");
                }
            }
        });
        futures::future::join_all(tasks).await;
        Ok(())
    }

    /// Stop and remove every container and its record and route.
    pub async fn destroy_fleet(&self, fast: bool) -> Result<()> {
        let agents = self.store.load_agents();
        let timeout = if fast { FAST_STOP_TIMEOUT } else { STOP_TIMEOUT };

        let tasks = agents.values().map(|record| {
            let name = record.container_name.clone();
            let agent_name = record.agent_name.clone();
            async move {
                if let Err(e) = self.runtime.stop(&name, Some(timeout)).await {
                    tracing::debug!("stop {name}: {e}");
                }
                if let Err(e) = self.runtime.remove(&name, true).await {
                    tracing::debug!("remove {name}: {e}");
                }
                if let Err(e) = self.store.remove_agent(&name).await {
                    tracing::warn!("failed to drop record for {name}: {e}");
                }
                if let Err(e) = self
                    .store
                    .update_routing(|table| {
                        table.routes.remove(&agent_name);
                    })
                    .await
                {
                    tracing::warn!("failed to drop route for {agent_name}: {e}");
                }
            }
        });
        futures::future::join_all(tasks).await;
        Ok(())
    }

    // -- helpers ------------------------------------------------------------

    async fn agent_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.agent_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn compose_agent_mounts(&self, spec: &AgentSpec) -> Result<Vec<BindMount>> {
        let shared = self.store.shared_dir();
        let work = self.store.agent_work_dir(&spec.agent_name);
        std::fs::create_dir_all(&shared)?;
        std::fs::create_dir_all(&work)?;

        let skills = spec.code_dir.join(".AchillesSkills");
        let mut mounts = compose_mounts(&MountOptions {
            agent_library: self.config.agent_library.as_deref(),
            shared_dir: &shared,
            cwd: self.store.root(),
            code_dir: &spec.code_dir,
            agent_work_dir: &work,
            skills_dir: skills.exists().then_some(skills.as_path()),
            profile: self.config.profile,
        });

        for (host, container) in spec.manifest.expanded_volumes() {
            mounts.push(BindMount::rw(host, container));
        }
        Ok(mounts)
    }

    async fn run_host_hook(&self, hook: &str, command: &str) -> Result<()> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.store.root())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::HookFailed {
                hook: hook.to_string(),
                message: truncate_output(&stderr),
            });
        }
        Ok(())
    }

    async fn wait_running(&self, name: &str) -> Result<()> {
        let deadline = Instant::now() + START_DEADLINE;
        loop {
            let details = self.runtime.inspect(name).await?;
            if details.status == ContainerStatus::Running {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CoreError::Runtime(ploinky_provider::RuntimeError::Timeout));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Write the agent's runtime config file into its work directory so
    /// tools inside the container can discover their identity and ports.
    fn sync_agent_config(&self, spec: &AgentSpec, container: &str) -> Result<()> {
        let work = self.store.agent_work_dir(&spec.agent_name);
        std::fs::create_dir_all(&work)?;

        let config = serde_json::json!({
            "agent": spec.agent_name,
            "repo": spec.repo_name,
            "container": container,
            "ports": spec.manifest.ports,
        });
        crate::atomic_write(
            &work.join("mcp.json"),
            serde_json::to_string_pretty(&config)?.as_bytes(),
        )?;
        Ok(())
    }

    async fn refresh_record(&self, spec: &AgentSpec, name: &str, env_hash: &str) -> Result<()> {
        let agents = self.store.load_agents();
        if agents.contains_key(name) {
            let env_hash = env_hash.to_string();
            self.store
                .update_agent(name, move |r| {
                    r.status = AgentStatus::Running;
                    r.env_hash = env_hash;
                })
                .await?;
            return Ok(());
        }

        let mut record = AgentRecord::new(
            spec.agent_name.clone(),
            spec.repo_name.clone(),
            spec.manifest.image.clone(),
            spec.manifest.clone(),
            name,
            self.store.root().to_path_buf(),
        );
        record.alias = spec.alias.clone();
        record.env_hash = env_hash.to_string();
        record.status = AgentStatus::Running;
        self.store.upsert_agent(&record).await?;
        Ok(())
    }

    async fn mark_failed(&self, name: &str, error: &CoreError) {
        let message = error.to_string();
        if let Err(e) = self
            .store
            .update_agent(name, move |r| {
                r.status = AgentStatus::Failed;
                r.last_error = Some(message);
            })
            .await
        {
            tracing::warn!("failed to mark {name} failed: {e}");
        }
    }
}

/// Wrap a manifest command for the image's shell; an image without any
/// shell runs the command directly as argv.
fn shellify(shell: ImageShell, command: &str) -> Vec<String> {
    match shell.path() {
        Some(path) => vec![path.to_string(), "-c".to_string(), command.to_string()],
        None => command.split_whitespace().map(|s| s.to_string()).collect(),
    }
}

fn truncate_output(output: &str) -> String {
    const LIMIT: usize = 1024;
    let trimmed = output.trim();
    if trimmed.len() <= LIMIT {
        trimmed.to_string()
    } else {
        format!("{}…", &trimmed[..LIMIT])
    }
}
