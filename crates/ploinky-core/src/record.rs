//! Persisted agent records and declared agent specs

use chrono::{DateTime, Utc};
use ploinky_config::Manifest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Supervision status of one agent, as persisted in `agents.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Declared but no container created yet
    #[default]
    NotCreated,
    /// Container created but not started
    Created,
    /// Container is running
    Running,
    /// Container paused by the runtime
    Paused,
    /// Container restarting
    Restarting,
    /// Container exited
    Exited,
    /// Container dead
    Dead,
    /// Restarts refused until circuit cooldown elapses
    CircuitOpen,
    /// A hook or create step failed; manual intervention needed
    Failed,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotCreated => write!(f, "not-created"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
            Self::CircuitOpen => write!(f, "circuit-open"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One host-side port binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostBinding {
    pub host_ip: String,
    pub host_port: u16,
}

/// Persisted record for one declared agent.
///
/// Keyed by `container_name` in `agents.json`. The lifecycle engine is
/// the only writer of identity and mounts; monitor and supervisor update
/// status and health.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    /// Agent name, unique within its repo
    pub agent_name: String,
    /// Repo the agent was declared in
    pub repo_name: String,
    /// Optional route alias
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Image the container runs
    pub image: String,
    /// Declarative agent configuration
    #[serde(default)]
    pub manifest: Manifest,
    /// Deterministic container name
    pub container_name: String,
    /// Absolute workspace path this record belongs to
    pub project_path: PathBuf,
    /// Container port -> host binding, persisted so the router never has
    /// to query the runtime per request
    #[serde(default)]
    pub host_port_bindings: HashMap<u16, HostBinding>,
    /// SHA-256 over the sorted, resolved env
    #[serde(default)]
    pub env_hash: String,
    /// Current status
    #[serde(default)]
    pub status: AgentStatus,
    /// Last liveness verdict; `None` until the first probe completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    /// Last readiness verdict; the router gates 503s on this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    /// Last fatal error for this agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// Fields we don't explicitly handle, preserved on rewrite
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl AgentRecord {
    pub fn new(
        agent_name: impl Into<String>,
        repo_name: impl Into<String>,
        image: impl Into<String>,
        manifest: Manifest,
        container_name: impl Into<String>,
        project_path: PathBuf,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            repo_name: repo_name.into(),
            alias: None,
            image: image.into(),
            manifest,
            container_name: container_name.into(),
            project_path,
            host_port_bindings: HashMap::new(),
            env_hash: String::new(),
            status: AgentStatus::NotCreated,
            healthy: None,
            ready: None,
            last_error: None,
            created_at: Utc::now(),
            extra: HashMap::new(),
        }
    }

    /// The host port the router proxies to: the binding of the lowest
    /// container port.
    pub fn primary_host_port(&self) -> Option<&HostBinding> {
        self.host_port_bindings
            .iter()
            .min_by_key(|(container_port, _)| **container_port)
            .map(|(_, binding)| binding)
    }

    /// Readiness as the router sees it; unknown counts as not ready.
    pub fn is_ready(&self) -> bool {
        self.ready.unwrap_or(false)
    }
}

/// A declared agent: the input to the lifecycle engine.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub agent_name: String,
    pub repo_name: String,
    pub alias: Option<String>,
    pub manifest: Manifest,
    /// Host directory mounted at `/code`
    pub code_dir: PathBuf,
}
