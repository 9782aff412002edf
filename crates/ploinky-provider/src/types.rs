//! Common types for container runtimes

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Container ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        if self.0.len() > 12 {
            &self.0[..12]
        } else {
            &self.0
        }
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Container runtime kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Podman => write!(f, "podman"),
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            _ => Err(format!("Unknown runtime kind: {}", s)),
        }
    }
}

/// Container status as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Removing => write!(f, "removing"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<&str> for ContainerStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

/// Bind mount specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Host path
    pub source: String,
    /// Target path in container
    pub target: String,
    /// Read-only
    pub read_only: bool,
}

impl BindMount {
    pub fn rw(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn ro(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }
}

/// One published port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
}

/// Configuration for creating a container
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    /// Image to use
    pub image: String,
    /// Container name
    pub name: String,
    /// Command argv; empty means the image default
    pub cmd: Vec<String>,
    /// Environment variables, already resolved
    pub env: Vec<(String, String)>,
    /// Working directory inside the container
    pub working_dir: Option<String>,
    /// Bind mounts
    pub mounts: Vec<BindMount>,
    /// Port bindings
    pub ports: Vec<PortBinding>,
    /// Labels
    pub labels: HashMap<String, String>,
    /// Keep STDIN open so long-running entries survive
    pub interactive: bool,
}

/// A one-shot container run sharing an image and mounts with an agent
#[derive(Debug, Clone, Default)]
pub struct DisposableSpec {
    pub image: String,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<BindMount>,
    pub working_dir: Option<String>,
    /// Command argv to run
    pub argv: Vec<String>,
}

/// Exec configuration
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    /// Command argv to execute
    pub argv: Vec<String>,
    /// Environment variables
    pub env: Vec<(String, String)>,
    /// Working directory
    pub working_dir: Option<String>,
    /// Allocate TTY
    pub tty: bool,
    /// Attach stdin
    pub interactive: bool,
    /// Run detached (sidecars)
    pub detach: bool,
}

/// Result of an exec
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Exit code
    pub exit_code: i64,
    /// Combined stdout/stderr output
    pub output: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Detailed container information
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub exit_code: Option<i64>,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub mounts: Vec<MountInfo>,
    pub ports: Vec<PortBinding>,
    pub working_dir: Option<String>,
}

/// Mount information from inspect
#[derive(Debug, Clone)]
pub struct MountInfo {
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

/// Shell available inside an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageShell {
    Bash,
    Sh,
    Ash,
    Dash,
    NoShell,
}

impl ImageShell {
    /// Absolute path of the shell, if any.
    pub fn path(&self) -> Option<&'static str> {
        match self {
            Self::Bash => Some("/bin/bash"),
            Self::Sh => Some("/bin/sh"),
            Self::Ash => Some("/bin/ash"),
            Self::Dash => Some("/bin/dash"),
            Self::NoShell => None,
        }
    }

    /// All probe candidates, in preference order.
    pub fn candidates() -> [ImageShell; 4] {
        [Self::Bash, Self::Sh, Self::Ash, Self::Dash]
    }
}

/// Health transition carried by a runtime health event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Action of a runtime event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Start,
    Die,
    Kill,
    Stop,
    Destroy,
    HealthStatus(HealthState),
    Other(String),
}

impl EventAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "create" => Self::Create,
            "start" => Self::Start,
            "die" => Self::Die,
            "kill" => Self::Kill,
            "stop" => Self::Stop,
            "destroy" => Self::Destroy,
            other => {
                if let Some(status) = other.strip_prefix("health_status") {
                    let status = status.trim_start_matches(':').trim();
                    return match status {
                        "healthy" => Self::HealthStatus(HealthState::Healthy),
                        _ => Self::HealthStatus(HealthState::Unhealthy),
                    };
                }
                Self::Other(other.to_string())
            }
        }
    }
}

/// One event from the runtime's event stream
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub action: EventAction,
    /// Container name
    pub name: String,
    /// Raw event attributes (exitCode and friends)
    pub attributes: HashMap<String, String>,
    /// Unix timestamp in seconds
    pub timestamp: i64,
}

impl RuntimeEvent {
    /// Exit code from event attributes, when present.
    pub fn exit_code(&self) -> Option<i64> {
        self.attributes.get("exitCode").and_then(|s| s.parse().ok())
    }
}

/// Filter for the event stream
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events whose container carries this label (K=V)
    pub label: Option<String>,
}
