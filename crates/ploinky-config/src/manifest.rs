//! Agent manifest parsing
//!
//! A manifest is the declarative configuration for one agent: the image it
//! runs, its ports and volumes, environment (with secret references),
//! lifecycle hooks and health probes.

use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Default main entry command when `agent` is not set.
pub const DEFAULT_AGENT_ENTRY: &str = "sh /Agent/server/AgentServer.sh";

/// Declarative configuration for one agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Manifest {
    /// Container image to run
    #[serde(default)]
    pub image: String,

    /// Port specs: `[ip:]host:container` or a bare container port
    #[serde(default)]
    pub ports: Vec<String>,

    /// Bind mounts, host path -> container path
    #[serde(default)]
    pub volumes: HashMap<String, String>,

    /// Environment variables; values may be literals, `$VAR` host
    /// references, or `$ref:NAME` secret references
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// One-shot install command, run in a disposable container
    #[serde(default)]
    pub install: Option<CommandValue>,

    /// Command(s) run inside the container after first start
    #[serde(default)]
    pub postinstall: Option<CommandValue>,

    /// Host command run right after container creation
    #[serde(default)]
    pub hosthook_aftercreation: Option<String>,

    /// Host command run after the postinstall phase
    #[serde(default)]
    pub hosthook_postinstall: Option<String>,

    /// Sidecar command launched with a detached exec once running
    #[serde(default)]
    pub start: Option<String>,

    /// Main entry command; defaults to [`DEFAULT_AGENT_ENTRY`]
    #[serde(default)]
    pub agent: Option<String>,

    /// Liveness/readiness probe configuration
    #[serde(default)]
    pub health: Option<HealthConfig>,

    /// Fields we don't explicitly handle, preserved on rewrite
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A command value that may be a single string or a sequence of strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandValue {
    Single(String),
    Sequence(Vec<String>),
}

impl CommandValue {
    /// Flatten into the list of shell commands to run, in order.
    pub fn commands(&self) -> Vec<&str> {
        match self {
            Self::Single(s) => vec![s.as_str()],
            Self::Sequence(v) => v.iter().map(|s| s.as_str()).collect(),
        }
    }
}

/// Health probe configuration for an agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HealthConfig {
    #[serde(default)]
    pub liveness: Option<ProbeConfig>,
    #[serde(default)]
    pub readiness: Option<ProbeConfig>,
}

/// One probe: a script executed inside the container under `/code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    /// Script name, relative to `/code`; must not contain path separators
    pub script: String,

    /// Seconds between probe attempts
    #[serde(default = "default_probe_interval")]
    pub interval: u64,

    /// Per-attempt timeout in seconds; a timeout counts as a failure
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,

    /// Consecutive failures before the probe transitions to failed
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before the probe transitions to success
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_probe_interval() -> u64 {
    15
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    1
}

impl Manifest {
    /// Load and validate a manifest from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::ReadError {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let manifest: Self =
            serde_json::from_str(&content).map_err(|source| ConfigError::JsonParseError {
                path: path.to_path_buf(),
                source,
            })?;

        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate required fields and probe script names.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "manifest is missing an image".to_string(),
            ));
        }

        if let Some(health) = &self.health {
            for probe in [&health.liveness, &health.readiness].into_iter().flatten() {
                validate_probe_script(&probe.script)?;
            }
        }

        Ok(())
    }

    /// The main entry command for the container.
    pub fn agent_entry(&self) -> &str {
        self.agent.as_deref().unwrap_or(DEFAULT_AGENT_ENTRY)
    }

    /// Declared volumes with `~` expanded on the host side.
    pub fn expanded_volumes(&self) -> Vec<(String, String)> {
        self.volumes
            .iter()
            .map(|(host, container)| {
                (shellexpand::tilde(host).into_owned(), container.clone())
            })
            .collect()
    }
}

/// Reject probe script names that could escape `/code`.
pub fn validate_probe_script(script: &str) -> Result<()> {
    if script.is_empty() {
        return Err(ConfigError::Invalid("probe script is empty".to_string()));
    }
    if script.contains('/') || script.contains('\\') || script.contains("..") {
        return Err(ConfigError::Invalid(format!(
            "unsafe probe script name: {script}"
        )));
    }
    Ok(())
}
