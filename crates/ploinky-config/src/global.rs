//! Global configuration for ploinky
//!
//! Located at `~/.config/ploinky/config.toml`; every setting can be
//! overridden with a `PLOINKY_*` environment variable.

use crate::{ConfigError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Deployment profile; controls whether agent code is writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Dev,
    Qa,
    Prod,
}

impl Profile {
    /// Agent code is mounted read-write only in dev.
    pub fn code_writable(&self) -> bool {
        matches!(self, Self::Dev)
    }
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Self::Dev),
            "qa" => Ok(Self::Qa),
            "prod" => Ok(Self::Prod),
            other => Err(format!("unknown profile: {other}")),
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dev => write!(f, "dev"),
            Self::Qa => write!(f, "qa"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

/// Global ploinky configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GlobalConfig {
    /// Container runtime ("docker" or "podman"); empty means auto-detect
    pub runtime: String,

    /// Deployment profile
    pub profile: Profile,

    /// Router listen port override
    pub router_port: Option<u16>,

    /// Router PID file path
    pub router_pid_file: Option<PathBuf>,

    /// Router config cache TTL in milliseconds; 0 means reload every read
    pub config_cache_ttl_ms: u64,

    /// Disable TTY allocation on interactive execs
    pub no_tty: bool,

    /// Host directory mounted read-only as `/Agent` in every container
    pub agent_library: Option<PathBuf>,
}

impl GlobalConfig {
    /// Load the config file (if present) and apply env overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Ok(path) if path.exists() => {
                let content =
                    std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadError {
                        path: path.clone(),
                        source,
                    })?;
                toml::from_str(&content)
                    .map_err(|source| ConfigError::TomlParseError { path, source })?
            }
            _ => Self::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Apply `PLOINKY_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(runtime) = std::env::var("PLOINKY_RUNTIME") {
            self.runtime = runtime;
        }
        if let Ok(profile) = std::env::var("PLOINKY_PROFILE") {
            match profile.parse() {
                Ok(p) => self.profile = p,
                Err(e) => tracing::warn!("ignoring PLOINKY_PROFILE: {e}"),
            }
        }
        if let Ok(port) = std::env::var("PLOINKY_ROUTER_PORT") {
            match port.parse() {
                Ok(p) => self.router_port = Some(p),
                Err(_) => tracing::warn!("ignoring non-numeric PLOINKY_ROUTER_PORT: {port}"),
            }
        }
        if let Ok(pid_file) = std::env::var("PLOINKY_ROUTER_PID_FILE") {
            if !pid_file.is_empty() {
                self.router_pid_file = Some(PathBuf::from(pid_file));
            }
        }
        if let Ok(ttl) = std::env::var("PLOINKY_CONFIG_CACHE_TTL") {
            match ttl.parse() {
                Ok(ms) => self.config_cache_ttl_ms = ms,
                Err(_) => tracing::warn!("ignoring non-numeric PLOINKY_CONFIG_CACHE_TTL: {ttl}"),
            }
        }
        if let Ok(no_tty) = std::env::var("PLOINKY_NO_TTY") {
            self.no_tty = no_tty == "1";
        }
    }

    /// TTL for the router's on-disk config cache.
    pub fn config_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.config_cache_ttl_ms)
    }

    /// Path to the global config file.
    pub fn config_path() -> Result<PathBuf> {
        let dirs =
            ProjectDirs::from("", "", "ploinky").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_parsing() {
        assert_eq!("dev".parse::<Profile>().unwrap(), Profile::Dev);
        assert_eq!("QA".parse::<Profile>().unwrap(), Profile::Qa);
        assert_eq!("prod".parse::<Profile>().unwrap(), Profile::Prod);
        assert!("staging".parse::<Profile>().is_err());
    }

    #[test]
    fn test_code_writable_by_profile() {
        assert!(Profile::Dev.code_writable());
        assert!(!Profile::Qa.code_writable());
        assert!(!Profile::Prod.code_writable());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = GlobalConfig {
            runtime: "podman".to_string(),
            profile: Profile::Qa,
            config_cache_ttl_ms: 500,
            ..Default::default()
        };
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: GlobalConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.runtime, "podman");
        assert_eq!(parsed.profile, Profile::Qa);
        assert_eq!(parsed.config_cache_ttl_ms, 500);
    }
}
