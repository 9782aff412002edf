//! Typed component events
//!
//! Events are the only integration surface of the supervisor and the
//! monitor; callers subscribe to a bounded channel and must not peek
//! into private state.

use std::time::Duration;

/// Events emitted by the [`crate::Supervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started {
        name: String,
        pid: Option<u32>,
    },
    Exited {
        name: String,
        exit_code: Option<i64>,
    },
    Stopped {
        name: String,
    },
    Restarting {
        name: String,
        delay: Duration,
        attempt: u32,
    },
    Error {
        name: String,
        message: String,
    },
    HealthOk {
        name: String,
    },
    HealthFailed {
        name: String,
        failures: u32,
    },
    CircuitOpen {
        name: String,
    },
    CircuitReset {
        name: String,
    },
    MaxRestarts {
        name: String,
    },
}

impl SupervisorEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::Started { name, .. }
            | Self::Exited { name, .. }
            | Self::Stopped { name }
            | Self::Restarting { name, .. }
            | Self::Error { name, .. }
            | Self::HealthOk { name }
            | Self::HealthFailed { name, .. }
            | Self::CircuitOpen { name }
            | Self::CircuitReset { name }
            | Self::MaxRestarts { name } => name,
        }
    }
}

/// Events emitted by the [`crate::ContainerMonitor`] and the probe loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    ContainerStarted {
        name: String,
    },
    ContainerExited {
        name: String,
        exit_code: Option<i64>,
    },
    /// Liveness verdict changed
    HealthChanged {
        name: String,
        healthy: bool,
    },
    /// Readiness probe failed; no restart, the router gates on this
    ReadinessWarning {
        name: String,
    },
    /// Liveness failure triggered a container restart
    ProbeRestart {
        name: String,
        retry: u32,
        delay: Duration,
    },
    /// A probe became unusable (unsafe script name, missing config)
    ProbeFault {
        name: String,
        message: String,
    },
}
