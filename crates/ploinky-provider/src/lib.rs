//! Container runtime trait and implementations for ploinky
//!
//! This crate provides an abstraction over container runtimes (Docker,
//! Podman) with a consistent API for the lifecycle engine, the container
//! monitor and the health prober. The concrete CLI syntax lives here;
//! callers pass structured specs and argv arrays.

mod cli_runtime;
mod error;
mod types;

pub use cli_runtime::CliRuntime;
pub use error::*;
pub use types::*;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Trait for container runtimes (Docker, Podman).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Does a container with this name exist (in any state)?
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Is the named container currently running?
    async fn running(&self, name: &str) -> Result<bool>;

    /// Detailed inspection of a container by name or id
    async fn inspect(&self, name: &str) -> Result<ContainerDetails>;

    /// Create a container; does not start it
    async fn create(&self, spec: &CreateSpec) -> Result<ContainerId>;

    /// Start a created or stopped container
    async fn start(&self, name: &str) -> Result<()>;

    /// Stop a container: SIGTERM, then SIGKILL after `timeout` seconds
    async fn stop(&self, name: &str, timeout: Option<u32>) -> Result<()>;

    /// Send a signal to the container's init process
    async fn kill(&self, name: &str, signal: &str) -> Result<()>;

    /// Remove a container
    async fn remove(&self, name: &str, force: bool) -> Result<()>;

    /// Execute a command in a running container
    async fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecOutcome>;

    /// Run a one-shot disposable container (install hooks)
    async fn run_disposable(&self, spec: &DisposableSpec) -> Result<ExecOutcome>;

    /// Open the runtime's event stream; ends on runtime EOF and is
    /// restartable by calling again
    async fn events(&self, filter: &EventFilter) -> Result<EventStream>;

    /// Determine which shell (if any) the image provides
    async fn probe_image_shell(&self, image: &str) -> Result<ImageShell>;

    /// Which runtime this is
    fn kind(&self) -> RuntimeKind;
}

/// Lazily-parsed, restartable stream of runtime events.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = Result<RuntimeEvent>> + Send>>,
}

impl EventStream {
    pub fn new(inner: Pin<Box<dyn Stream<Item = Result<RuntimeEvent>> + Send>>) -> Self {
        Self { inner }
    }

    /// Next event; `None` means the underlying stream ended.
    pub async fn next(&mut self) -> Option<Result<RuntimeEvent>> {
        use futures::StreamExt;
        self.inner.next().await
    }
}

/// Test if a runtime CLI is available and responsive.
pub async fn test_runtime_connectivity(kind: RuntimeKind) -> bool {
    CliRuntime::connect(kind).await.is_ok()
}

/// Select the runtime for this process.
///
/// `preference` comes from config (`PLOINKY_RUNTIME`); when empty, docker
/// is probed first, then podman. At most one runtime is selected per
/// process start.
pub async fn detect_runtime(preference: &str) -> Result<CliRuntime> {
    match preference {
        "docker" => return CliRuntime::connect(RuntimeKind::Docker).await,
        "podman" => return CliRuntime::connect(RuntimeKind::Podman).await,
        "" => {}
        other => {
            return Err(RuntimeError::ConfigError(format!(
                "unknown runtime preference: {other}"
            )))
        }
    }

    tracing::info!("No runtime configured, auto-detecting...");
    match CliRuntime::connect(RuntimeKind::Docker).await {
        Ok(runtime) => {
            tracing::info!("Auto-detected runtime: docker");
            Ok(runtime)
        }
        Err(docker_err) => match CliRuntime::connect(RuntimeKind::Podman).await {
            Ok(runtime) => {
                tracing::info!("Auto-detected runtime: podman");
                Ok(runtime)
            }
            Err(_) => Err(RuntimeError::ConnectionError(format!(
                "no container runtime responded (docker: {docker_err})"
            ))),
        },
    }
}
