//! Test support utilities for ploinky-core
//!
//! Provides a MockRuntime and helpers for unit testing the lifecycle
//! engine, monitor, prober and supervisor without a real Docker/Podman
//! runtime.

use async_trait::async_trait;
use ploinky_provider::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Records which methods were called on the mock
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Exists { name: String },
    Running { name: String },
    Inspect { name: String },
    Create { name: String, image: String },
    Start { name: String },
    Stop { name: String, timeout: Option<u32> },
    Kill { name: String, signal: String },
    Remove { name: String, force: bool },
    Exec { name: String, argv: Vec<String> },
    RunDisposable { image: String, argv: Vec<String> },
    Events,
    ProbeShell { image: String },
}

/// In-memory state of one mocked container
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub running: bool,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortBinding>,
}

/// Configurable mock container runtime for testing
pub struct MockRuntime {
    pub calls: Mutex<Vec<MockCall>>,
    containers: tokio::sync::Mutex<HashMap<String, MockContainer>>,
    /// Per-call exec response queue (exit code, output); falls back to (0, "")
    pub exec_responses: Mutex<Vec<(i64, String)>>,
    /// Per-call disposable-run response queue; falls back to (0, "")
    pub disposable_responses: Mutex<Vec<(i64, String)>>,
    /// Error injected into start calls
    pub start_error: Mutex<Option<String>>,
    /// Shell reported by probe_image_shell
    pub shell: Mutex<ImageShell>,
    event_senders: Mutex<Vec<mpsc::UnboundedSender<RuntimeEvent>>>,
    create_counter: Mutex<u64>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            containers: tokio::sync::Mutex::new(HashMap::new()),
            exec_responses: Mutex::new(Vec::new()),
            disposable_responses: Mutex::new(Vec::new()),
            start_error: Mutex::new(None),
            shell: Mutex::new(ImageShell::Sh),
            event_senders: Mutex::new(Vec::new()),
            create_counter: Mutex::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// The mock as a trait object, for APIs taking `Arc<dyn ContainerRuntime>`.
    pub fn dyn_clone(self: &Arc<Self>) -> Arc<dyn ContainerRuntime> {
        self.clone()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Count of create calls so far.
    pub fn create_count(&self) -> usize {
        self.get_calls()
            .iter()
            .filter(|c| matches!(c, MockCall::Create { .. }))
            .count()
    }

    /// Seed a container into the mock's world.
    pub async fn add_container(&self, name: &str, running: bool) {
        let mut containers = self.containers.lock().await;
        containers.insert(
            name.to_string(),
            MockContainer {
                id: format!("mock_{name}"),
                image: "mock-image".to_string(),
                cmd: Vec::new(),
                running,
                labels: HashMap::new(),
                ports: Vec::new(),
            },
        );
    }

    pub async fn set_label(&self, name: &str, key: &str, value: &str) {
        let mut containers = self.containers.lock().await;
        if let Some(container) = containers.get_mut(name) {
            container.labels.insert(key.to_string(), value.to_string());
        }
    }

    pub async fn container(&self, name: &str) -> Option<MockContainer> {
        self.containers.lock().await.get(name).cloned()
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.containers
            .lock()
            .await
            .get(name)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn push_exec_response(&self, exit_code: i64, output: &str) {
        self.exec_responses
            .lock()
            .unwrap()
            .push((exit_code, output.to_string()));
    }

    pub fn push_disposable_response(&self, exit_code: i64, output: &str) {
        self.disposable_responses
            .lock()
            .unwrap()
            .push((exit_code, output.to_string()));
    }

    pub fn set_shell(&self, shell: ImageShell) {
        *self.shell.lock().unwrap() = shell;
    }

    /// Inject an event into every open event stream.
    pub fn push_event(&self, event: RuntimeEvent) {
        let senders = self.event_senders.lock().unwrap();
        for sender in senders.iter() {
            let _ = sender.send(event.clone());
        }
    }

    fn pop_response(queue: &Mutex<Vec<(i64, String)>>) -> (i64, String) {
        let mut queue = queue.lock().unwrap();
        if queue.is_empty() {
            (0, String::new())
        } else {
            queue.remove(0)
        }
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn exists(&self, name: &str) -> Result<bool> {
        self.record(MockCall::Exists {
            name: name.to_string(),
        });
        Ok(self.containers.lock().await.contains_key(name))
    }

    async fn running(&self, name: &str) -> Result<bool> {
        self.record(MockCall::Running {
            name: name.to_string(),
        });
        Ok(self.is_running(name).await)
    }

    async fn inspect(&self, name: &str) -> Result<ContainerDetails> {
        self.record(MockCall::Inspect {
            name: name.to_string(),
        });
        let containers = self.containers.lock().await;
        let container = containers
            .get(name)
            .ok_or_else(|| RuntimeError::ContainerNotFound(name.to_string()))?;

        Ok(ContainerDetails {
            id: ContainerId::new(&container.id),
            name: name.to_string(),
            image: container.image.clone(),
            status: if container.running {
                ContainerStatus::Running
            } else {
                ContainerStatus::Exited
            },
            exit_code: None,
            labels: container.labels.clone(),
            env: Vec::new(),
            mounts: Vec::new(),
            ports: container.ports.clone(),
            working_dir: None,
        })
    }

    async fn create(&self, spec: &CreateSpec) -> Result<ContainerId> {
        self.record(MockCall::Create {
            name: spec.name.clone(),
            image: spec.image.clone(),
        });

        let id = {
            let mut counter = self.create_counter.lock().unwrap();
            *counter += 1;
            format!("mock_{}_{}", spec.name, *counter)
        };

        let mut containers = self.containers.lock().await;
        containers.insert(
            spec.name.clone(),
            MockContainer {
                id: id.clone(),
                image: spec.image.clone(),
                cmd: spec.cmd.clone(),
                running: false,
                labels: spec.labels.clone(),
                ports: spec.ports.clone(),
            },
        );
        Ok(ContainerId::new(id))
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.record(MockCall::Start {
            name: name.to_string(),
        });
        if let Some(message) = self.start_error.lock().unwrap().clone() {
            return Err(RuntimeError::CommandFailed(message));
        }
        let mut containers = self.containers.lock().await;
        match containers.get_mut(name) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(RuntimeError::ContainerNotFound(name.to_string())),
        }
    }

    async fn stop(&self, name: &str, timeout: Option<u32>) -> Result<()> {
        self.record(MockCall::Stop {
            name: name.to_string(),
            timeout,
        });
        let mut containers = self.containers.lock().await;
        if let Some(container) = containers.get_mut(name) {
            container.running = false;
        }
        Ok(())
    }

    async fn kill(&self, name: &str, signal: &str) -> Result<()> {
        self.record(MockCall::Kill {
            name: name.to_string(),
            signal: signal.to_string(),
        });
        let mut containers = self.containers.lock().await;
        if let Some(container) = containers.get_mut(name) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        self.record(MockCall::Remove {
            name: name.to_string(),
            force,
        });
        self.containers.lock().await.remove(name);
        Ok(())
    }

    async fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecOutcome> {
        self.record(MockCall::Exec {
            name: name.to_string(),
            argv: spec.argv.clone(),
        });
        let (exit_code, output) = Self::pop_response(&self.exec_responses);
        Ok(ExecOutcome { exit_code, output })
    }

    async fn run_disposable(&self, spec: &DisposableSpec) -> Result<ExecOutcome> {
        self.record(MockCall::RunDisposable {
            image: spec.image.clone(),
            argv: spec.argv.clone(),
        });
        let (exit_code, output) = Self::pop_response(&self.disposable_responses);
        Ok(ExecOutcome { exit_code, output })
    }

    async fn events(&self, _filter: &EventFilter) -> Result<EventStream> {
        self.record(MockCall::Events);
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_senders.lock().unwrap().push(tx);

        use futures::StreamExt;
        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx).map(Ok);
        Ok(EventStream::new(Box::pin(stream)))
    }

    async fn probe_image_shell(&self, image: &str) -> Result<ImageShell> {
        self.record(MockCall::ProbeShell {
            image: image.to_string(),
        });
        Ok(*self.shell.lock().unwrap())
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }
}
