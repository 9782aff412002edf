//! CLI-based container runtime for Docker and Podman
//!
//! Uses direct CLI commands instead of an API socket for:
//! - Automatic credential handling (via ~/.docker/config.json)
//! - Proper user context handling (no permissions issues)
//! - Works with Docker alternatives (Colima, Rancher, Lima, OrbStack)

use crate::{
    BindMount, ContainerDetails, ContainerId, ContainerRuntime, ContainerStatus, CreateSpec,
    DisposableSpec, EventAction, EventFilter, EventStream, ExecOutcome, ExecSpec, ImageShell,
    MountInfo, PortBinding, Result, RuntimeError, RuntimeEvent, RuntimeKind,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

/// CLI-based container runtime for Docker and Podman.
pub struct CliRuntime {
    /// Command to use ("docker" or "podman")
    cmd: String,
    /// Runtime kind
    kind: RuntimeKind,
    /// Shell probe results, cached by image digest
    shell_cache: Mutex<HashMap<String, ImageShell>>,
}

impl CliRuntime {
    /// Connect to a runtime, verifying the CLI responds.
    pub async fn connect(kind: RuntimeKind) -> Result<Self> {
        let runtime = Self {
            cmd: kind.to_string(),
            kind,
            shell_cache: Mutex::new(HashMap::new()),
        };

        runtime
            .run_cmd(&["version", "--format", "{{.Client.Version}}"])
            .await
            .map_err(|e| RuntimeError::ConnectionError(format!("{kind}: {e}")))?;
        Ok(runtime)
    }

    /// Run a command and get stdout
    async fn run_cmd(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.cmd)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::CommandFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CommandFailed(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Render `-v` flags; SELinux relabeling suffixes are podman-only.
    fn mount_arg(&self, mount: &BindMount) -> String {
        let suffix = match (self.kind, mount.read_only) {
            (RuntimeKind::Podman, false) => ":z",
            (RuntimeKind::Podman, true) => ":ro,z",
            (RuntimeKind::Docker, false) => "",
            (RuntimeKind::Docker, true) => ":ro",
        };
        format!("-v={}:{}{}", mount.source, mount.target, suffix)
    }

    fn port_arg(port: &PortBinding) -> String {
        format!(
            "-p={}:{}:{}",
            port.host_ip, port.host_port, port.container_port
        )
    }

    fn env_args(env: &[(String, String)]) -> Vec<String> {
        env.iter().map(|(k, v)| format!("--env={k}={v}")).collect()
    }

    fn is_not_found(err: &RuntimeError) -> bool {
        match err {
            RuntimeError::CommandFailed(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("no such object")
                    || msg.contains("no such container")
                    || msg.contains("does not exist")
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn exists(&self, name: &str) -> Result<bool> {
        match self
            .run_cmd(&["container", "inspect", "--format", "{{.Id}}", name])
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if Self::is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn running(&self, name: &str) -> Result<bool> {
        match self
            .run_cmd(&["container", "inspect", "--format", "{{.State.Running}}", name])
            .await
        {
            Ok(out) => Ok(out.trim() == "true"),
            Err(e) if Self::is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, name: &str) -> Result<ContainerDetails> {
        let output = self
            .run_cmd(&["container", "inspect", "--format", "json", name])
            .await
            .map_err(|e| {
                if Self::is_not_found(&e) {
                    RuntimeError::ContainerNotFound(name.to_string())
                } else {
                    e
                }
            })?;

        let inspect: Vec<serde_json::Value> = serde_json::from_str(&output)
            .map_err(|e: serde_json::Error| RuntimeError::ParseError(e.to_string()))?;
        let info = inspect
            .first()
            .ok_or_else(|| RuntimeError::ContainerNotFound(name.to_string()))?;

        Ok(parse_inspect(info))
    }

    async fn create(&self, spec: &CreateSpec) -> Result<ContainerId> {
        let mut args: Vec<String> = vec!["create".to_string(), format!("--name={}", spec.name)];

        if spec.interactive {
            args.push("-i".to_string());
        }

        for mount in &spec.mounts {
            args.push(self.mount_arg(mount));
        }
        for port in &spec.ports {
            args.push(Self::port_arg(port));
        }
        for (k, v) in &spec.labels {
            args.push(format!("--label={k}={v}"));
        }
        args.extend(Self::env_args(&spec.env));

        if let Some(ref wd) = spec.working_dir {
            args.push(format!("--workdir={wd}"));
        }

        args.push(spec.image.clone());
        args.extend(spec.cmd.clone());

        let args_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = self.run_cmd(&args_refs).await?;
        Ok(ContainerId::new(output.trim()))
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run_cmd(&["start", name]).await?;
        Ok(())
    }

    async fn stop(&self, name: &str, timeout: Option<u32>) -> Result<()> {
        let timeout_str = timeout.unwrap_or(10).to_string();
        self.run_cmd(&["stop", "-t", &timeout_str, name]).await?;
        Ok(())
    }

    async fn kill(&self, name: &str, signal: &str) -> Result<()> {
        self.run_cmd(&["kill", &format!("--signal={signal}"), name])
            .await?;
        Ok(())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        if force {
            self.run_cmd(&["rm", "-f", name]).await?;
        } else {
            self.run_cmd(&["rm", name]).await?;
        }
        Ok(())
    }

    async fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecOutcome> {
        let mut args = vec!["exec".to_string()];

        if spec.interactive {
            args.push("-i".to_string());
        }
        if spec.tty {
            args.push("-t".to_string());
        }
        if spec.detach {
            args.push("-d".to_string());
        }
        if let Some(ref wd) = spec.working_dir {
            args.push(format!("--workdir={wd}"));
        }
        args.extend(Self::env_args(&spec.env));

        args.push(name.to_string());
        args.extend(spec.argv.clone());

        let args_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = Command::new(&self.cmd)
            .args(&args_refs)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::ExecError(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        Ok(ExecOutcome {
            exit_code: output.status.code().unwrap_or(-1) as i64,
            output: format!("{stdout}{stderr}"),
        })
    }

    async fn run_disposable(&self, spec: &DisposableSpec) -> Result<ExecOutcome> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];

        for mount in &spec.mounts {
            args.push(self.mount_arg(mount));
        }
        args.extend(Self::env_args(&spec.env));
        if let Some(ref wd) = spec.working_dir {
            args.push(format!("--workdir={wd}"));
        }

        args.push(spec.image.clone());
        args.extend(spec.argv.clone());

        let args_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = Command::new(&self.cmd)
            .args(&args_refs)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::ExecError(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        Ok(ExecOutcome {
            exit_code: output.status.code().unwrap_or(-1) as i64,
            output: format!("{stdout}{stderr}"),
        })
    }

    async fn events(&self, filter: &EventFilter) -> Result<EventStream> {
        let mut args = vec![
            "events".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            "--filter".to_string(),
            "type=container".to_string(),
        ];
        if let Some(ref label) = filter.label {
            args.push("--filter".to_string());
            args.push(format!("label={label}"));
        }

        let mut child = Command::new(&self.cmd)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::CommandFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::CommandFailed("events stream has no stdout".into()))?;
        let lines = BufReader::new(stdout).lines();

        let stream = futures::stream::unfold((child, lines), |(child, mut lines)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match parse_event(&line) {
                            Some(event) => return Some((Ok(event), (child, lines))),
                            None => continue,
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(RuntimeError::IoError(e)), (child, lines))),
                }
            }
        });

        Ok(EventStream::new(Box::pin(stream)))
    }

    async fn probe_image_shell(&self, image: &str) -> Result<ImageShell> {
        // Cache key is the image digest so retagged images re-probe
        let digest = match self
            .run_cmd(&["image", "inspect", "--format", "{{.Id}}", image])
            .await
        {
            Ok(id) => id.trim().to_string(),
            Err(_) => image.to_string(),
        };

        {
            let cache = self.shell_cache.lock().await;
            if let Some(shell) = cache.get(&digest) {
                return Ok(*shell);
            }
        }

        let mut found = ImageShell::NoShell;
        for candidate in ImageShell::candidates() {
            let path = candidate.path().unwrap_or_default();
            let probe = self
                .run_cmd(&["run", "--rm", "--entrypoint", path, image, "-c", "true"])
                .await;
            if probe.is_ok() {
                found = candidate;
                break;
            }
        }

        self.shell_cache.lock().await.insert(digest, found);
        Ok(found)
    }

    fn kind(&self) -> RuntimeKind {
        self.kind
    }
}

/// Parse one `inspect --format json` entry.
fn parse_inspect(info: &serde_json::Value) -> ContainerDetails {
    let state = info.get("State").and_then(serde_json::Value::as_object);
    let config = info.get("Config").and_then(serde_json::Value::as_object);

    let status = state
        .and_then(|s| s.get("Status"))
        .and_then(serde_json::Value::as_str)
        .map(ContainerStatus::from)
        .unwrap_or(ContainerStatus::Unknown);

    let exit_code = state
        .and_then(|s| s.get("ExitCode"))
        .and_then(serde_json::Value::as_i64);

    let name = info
        .get("Name")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("")
        .trim_start_matches('/')
        .to_string();

    let image = config
        .and_then(|c| c.get("Image"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("")
        .to_string();

    let labels: HashMap<String, String> = config
        .and_then(|c| c.get("Labels"))
        .and_then(serde_json::Value::as_object)
        .map(|l| {
            l.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let env: Vec<String> = config
        .and_then(|c| c.get("Env"))
        .and_then(serde_json::Value::as_array)
        .map(|e| {
            e.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let working_dir = config
        .and_then(|c| c.get("WorkingDir"))
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let mounts: Vec<MountInfo> = info
        .get("Mounts")
        .and_then(serde_json::Value::as_array)
        .map(|mounts| {
            mounts
                .iter()
                .filter_map(|m| {
                    Some(MountInfo {
                        source: m.get("Source")?.as_str()?.to_string(),
                        destination: m.get("Destination")?.as_str()?.to_string(),
                        read_only: !m.get("RW").and_then(serde_json::Value::as_bool).unwrap_or(true),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let ports = parse_port_map(info);

    ContainerDetails {
        id: ContainerId::new(
            info.get("Id")
                .and_then(serde_json::Value::as_str)
                .unwrap_or(""),
        ),
        name,
        image,
        status,
        exit_code,
        labels,
        env,
        mounts,
        ports,
        working_dir,
    }
}

/// Parse `NetworkSettings.Ports` into flat bindings.
fn parse_port_map(info: &serde_json::Value) -> Vec<PortBinding> {
    let mut out = Vec::new();
    let Some(ports) = info
        .pointer("/NetworkSettings/Ports")
        .and_then(serde_json::Value::as_object)
    else {
        return out;
    };

    for (key, bindings) in ports {
        // Keys look like "7000/tcp"
        let Some(container_port) = key
            .split('/')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        let Some(bindings) = bindings.as_array() else {
            continue;
        };
        for binding in bindings {
            let host_ip = binding
                .get("HostIp")
                .and_then(serde_json::Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or("127.0.0.1")
                .to_string();
            let Some(host_port) = binding
                .get("HostPort")
                .and_then(serde_json::Value::as_str)
                .and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            out.push(PortBinding {
                host_ip,
                host_port,
                container_port,
            });
        }
    }
    out
}

/// Parse one line of `events --format '{{json .}}'`.
fn parse_event(line: &str) -> Option<RuntimeEvent> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;

    let action = value
        .get("Action")
        .or_else(|| value.get("status"))
        .and_then(serde_json::Value::as_str)?;

    let attributes: HashMap<String, String> = value
        .pointer("/Actor/Attributes")
        .and_then(serde_json::Value::as_object)
        .map(|attrs| {
            attrs
                .iter()
                .map(|(k, v)| {
                    let v = v
                        .as_str()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| v.to_string());
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default();

    let name = attributes.get("name").cloned().unwrap_or_default();
    let timestamp = value
        .get("time")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);

    Some(RuntimeEvent {
        action: EventAction::parse(action),
        name,
        attributes,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_line() {
        let line = r#"{"Type":"container","Action":"die","Actor":{"ID":"abc","Attributes":{"name":"ploinky_basic_demo_w_00000000","exitCode":"1"}},"time":1710000000}"#;
        let event = parse_event(line).unwrap();
        assert_eq!(event.action, EventAction::Die);
        assert_eq!(event.name, "ploinky_basic_demo_w_00000000");
        assert_eq!(event.exit_code(), Some(1));
        assert_eq!(event.timestamp, 1710000000);
    }

    #[test]
    fn test_parse_event_health_status() {
        let line = r#"{"Type":"container","Action":"health_status: unhealthy","Actor":{"ID":"abc","Attributes":{"name":"c1"}},"time":1}"#;
        let event = parse_event(line).unwrap();
        assert!(matches!(
            event.action,
            EventAction::HealthStatus(crate::HealthState::Unhealthy)
        ));
    }

    #[test]
    fn test_parse_event_garbage_skipped() {
        assert!(parse_event("not json").is_none());
        assert!(parse_event(r#"{"Type":"container"}"#).is_none());
    }

    #[test]
    fn test_parse_inspect_minimal() {
        let info: serde_json::Value = serde_json::from_str(
            r#"{
                "Id": "abc123",
                "Name": "/ploinky_basic_demo_w_00000000",
                "State": {"Status": "running", "Running": true, "ExitCode": 0},
                "Config": {
                    "Image": "node:20",
                    "Labels": {"ploinky.envhash": "deadbeef"},
                    "Env": ["A=1"],
                    "WorkingDir": "/code"
                },
                "Mounts": [
                    {"Source": "/host/code", "Destination": "/code", "RW": true}
                ],
                "NetworkSettings": {
                    "Ports": {"7000/tcp": [{"HostIp": "127.0.0.1", "HostPort": "7000"}]}
                }
            }"#,
        )
        .unwrap();

        let details = parse_inspect(&info);
        assert_eq!(details.name, "ploinky_basic_demo_w_00000000");
        assert_eq!(details.status, ContainerStatus::Running);
        assert_eq!(details.labels.get("ploinky.envhash").unwrap(), "deadbeef");
        assert_eq!(details.mounts.len(), 1);
        assert!(!details.mounts[0].read_only);
        assert_eq!(details.ports.len(), 1);
        assert_eq!(details.ports[0].host_port, 7000);
        assert_eq!(details.working_dir.as_deref(), Some("/code"));
    }

    #[test]
    fn test_mount_arg_selinux() {
        let docker = CliRuntime {
            cmd: "docker".to_string(),
            kind: RuntimeKind::Docker,
            shell_cache: Mutex::new(HashMap::new()),
        };
        let podman = CliRuntime {
            cmd: "podman".to_string(),
            kind: RuntimeKind::Podman,
            shell_cache: Mutex::new(HashMap::new()),
        };

        let rw = BindMount::rw("/h", "/c");
        let ro = BindMount::ro("/h", "/c");

        assert_eq!(docker.mount_arg(&rw), "-v=/h:/c");
        assert_eq!(docker.mount_arg(&ro), "-v=/h:/c:ro");
        assert_eq!(podman.mount_arg(&rw), "-v=/h:/c:z");
        assert_eq!(podman.mount_arg(&ro), "-v=/h:/c:ro,z");
    }
}
