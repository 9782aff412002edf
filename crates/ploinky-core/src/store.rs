//! Workspace store
//!
//! Persists `agents.json`, `routing.json` and secrets under the
//! workspace `.ploinky/` directory. Every write is whole-file atomic
//! (temp file, fsync, rename). Reads are lock-free and tolerate partial
//! or corrupt files by returning empty data. Read-modify-write cycles
//! are serialized behind a per-workspace mutex.

use crate::{AgentRecord, CoreError, Result};
use ploinky_config::{RoutingTable, SecretStore};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Reserved key in `agents.json` that consumers must ignore but writers
/// must preserve.
pub const CONFIG_KEY: &str = "_config";

/// Store rooted at one workspace directory.
pub struct WorkspaceStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl WorkspaceStore {
    /// Open (and initialize) the store for a workspace.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(".ploinky"))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dot_dir(&self) -> PathBuf {
        self.root.join(".ploinky")
    }

    pub fn agents_path(&self) -> PathBuf {
        self.dot_dir().join("agents.json")
    }

    pub fn routing_path(&self) -> PathBuf {
        self.dot_dir().join("routing.json")
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.dot_dir().join("secrets")
    }

    /// Directory holding per-agent manifests: `.ploinky/repos/<repo>/<agent>/`.
    pub fn repos_dir(&self) -> PathBuf {
        self.dot_dir().join("repos")
    }

    /// Shared rw directory mounted as `/shared` in every agent.
    pub fn shared_dir(&self) -> PathBuf {
        self.root.join("shared")
    }

    /// Per-agent work directory mounted as `/agent`.
    pub fn agent_work_dir(&self, agent: &str) -> PathBuf {
        self.root.join("agents").join(agent)
    }

    /// Workspace-level blob directory.
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    /// Per-agent blob directory.
    pub fn agent_blobs_dir(&self, agent: &str) -> PathBuf {
        self.agent_work_dir(agent).join("blobs")
    }

    // -- agents.json --------------------------------------------------------

    /// Load all agent records, keyed by container name.
    ///
    /// Tolerant: a missing or corrupt file is an empty map, a record that
    /// fails to parse is skipped with a warning.
    pub fn load_agents(&self) -> HashMap<String, AgentRecord> {
        let raw = self.read_json_map(&self.agents_path());
        let mut agents = HashMap::new();
        for (name, value) in raw {
            if name == CONFIG_KEY {
                continue;
            }
            match serde_json::from_value::<AgentRecord>(value) {
                Ok(record) => {
                    agents.insert(name, record);
                }
                Err(e) => {
                    tracing::warn!("skipping unparseable agent record {name}: {e}");
                }
            }
        }
        agents
    }

    /// Insert or replace one agent record.
    pub async fn upsert_agent(&self, record: &AgentRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut raw = self.read_json_map(&self.agents_path());
        raw.insert(
            record.container_name.clone(),
            serde_json::to_value(record)?,
        );
        self.write_json_map(&self.agents_path(), &raw)
    }

    /// Mutate one agent record in place. Errors if the record is absent.
    pub async fn update_agent<F>(&self, container_name: &str, mutate: F) -> Result<AgentRecord>
    where
        F: FnOnce(&mut AgentRecord),
    {
        let _guard = self.write_lock.lock().await;
        let mut raw = self.read_json_map(&self.agents_path());
        let value = raw
            .get(container_name)
            .cloned()
            .ok_or_else(|| CoreError::AgentNotFound(container_name.to_string()))?;
        let mut record: AgentRecord = serde_json::from_value(value)
            .map_err(|e| CoreError::StoreCorrupted(format!("{container_name}: {e}")))?;

        mutate(&mut record);

        raw.insert(container_name.to_string(), serde_json::to_value(&record)?);
        self.write_json_map(&self.agents_path(), &raw)?;
        Ok(record)
    }

    /// Remove one agent record; returns it if present.
    pub async fn remove_agent(&self, container_name: &str) -> Result<Option<AgentRecord>> {
        let _guard = self.write_lock.lock().await;
        let mut raw = self.read_json_map(&self.agents_path());
        let removed = raw.remove(container_name);
        self.write_json_map(&self.agents_path(), &raw)?;
        Ok(removed.and_then(|v| serde_json::from_value(v).ok()))
    }

    // -- routing.json -------------------------------------------------------

    /// Load the routing table; missing or corrupt files yield a default.
    pub fn load_routing(&self) -> RoutingTable {
        match std::fs::read_to_string(self.routing_path()) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(table) => table,
                Err(e) => {
                    tracing::warn!("routing.json is unparseable, using defaults: {e}");
                    RoutingTable::default()
                }
            },
            Err(_) => RoutingTable::default(),
        }
    }

    pub async fn save_routing(&self, table: &RoutingTable) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let encoded = serde_json::to_vec_pretty(table)?;
        atomic_write(&self.routing_path(), &encoded)?;
        Ok(())
    }

    /// Read-modify-write on the routing table.
    pub async fn update_routing<F>(&self, mutate: F) -> Result<RoutingTable>
    where
        F: FnOnce(&mut RoutingTable),
    {
        let _guard = self.write_lock.lock().await;
        let mut table = self.load_routing();
        mutate(&mut table);
        let encoded = serde_json::to_vec_pretty(&table)?;
        atomic_write(&self.routing_path(), &encoded)?;
        Ok(table)
    }

    // -- secrets ------------------------------------------------------------

    pub fn load_secrets(&self) -> SecretStore {
        match SecretStore::load(&self.secrets_path()) {
            Ok(secrets) => secrets,
            Err(e) => {
                tracing::warn!("failed to read secrets: {e}");
                SecretStore::default()
            }
        }
    }

    // -- helpers ------------------------------------------------------------

    fn read_json_map(&self, path: &Path) -> serde_json::Map<String, Value> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return serde_json::Map::new(),
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!("{} is not a JSON object, treating as empty", path.display());
                serde_json::Map::new()
            }
        }
    }

    fn write_json_map(&self, path: &Path, map: &serde_json::Map<String, Value>) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(&Value::Object(map.clone()))?;
        atomic_write(path, &encoded)?;
        Ok(())
    }
}

/// Whole-file atomic write: temp file in the same directory, fsync,
/// rename over the target.
pub fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string()),
        std::process::id()
    ));

    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }

    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}
