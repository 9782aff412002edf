//! On-disk config cache
//!
//! The router never queries the runtime per request; it reads the
//! workspace's `agents.json` and `routing.json` and caches them for the
//! configured TTL. A TTL of zero means every read hits the disk.

use ploinky_config::RoutingTable;
use ploinky_core::{AgentRecord, WorkspaceStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Immutable view over the workspace config.
pub struct Snapshot {
    pub routing: RoutingTable,
    pub agents: HashMap<String, AgentRecord>,
}

impl Snapshot {
    /// Resolve an agent by route name, alias, agent name or container.
    pub fn resolve_agent(&self, name: &str) -> Option<&AgentRecord> {
        if let Some(entry) = self.routing.resolve(name) {
            if let Some(ref container) = entry.container {
                if let Some(record) = self.agents.get(container) {
                    return Some(record);
                }
            }
        }

        self.agents
            .values()
            .find(|r| r.agent_name == name || r.alias.as_deref() == Some(name))
            .or_else(|| self.agents.get(name))
    }
}

/// TTL cache over [`WorkspaceStore`] reads.
pub struct ConfigCache {
    store: Arc<WorkspaceStore>,
    ttl: Duration,
    inner: Mutex<Option<(Instant, Arc<Snapshot>)>>,
}

impl ConfigCache {
    pub fn new(store: Arc<WorkspaceStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            inner: Mutex::new(None),
        }
    }

    /// Current snapshot, reloading from disk when the TTL elapsed.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((loaded_at, ref snapshot)) = *inner {
                if !self.ttl.is_zero() && loaded_at.elapsed() < self.ttl {
                    return Arc::clone(snapshot);
                }
            }
        }

        let snapshot = Arc::new(Snapshot {
            routing: self.store.load_routing(),
            agents: self.store.load_agents(),
        });

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *inner = Some((Instant::now(), Arc::clone(&snapshot)));
        snapshot
    }
}
