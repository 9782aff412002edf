//! Routing table persisted as `.ploinky/routing.json`
//!
//! The router resolves path prefixes against this table; the lifecycle
//! side writes it when agents are announced.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The static routing configuration for one workspace.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoutingTable {
    /// Port the router listens on
    #[serde(default = "default_router_port")]
    pub port: u16,

    /// The singular static route; also names the default webchat agent
    #[serde(default, rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_route: Option<StaticRoute>,

    /// Per-agent routes, keyed by route name
    #[serde(default)]
    pub routes: HashMap<String, RouteEntry>,

    /// Fields we don't explicitly handle, preserved on rewrite
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_router_port() -> u16 {
    8080
}

/// The static file route and default agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StaticRoute {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// One agent route.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Fields we don't explicitly handle, preserved on rewrite
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl RoutingTable {
    /// Look up a route by name or alias.
    pub fn resolve(&self, name: &str) -> Option<&RouteEntry> {
        if let Some(entry) = self.routes.get(name) {
            return Some(entry);
        }
        self.routes
            .values()
            .find(|e| e.alias.as_deref() == Some(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_unknown_fields() {
        let json = r#"{
            "port": 9090,
            "static": {"agent": "webchat-agent", "hostPath": "/site"},
            "routes": {
                "demo": {"hostPath": "/demo", "container": "ploinky_basic_demo_w_00000000", "extraKey": 1}
            },
            "futureTopLevel": true
        }"#;

        let table: RoutingTable = serde_json::from_str(json).unwrap();
        assert_eq!(table.port, 9090);
        assert_eq!(table.static_route.as_ref().unwrap().agent, "webchat-agent");

        let out = serde_json::to_value(&table).unwrap();
        assert_eq!(out["futureTopLevel"], true);
        assert_eq!(out["routes"]["demo"]["extraKey"], 1);
        assert_eq!(out["static"]["agent"], "webchat-agent");
    }

    #[test]
    fn test_default_port() {
        let table: RoutingTable = serde_json::from_str("{}").unwrap();
        assert_eq!(table.port, 8080);
    }

    #[test]
    fn test_resolve_by_name_and_alias() {
        let mut table = RoutingTable::default();
        table.routes.insert(
            "demo".to_string(),
            RouteEntry {
                alias: Some("d".to_string()),
                ..Default::default()
            },
        );

        assert!(table.resolve("demo").is_some());
        assert!(table.resolve("d").is_some());
        assert!(table.resolve("missing").is_none());
    }
}
