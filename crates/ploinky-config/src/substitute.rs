//! Variable substitution for manifest env values
//!
//! Supported forms:
//! - literal values, passed through unchanged
//! - `$VAR` / `${VAR}` — host environment variable
//! - `$ref:NAME` — secret reference, resolved from the workspace secrets

use crate::SecretStore;
use std::collections::BTreeMap;
use std::collections::HashMap;

/// Prefix marking a secret reference in a manifest env value.
pub const SECRET_REF_PREFIX: &str = "$ref:";

/// Resolve one manifest env value against the host env and secret store.
///
/// Unresolvable references resolve to the empty string so that the env
/// hash stays deterministic; the caller decides whether to warn.
pub fn resolve_env_value(value: &str, secrets: &SecretStore) -> String {
    if let Some(name) = value.strip_prefix(SECRET_REF_PREFIX) {
        return secrets.get(name.trim()).unwrap_or_default().to_string();
    }

    if let Some(rest) = value.strip_prefix('$') {
        let name = rest.trim_start_matches('{').trim_end_matches('}');
        if is_env_name(name) {
            return std::env::var(name).unwrap_or_default();
        }
    }

    value.to_string()
}

/// Resolve a full manifest env map to concrete values, sorted by key.
///
/// The sorted map is the input to the env hash, so resolution must be a
/// pure function of (env map, host env, secrets).
pub fn resolve_env(
    env: &HashMap<String, String>,
    secrets: &SecretStore,
) -> BTreeMap<String, String> {
    env.iter()
        .map(|(k, v)| (k.clone(), resolve_env_value(v, secrets)))
        .collect()
}

fn is_env_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
