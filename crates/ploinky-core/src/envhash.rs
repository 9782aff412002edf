//! Environment hash
//!
//! The env hash is the sole trigger for container re-creation: resolve
//! every env reference to its concrete value, JSON-encode after key
//! sort, SHA-256. Code changes alone never invalidate a container.

use ploinky_config::{resolve_env, Manifest, SecretStore};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hash a resolved env map. Pure and stable: key order of the input
/// cannot matter because the map is ordered.
pub fn compute_env_hash(resolved: &BTreeMap<String, String>) -> String {
    let encoded = serde_json::to_string(resolved).unwrap_or_default();
    format!("{:x}", Sha256::digest(encoded.as_bytes()))
}

/// Resolve a manifest env against secrets and hash it.
pub fn manifest_env_hash(manifest: &Manifest, secrets: &SecretStore) -> (BTreeMap<String, String>, String) {
    let resolved = resolve_env(&manifest.env, secrets);
    let hash = compute_env_hash(&resolved);
    (resolved, hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_key_order_does_not_matter() {
        let secrets = SecretStore::default();

        let mut a = HashMap::new();
        a.insert("A".to_string(), "1".to_string());
        a.insert("B".to_string(), "2".to_string());

        let mut b = HashMap::new();
        b.insert("B".to_string(), "2".to_string());
        b.insert("A".to_string(), "1".to_string());

        let hash_a = compute_env_hash(&resolve_env(&a, &secrets));
        let hash_b = compute_env_hash(&resolve_env(&b, &secrets));
        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn test_value_change_changes_hash() {
        let secrets = SecretStore::default();
        let mut env = HashMap::new();
        env.insert("A".to_string(), "1".to_string());
        let first = compute_env_hash(&resolve_env(&env, &secrets));

        env.insert("A".to_string(), "3".to_string());
        let second = compute_env_hash(&resolve_env(&env, &secrets));
        assert_ne!(first, second);
    }

    #[test]
    fn test_secret_resolution_feeds_hash() {
        let mut env = HashMap::new();
        env.insert("TOKEN".to_string(), "$ref:API_TOKEN".to_string());

        let mut secrets = SecretStore::default();
        secrets.insert("API_TOKEN", "one");
        let first = compute_env_hash(&resolve_env(&env, &secrets));

        secrets.insert("API_TOKEN", "two");
        let second = compute_env_hash(&resolve_env(&env, &secrets));
        assert_ne!(first, second);
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let resolved = BTreeMap::new();
        let hash = compute_env_hash(&resolved);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
