//! Deterministic container identity
//!
//! One container name per (workspace CWD, repo, agent):
//! `ploinky_{repo}_{agent}_{projectBase}_{sha256(cwd)[0..8]}`

use sha2::{Digest, Sha256};
use std::path::Path;

/// Prefix shared by every container this tool manages.
pub const CONTAINER_PREFIX: &str = "ploinky";

/// Replace everything outside `[A-Za-z0-9_.-]` with `_`.
pub fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// First 8 hex chars of the SHA-256 of the workspace path.
pub fn workspace_digest(cwd: &Path) -> String {
    let digest = Sha256::digest(cwd.to_string_lossy().as_bytes());
    format!("{digest:x}")[..8].to_string()
}

/// Deterministic container name for an agent in a workspace.
pub fn container_name(repo: &str, agent: &str, cwd: &Path) -> String {
    let project_base = cwd
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    format!(
        "{}_{}_{}_{}_{}",
        CONTAINER_PREFIX,
        sanitize_component(repo),
        sanitize_component(agent),
        sanitize_component(&project_base),
        workspace_digest(cwd)
    )
}

/// Is this an identifier we accept in URLs and file names?
pub fn is_safe_id(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_deterministic_name() {
        let cwd = PathBuf::from("/tmp/w1");
        let digest = Sha256::digest("/tmp/w1".as_bytes());
        let expected = format!("ploinky_basic_node-dev_w1_{}", &format!("{digest:x}")[..8]);
        assert_eq!(container_name("basic", "node-dev", &cwd), expected);
    }

    #[test]
    fn test_name_is_stable() {
        let cwd = PathBuf::from("/tmp/w1");
        assert_eq!(
            container_name("basic", "demo", &cwd),
            container_name("basic", "demo", &cwd)
        );
    }

    #[test]
    fn test_name_differs_by_workspace() {
        assert_ne!(
            container_name("basic", "demo", &PathBuf::from("/tmp/w1")),
            container_name("basic", "demo", &PathBuf::from("/tmp/w2"))
        );
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("node dev!"), "node_dev_");
        assert_eq!(sanitize_component("ok-1.2_x"), "ok-1.2_x");
        assert_eq!(sanitize_component("a/b"), "a_b");
    }

    #[test]
    fn test_safe_ids() {
        assert!(is_safe_id("webtty"));
        assert!(is_safe_id("node-dev.2"));
        assert!(!is_safe_id(""));
        assert!(!is_safe_id("a/b"));
        assert!(!is_safe_id("a b"));
    }
}
