//! Mount composition for agent containers
//!
//! The lifecycle engine is the only place that decides what gets mounted
//! where; runtime-specific flag rendering (SELinux suffixes) is the
//! adapter's concern.

use ploinky_config::Profile;
use ploinky_provider::BindMount;
use std::path::Path;

/// Inputs to mount composition for one agent.
#[derive(Debug, Clone)]
pub struct MountOptions<'a> {
    /// Host directory mounted read-only as `/Agent`
    pub agent_library: Option<&'a Path>,
    /// Workspace shared directory, `/shared` in every agent
    pub shared_dir: &'a Path,
    /// Workspace CWD, mounted at the same path for passthrough
    pub cwd: &'a Path,
    /// Agent code directory, `/code`
    pub code_dir: &'a Path,
    /// Agent work directory, `/agent`
    pub agent_work_dir: &'a Path,
    /// Optional skills directory, `/code/.AchillesSkills`
    pub skills_dir: Option<&'a Path>,
    /// Controls whether `/code` is writable
    pub profile: Profile,
}

/// Compose the standard mount set for an agent container.
pub fn compose_mounts(opts: &MountOptions<'_>) -> Vec<BindMount> {
    let mut mounts = Vec::new();

    if let Some(library) = opts.agent_library {
        mounts.push(BindMount::ro(library.to_string_lossy(), "/Agent"));
    }

    mounts.push(BindMount::rw(opts.shared_dir.to_string_lossy(), "/shared"));
    mounts.push(BindMount::rw(
        opts.cwd.to_string_lossy(),
        opts.cwd.to_string_lossy(),
    ));

    let code = opts.code_dir.to_string_lossy();
    if opts.profile.code_writable() {
        mounts.push(BindMount::rw(code, "/code"));
    } else {
        mounts.push(BindMount::ro(code, "/code"));
    }

    mounts.push(BindMount::rw(
        opts.agent_work_dir.to_string_lossy(),
        "/agent",
    ));

    if let Some(skills) = opts.skills_dir {
        mounts.push(BindMount::ro(
            skills.to_string_lossy(),
            "/code/.AchillesSkills",
        ));
    }

    mounts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn opts(profile: Profile) -> (PathBuf, PathBuf, PathBuf, PathBuf, Profile) {
        (
            PathBuf::from("/w/shared"),
            PathBuf::from("/w"),
            PathBuf::from("/w/.ploinky/repos/basic/demo"),
            PathBuf::from("/w/agents/demo"),
            profile,
        )
    }

    #[test]
    fn test_dev_profile_code_is_writable() {
        let (shared, cwd, code, work, profile) = opts(Profile::Dev);
        let mounts = compose_mounts(&MountOptions {
            agent_library: None,
            shared_dir: &shared,
            cwd: &cwd,
            code_dir: &code,
            agent_work_dir: &work,
            skills_dir: None,
            profile,
        });

        let code_mount = mounts.iter().find(|m| m.target == "/code").unwrap();
        assert!(!code_mount.read_only);
    }

    #[test]
    fn test_prod_profile_code_is_read_only() {
        let (shared, cwd, code, work, profile) = opts(Profile::Prod);
        let mounts = compose_mounts(&MountOptions {
            agent_library: None,
            shared_dir: &shared,
            cwd: &cwd,
            code_dir: &code,
            agent_work_dir: &work,
            skills_dir: None,
            profile,
        });

        let code_mount = mounts.iter().find(|m| m.target == "/code").unwrap();
        assert!(code_mount.read_only);
    }

    #[test]
    fn test_standard_targets_present() {
        let (shared, cwd, code, work, profile) = opts(Profile::Dev);
        let library = PathBuf::from("/usr/share/ploinky/Agent");
        let skills = PathBuf::from("/w/skills");
        let mounts = compose_mounts(&MountOptions {
            agent_library: Some(&library),
            shared_dir: &shared,
            cwd: &cwd,
            code_dir: &code,
            agent_work_dir: &work,
            skills_dir: Some(&skills),
            profile,
        });

        let targets: Vec<&str> = mounts.iter().map(|m| m.target.as_str()).collect();
        assert_eq!(
            targets,
            vec![
                "/Agent",
                "/shared",
                "/w",
                "/code",
                "/agent",
                "/code/.AchillesSkills"
            ]
        );

        let library_mount = &mounts[0];
        assert!(library_mount.read_only);
        let cwd_mount = mounts.iter().find(|m| m.target == "/w").unwrap();
        assert!(!cwd_mount.read_only);
    }
}
