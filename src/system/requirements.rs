//! Host requirement checks.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::BackendKind;
use crate::error::{Result, SystemRequirementsError};

/// Directories searched for platform tools, after `$PATH`.
const SYSTEM_DIRS: [&str; 6] = [
    "/usr/local/bin",
    "/usr/local/sbin",
    "/usr/bin",
    "/bin",
    "/usr/sbin",
    "/sbin",
];

/// Results of the host checks for one backend.
#[derive(Debug, Clone)]
pub struct SystemRequirements {
    /// Backend the checks were run for.
    pub backend: BackendKind,
    /// Kernel release string (e.g., "6.8.0-45-generic")
    pub kernel_release: String,
    /// Whether cgroups v2 is mounted
    pub cgroups_v2: bool,
    /// Every tool the backend invokes, with its resolved path
    pub tools: Vec<(String, PathBuf)>,
}

/// Platform tools each backend shells out to.
#[must_use]
pub fn required_tools(backend: BackendKind, use_sudo: bool) -> Vec<&'static str> {
    let mut tools = match backend {
        BackendKind::None => Vec::new(),
        BackendKind::Ephemeral => vec!["lxc-execute", "lxc-stop"],
        BackendKind::Persistent => {
            vec![
                "lxc-create",
                "lxc-start",
                "lxc-wait",
                "lxc-stop",
                "lxc-destroy",
                "lxc-attach",
                "kill",
            ]
        }
        BackendKind::PersistentAlternate => vec!["docker", "kill"],
    };
    if use_sudo && !tools.is_empty() {
        tools.push("sudo");
    }
    tools
}

/// Runs every check relevant to `backend`.
///
/// # Errors
///
/// Returns the first failing requirement.
pub fn check_all(backend: BackendKind, use_sudo: bool) -> Result<SystemRequirements> {
    let kernel_release = kernel_release()?;

    let cgroups_v2 = match backend {
        BackendKind::Ephemeral | BackendKind::Persistent => check_cgroups_v2()?,
        BackendKind::None | BackendKind::PersistentAlternate => {
            Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
        }
    };

    let tools = required_tools(backend, use_sudo)
        .into_iter()
        .map(|tool| {
            resolve_tool(tool)
                .map(|path| (tool.to_string(), path))
                .ok_or_else(|| SystemRequirementsError::ToolMissing {
                    tool: tool.to_string(),
                    backend: backend.to_string(),
                })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    debug!(%backend, %kernel_release, tools = tools.len(), "System requirements satisfied");
    Ok(SystemRequirements {
        backend,
        kernel_release,
        cgroups_v2,
        tools,
    })
}

/// Finds `tool` on `$PATH` or in the standard system directories.
#[must_use]
pub fn resolve_tool(tool: &str) -> Option<PathBuf> {
    if tool.contains('/') {
        let path = PathBuf::from(tool);
        return path.is_file().then_some(path);
    }

    let from_env = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
        .unwrap_or_default();

    from_env
        .into_iter()
        .chain(SYSTEM_DIRS.iter().map(PathBuf::from))
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

/// Reads the running kernel release.
///
/// # Errors
///
/// Returns error if the uname syscall fails.
pub fn kernel_release() -> Result<String> {
    let uname = nix::sys::utsname::uname().map_err(|e| SystemRequirementsError::ReadFailed {
        context: "uname syscall".to_string(),
        source: std::io::Error::from_raw_os_error(e as i32),
    })?;
    Ok(uname.release().to_string_lossy().to_string())
}

/// Check cgroups v2 is available.
///
/// # Errors
///
/// Returns error if cgroups v2 is not available.
pub fn check_cgroups_v2() -> Result<bool> {
    let controllers_path = Path::new("/sys/fs/cgroup/cgroup.controllers");

    if !controllers_path.exists() {
        return Err(SystemRequirementsError::CgroupsV2Unavailable.into());
    }

    // Verify we can read it (permissions check)
    fs::read_to_string(controllers_path).map_err(|e| SystemRequirementsError::ReadFailed {
        context: "cgroups v2 controllers file".to_string(),
        source: e,
    })?;

    Ok(true)
}
