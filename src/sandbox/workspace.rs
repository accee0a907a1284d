//! Tenant root validation and path mapping.
//!
//! A tenant's filesystem root is bind-mounted read-write at `/workspace` inside every
//! isolated instance. Before any root reaches a platform tool:
//! 1. Path must be absolute (no relative paths)
//! 2. Path must not be a symlink at top level
//! 3. Path is canonicalized to resolve any symlinks below it
//! 4. Path must be a directory
//!
//! Working directories on a [`CommandDescriptor`](crate::sandbox::CommandDescriptor)
//! are interpreted relative to the mount point and may not escape it.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, instrument};

use crate::error::SandboxError;

/// The fixed mount point for tenant roots inside the sandbox.
pub const WORKSPACE_MOUNT_POINT: &str = "/workspace";

/// Validates a tenant root and returns its canonical form.
///
/// # Errors
///
/// Returns `SandboxError::InvalidCommand` if the path is relative, a symlink,
/// missing, or not a directory.
#[instrument(fields(root = %root.display()))]
pub fn prepare_root(root: &Path) -> Result<PathBuf, SandboxError> {
    if !root.is_absolute() {
        return Err(SandboxError::InvalidCommand(format!(
            "tenant root must be absolute: {}",
            root.display()
        )));
    }

    if root.is_symlink() {
        return Err(SandboxError::InvalidCommand(format!(
            "tenant root cannot be a symlink: {}",
            root.display()
        )));
    }

    let canonical = root
        .canonicalize()
        .map_err(|e| SandboxError::io(format!("resolving {}", root.display()), &e))?;

    if !canonical.is_dir() {
        return Err(SandboxError::InvalidCommand(format!(
            "tenant root must be a directory: {}",
            canonical.display()
        )));
    }

    debug!(canonical = %canonical.display(), "Tenant root validated");
    Ok(canonical)
}

/// Strips the mount point and rejects anything that would climb out of it.
fn relative_working_dir(working_dir: Option<&Path>) -> Result<PathBuf, SandboxError> {
    let Some(dir) = working_dir else {
        return Ok(PathBuf::new());
    };

    let relative = dir.strip_prefix(WORKSPACE_MOUNT_POINT).unwrap_or(dir);
    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(SandboxError::InvalidCommand(format!(
                    "working directory escapes the workspace: {}",
                    dir.display()
                )));
            }
        }
    }
    Ok(clean)
}

/// Working directory as seen from inside the sandbox.
///
/// # Errors
///
/// Returns `SandboxError::InvalidCommand` if `working_dir` contains `..`.
pub fn sandbox_working_dir(working_dir: Option<&Path>) -> Result<PathBuf, SandboxError> {
    Ok(Path::new(WORKSPACE_MOUNT_POINT).join(relative_working_dir(working_dir)?))
}

/// Working directory on the host, for commands that bypass isolation.
///
/// # Errors
///
/// Returns `SandboxError::InvalidCommand` if `working_dir` contains `..`.
pub fn host_working_dir(root: &Path, working_dir: Option<&Path>) -> Result<PathBuf, SandboxError> {
    Ok(root.join(relative_working_dir(working_dir)?))
}
