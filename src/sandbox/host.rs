//! Unisolated execution directly on the host.

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::process::{spawn_captured, spawn_terminal};
use super::{
    CommandDescriptor, Execution, ProcessHandle, SandboxBackend, TerminalSession,
    host_working_dir, prepare_root,
};
use crate::error::SandboxError;
use crate::platform::CommandSpec;

/// Runs commands as plain host processes under `sh -c`, inside the tenant root.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBackend;

impl HostBackend {
    /// Creates the backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Spawns `desc` on the host with captured output and attaches the process.
///
/// Shared with the ephemeral backend's on-host exception list.
pub(crate) fn run_on_host(desc: &mut CommandDescriptor) -> Result<Execution, SandboxError> {
    let spec = host_spec(desc)?;
    let spawned = spawn_captured(&spec, desc.options().timeout, None, ())?;

    debug!(pid = ?spawned.pid, "Host process spawned");
    desc.attach(ProcessHandle::new(spawned.pid, None, spawned.exited));
    Ok(Execution::new(spawned.pid, spawned.done))
}

/// Spawns `desc` on the host attached to a pseudo-terminal.
///
/// Only reachable through the ephemeral backend's on-host exception list; the host
/// backend itself offers no terminals.
pub(crate) fn run_on_host_terminal(
    desc: &mut CommandDescriptor,
) -> Result<TerminalSession, SandboxError> {
    let spec = host_spec(desc)?;
    let (cols, rows) = (desc.options().terminal_cols, desc.options().terminal_rows);
    let (session, exited) = spawn_terminal(&spec, cols, rows, ())?;

    debug!(pid = ?session.pid(), "Host terminal spawned");
    desc.attach(ProcessHandle::new(session.pid(), None, exited));
    Ok(session)
}

fn host_spec(desc: &CommandDescriptor) -> Result<CommandSpec, SandboxError> {
    desc.validate()?;
    let root = prepare_root(desc.root())?;
    let cwd = host_working_dir(&root, desc.options().working_dir.as_deref())?;

    let script = format!("exec {}", desc.command_line());
    Ok(CommandSpec::new("sh")
        .args(["-c", script.as_str()])
        .envs(&desc.options().env)
        .cwd(cwd))
}

#[async_trait]
impl SandboxBackend for HostBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    fn supports_terminal(&self) -> bool {
        false
    }

    #[instrument(skip(self, desc), fields(tenant = %desc.tenant(), command = %desc.command()))]
    async fn execute(&self, desc: &mut CommandDescriptor) -> Result<Execution, SandboxError> {
        run_on_host(desc)
    }

    async fn execute_terminal(
        &self,
        _desc: &mut CommandDescriptor,
    ) -> Result<TerminalSession, SandboxError> {
        Err(SandboxError::TerminalUnsupported(self.name()))
    }
}
