//! One throwaway isolated instance per command.
//!
//! Each call leases an address, wraps the command in a one-shot instance that
//! bind-mounts the tenant root at `/workspace`, and returns the address when the
//! wrapper exits. Instances are never reused.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tempfile::TempPath;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::host::{run_on_host, run_on_host_terminal};
use super::process::{HookFuture, TimeoutHook, spawn_captured, spawn_terminal};
use super::{
    CommandDescriptor, Execution, ProcessHandle, SandboxBackend, TerminalSession,
    absorb_benign, exec_request, prepare_root,
};
use crate::config::ManagerConfig;
use crate::error::SandboxError;
use crate::network::{AddressAllocator, AddressLease};
use crate::platform::{InstanceSpec, Launch, Platform};

/// Per-process resources released when the wrapper exits.
type Teardown = (AddressLease, Option<TempPath>);

/// Backend that runs every command in a fresh instance.
#[derive(Debug, Clone)]
pub struct EphemeralBackend {
    platform: Arc<dyn Platform>,
    allocator: AddressAllocator,
    name_prefix: String,
    prefix_len: u8,
    gateway: std::net::Ipv4Addr,
    bridge: String,
    run_as: Option<String>,
    host_commands: HashSet<String>,
}

impl EphemeralBackend {
    /// Creates the backend from the deployment configuration.
    #[must_use]
    pub fn new(
        platform: Arc<dyn Platform>,
        allocator: AddressAllocator,
        config: &ManagerConfig,
    ) -> Self {
        Self {
            platform,
            allocator,
            name_prefix: config.name_prefix.clone(),
            prefix_len: config.network.prefix_len,
            gateway: config.network.gateway,
            bridge: config.network.bridge.clone(),
            run_as: config.run_as.clone(),
            host_commands: config.host_commands.iter().cloned().collect(),
        }
    }

    /// The allocator addresses are leased from.
    #[must_use]
    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    /// Returns `true` if `command` bypasses isolation.
    #[must_use]
    pub fn runs_on_host(&self, command: &str) -> bool {
        self.host_commands.contains(command)
    }

    /// Leases an address and prepares the wrapped invocation.
    ///
    /// The returned guard owns the address lease and any scratch files; dropping it
    /// is the teardown.
    fn launch(
        &self,
        desc: &CommandDescriptor,
        interactive: bool,
    ) -> Result<(InstanceSpec, Launch, Teardown), SandboxError> {
        desc.validate()?;
        let root = prepare_root(desc.root())?;
        let request = exec_request(desc, self.run_as.as_deref(), interactive)?;

        let address = self.allocator.acquire()?;
        let suffix = Uuid::new_v4().simple().to_string();
        let instance = InstanceSpec {
            name: format!(
                "{}{}-{}",
                self.name_prefix,
                desc.tenant().name_fragment(),
                &suffix[..8]
            ),
            root,
            address: address.addr(),
            prefix_len: self.prefix_len,
            gateway: self.gateway,
            bridge: self.bridge.clone(),
        };
        debug!(instance = %instance.name, address = %instance.address, "Launching ephemeral instance");

        let mut launch = self.platform.execute_spec(&instance, &request)?;
        let guard = (address, launch.scratch.take());
        Ok((instance, launch, guard))
    }

    fn stop_hook(&self, name: &str) -> TimeoutHook {
        let platform = Arc::clone(&self.platform);
        let name = name.to_string();
        Box::new(move |_pid: Option<u32>| -> HookFuture {
            Box::pin(async move {
                if let Err(err) = platform.stop(&name, None).await {
                    debug!(instance = %name, error = %err, "Stop after timeout failed");
                }
            })
        })
    }
}

#[async_trait]
impl SandboxBackend for EphemeralBackend {
    fn name(&self) -> &'static str {
        "ephemeral"
    }

    fn supports_terminal(&self) -> bool {
        true
    }

    #[instrument(skip(self, desc), fields(tenant = %desc.tenant(), command = %desc.command()))]
    async fn execute(&self, desc: &mut CommandDescriptor) -> Result<Execution, SandboxError> {
        if self.runs_on_host(desc.command()) {
            debug!("Command is on the host exception list, bypassing isolation");
            return run_on_host(desc);
        }

        let (instance, launch, guard) = self.launch(desc, false)?;
        let hook = self.stop_hook(&instance.name);
        let spawned = spawn_captured(&launch.command, desc.options().timeout, Some(hook), guard)?;

        desc.attach(ProcessHandle::new(
            spawned.pid,
            Some(instance.name),
            spawned.exited,
        ));
        Ok(Execution::new(spawned.pid, spawned.done))
    }

    #[instrument(skip(self, desc), fields(tenant = %desc.tenant(), command = %desc.command()))]
    async fn execute_terminal(
        &self,
        desc: &mut CommandDescriptor,
    ) -> Result<TerminalSession, SandboxError> {
        if self.runs_on_host(desc.command()) {
            debug!("Command is on the host exception list, bypassing isolation");
            return run_on_host_terminal(desc);
        }

        let (instance, launch, guard) = self.launch(desc, true)?;
        let (cols, rows) = (desc.options().terminal_cols, desc.options().terminal_rows);
        let (session, exited) = spawn_terminal(&launch.command, cols, rows, guard)?;

        desc.attach(ProcessHandle::new(session.pid(), Some(instance.name), exited));
        Ok(session)
    }

    /// Stops the instance through the platform. The spawned process is the isolation
    /// wrapper, so signalling its pid would not reach the command.
    #[instrument(skip(self, desc), fields(command = %desc.command()))]
    async fn kill(&self, desc: &CommandDescriptor, signal: Signal) -> Result<(), SandboxError> {
        let Some(process) = desc.process() else {
            return Ok(());
        };
        let Some(instance) = process.instance() else {
            // on-host exception: a real child of ours
            return absorb_benign(desc.kill(signal));
        };
        if !process.is_running() {
            debug!(%instance, "Already exited, nothing to kill");
            return Ok(());
        }

        debug!(%instance, ?signal, "Stopping ephemeral instance");
        match self.platform.stop(instance, None).await {
            Ok(()) => Ok(()),
            // the wrapper exited between the check and the stop
            Err(err) if !process.is_running() => {
                debug!(error = %err, "Platform stop failed after the wrapper exited");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn destroy(&self, desc: &mut CommandDescriptor) -> Result<(), SandboxError> {
        self.kill(desc, Signal::SIGKILL).await
    }
}
