//! Commands attached to the tenant's long-lived pooled instance.
//!
//! Every execution first acquires a lease from the [`InstancePool`]; the lease is
//! handed to the spawned process and dropped when the process exits, so the
//! instance stays up exactly as long as something is attached to it.

use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tracing::{debug, instrument};

use super::process::{HookFuture, TimeoutHook, spawn_captured, spawn_terminal};
use super::{
    CommandDescriptor, Execution, ProcessHandle, SandboxBackend, TerminalSession,
    absorb_benign, exec_request, prepare_root,
};
use crate::error::SandboxError;
use crate::platform::{CommandSpec, Platform};
use crate::pool::{InstanceLease, InstancePool};

/// Backend that pools one running instance per tenant.
#[derive(Debug, Clone)]
pub struct PersistentBackend {
    pool: InstancePool,
    platform: Arc<dyn Platform>,
    run_as: Option<String>,
}

impl PersistentBackend {
    /// Creates the backend. `platform` must be the one `pool` was built with.
    #[must_use]
    pub fn new(pool: InstancePool, platform: Arc<dyn Platform>, run_as: Option<String>) -> Self {
        Self {
            pool,
            platform,
            run_as,
        }
    }

    /// The instance pool.
    #[must_use]
    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// Acquires the tenant's instance and builds the attach invocation.
    async fn attach(
        &self,
        desc: &CommandDescriptor,
        interactive: bool,
    ) -> Result<(InstanceLease, CommandSpec, String), SandboxError> {
        desc.validate()?;
        let root = prepare_root(desc.root())?;
        let request = exec_request(desc, self.run_as.as_deref(), interactive)?;

        let lease = self.pool.acquire(desc.tenant(), &root).await?;
        let spec = self.platform.attach_spec(lease.instance_name(), &request);
        debug!(instance = %lease.instance_name(), exec_id = %request.exec_id, "Attaching to pooled instance");
        Ok((lease, spec, request.exec_id))
    }

    fn signal_hook(&self, instance: &str, exec_id: &str) -> TimeoutHook {
        let platform = Arc::clone(&self.platform);
        let instance = instance.to_string();
        let exec_id = exec_id.to_string();
        Box::new(move |pid: Option<u32>| -> HookFuture {
            Box::pin(async move {
                if let Some(pid) = pid {
                    let killed = platform
                        .signal_attached(&instance, &exec_id, pid, Signal::SIGKILL)
                        .await;
                    if let Err(err) = killed {
                        debug!(pid, error = %err, "Kill after timeout failed");
                    }
                }
            })
        })
    }
}

#[async_trait]
impl SandboxBackend for PersistentBackend {
    fn name(&self) -> &'static str {
        "persistent"
    }

    fn supports_terminal(&self) -> bool {
        true
    }

    #[instrument(skip(self, desc), fields(tenant = %desc.tenant(), command = %desc.command()))]
    async fn execute(&self, desc: &mut CommandDescriptor) -> Result<Execution, SandboxError> {
        let (lease, spec, exec_id) = self.attach(desc, false).await?;
        let instance = lease.instance_name().to_string();
        let spawned = spawn_captured(
            &spec,
            desc.options().timeout,
            Some(self.signal_hook(&instance, &exec_id)),
            lease,
        )?;

        desc.attach(
            ProcessHandle::new(spawned.pid, Some(instance), spawned.exited).with_exec_id(exec_id),
        );
        Ok(Execution::new(spawned.pid, spawned.done))
    }

    #[instrument(skip(self, desc), fields(tenant = %desc.tenant(), command = %desc.command()))]
    async fn execute_terminal(
        &self,
        desc: &mut CommandDescriptor,
    ) -> Result<TerminalSession, SandboxError> {
        let (lease, spec, exec_id) = self.attach(desc, true).await?;
        let instance = lease.instance_name().to_string();
        let (cols, rows) = (desc.options().terminal_cols, desc.options().terminal_rows);
        let (session, exited) = spawn_terminal(&spec, cols, rows, lease)?;

        desc.attach(ProcessHandle::new(session.pid(), Some(instance), exited).with_exec_id(exec_id));
        Ok(session)
    }

    /// Signals the attached command through the platform. A reaped process is never
    /// signalled; its pid may have been recycled.
    #[instrument(skip(self, desc), fields(command = %desc.command()))]
    async fn kill(&self, desc: &CommandDescriptor, signal: Signal) -> Result<(), SandboxError> {
        let Some(process) = desc.process() else {
            debug!("No process attached, nothing to kill");
            return Ok(());
        };
        if !process.is_running() {
            debug!("Process already reaped, nothing to kill");
            return Ok(());
        }
        let (Some(pid), Some(instance)) = (process.pid(), process.instance()) else {
            return Ok(());
        };
        let exec_id = process.exec_id().unwrap_or_default();
        absorb_benign(
            self.platform
                .signal_attached(instance, exec_id, pid, signal)
                .await,
        )
    }
}
