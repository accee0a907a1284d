//! Backend selection.
//!
//! [`SandboxManager`] owns the process-wide state (address allocator, instance pool)
//! and the one backend chosen by configuration. Request handlers hold a manager and
//! never see which backend is behind it.

use std::sync::Arc;

use nix::sys::signal::Signal;
use tracing::{debug, info, instrument};

use crate::config::{BackendKind, ManagerConfig};
use crate::error::{ConfigError, SandboxError};
use crate::network::AddressAllocator;
use crate::platform::{DockerPlatform, LxcPlatform, Platform};
use crate::pool::{InstancePool, PoolSettings};
use crate::sandbox::{
    CommandDescriptor, EphemeralBackend, Execution, HostBackend, PersistentBackend,
    SandboxBackend, TerminalSession,
};

/// The configured sandbox backend plus the state it shares.
///
/// # Example
///
/// ```no_run
/// use workspace_sandbox::config::{BackendKind, ManagerConfig};
/// use workspace_sandbox::manager::SandboxManager;
/// use workspace_sandbox::pool::TenantId;
/// use workspace_sandbox::sandbox::CommandDescriptor;
///
/// # async fn demo() -> Result<(), workspace_sandbox::error::Error> {
/// let config = ManagerConfig::default().with_backend(BackendKind::Persistent);
/// let manager = SandboxManager::new(config)?;
///
/// let mut desc = CommandDescriptor::new(TenantId::new("fs1"), "/srv/fs1", "make");
/// let output = manager.execute(&mut desc).await?.wait().await?;
/// println!("exit code {}", output.exit_code);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SandboxManager {
    config: ManagerConfig,
    backend: Arc<dyn SandboxBackend>,
    allocator: AddressAllocator,
    pool: Option<InstancePool>,
}

impl SandboxManager {
    /// Builds the selected backend on its native platform. Validation happens in
    /// [`SandboxManager::with_platform`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an invalid backend/feature combination or address block.
    pub fn new(config: ManagerConfig) -> Result<Self, ConfigError> {
        let platform: Arc<dyn Platform> = match config.backend {
            BackendKind::PersistentAlternate => {
                Arc::new(DockerPlatform::new(config.use_sudo, config.image.clone()))
            }
            _ => Arc::new(LxcPlatform::new(config.use_sudo, config.runtime_dir.clone())),
        };
        Self::with_platform(config, platform)
    }

    /// Validates `config` and builds the selected backend on `platform`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an invalid backend/feature combination or address block.
    #[instrument(skip_all, fields(backend = %config.backend, platform = platform.name()))]
    pub fn with_platform(
        config: ManagerConfig,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let allocator = AddressAllocator::new(&config.network);

        let mut pool = None;
        let backend: Arc<dyn SandboxBackend> = match config.backend {
            BackendKind::None => Arc::new(HostBackend::new()),
            BackendKind::Ephemeral => Arc::new(EphemeralBackend::new(
                Arc::clone(&platform),
                allocator.clone(),
                &config,
            )),
            BackendKind::Persistent | BackendKind::PersistentAlternate => {
                let instances = InstancePool::new(
                    Arc::clone(&platform),
                    allocator.clone(),
                    PoolSettings::from_config(&config),
                );
                pool = Some(instances.clone());
                Arc::new(PersistentBackend::new(
                    instances,
                    platform,
                    config.run_as.clone(),
                ))
            }
        };

        info!(backend = %config.backend, "Sandbox backend selected");
        Ok(Self {
            config,
            backend,
            allocator,
            pool,
        })
    }

    /// The selected backend kind.
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        self.config.backend
    }

    /// The configuration the manager was built from.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The backend serving requests.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    /// The shared address allocator.
    #[must_use]
    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    /// The instance pool, for the persistent backends.
    #[must_use]
    pub fn pool(&self) -> Option<&InstancePool> {
        self.pool.as_ref()
    }

    /// Whether the backend can open terminal sessions.
    #[must_use]
    pub fn supports_terminal(&self) -> bool {
        self.backend.supports_terminal()
    }

    /// Runs the descriptor's command.
    ///
    /// # Errors
    ///
    /// Propagates the backend's spawn or lifecycle error.
    pub async fn execute(&self, desc: &mut CommandDescriptor) -> Result<Execution, SandboxError> {
        self.backend.execute(desc).await
    }

    /// Opens a terminal session.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::TerminalUnsupported` when the backend has no terminals.
    pub async fn execute_terminal(
        &self,
        desc: &mut CommandDescriptor,
    ) -> Result<TerminalSession, SandboxError> {
        if !self.backend.supports_terminal() {
            return Err(SandboxError::TerminalUnsupported(self.backend.name()));
        }
        self.backend.execute_terminal(desc).await
    }

    /// Signals the descriptor's process.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures other than a missing process.
    pub async fn kill(&self, desc: &CommandDescriptor, signal: Signal) -> Result<(), SandboxError> {
        self.backend.kill(desc, signal).await
    }

    /// Releases the descriptor's backend resources.
    ///
    /// # Errors
    ///
    /// Propagates the backend's teardown error.
    pub async fn destroy(&self, desc: &mut CommandDescriptor) -> Result<(), SandboxError> {
        self.backend.destroy(desc).await
    }

    /// Stops every idle pooled instance.
    ///
    /// # Errors
    ///
    /// Returns the last platform stop error.
    pub async fn shutdown(&self) -> Result<(), SandboxError> {
        match &self.pool {
            Some(pool) => pool.shutdown().await,
            None => {
                debug!("No pooled instances to stop");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_host_backend() {
        let manager = SandboxManager::new(ManagerConfig::default()).expect("valid config");
        assert_eq!(manager.kind(), BackendKind::None);
        assert_eq!(manager.backend().name(), "none");
        assert!(!manager.supports_terminal());
        assert!(manager.pool().is_none());
    }

    #[test]
    fn test_persistent_builds_pool() {
        let config = ManagerConfig::default().with_backend(BackendKind::Persistent);
        let manager = SandboxManager::new(config).expect("valid config");
        assert_eq!(manager.backend().name(), "persistent");
        assert!(manager.supports_terminal());
        assert!(manager.pool().is_some_and(InstancePool::is_empty));
    }

    #[test]
    fn test_quota_conflict_fails_fast() {
        let config = ManagerConfig::default()
            .with_backend(BackendKind::PersistentAlternate)
            .with_storage_quota(true);
        assert!(matches!(
            SandboxManager::new(config),
            Err(ConfigError::QuotaConflict { .. })
        ));
    }
}
