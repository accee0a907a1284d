//! Deployment configuration for the sandbox manager.
//!
//! Configuration is read once at startup (YAML via `serde_yaml`, or built in code
//! with the `with_*` helpers) and validated before any backend is constructed.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Which sandbox backend serves tenant commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Commands run directly on the host, no isolation.
    #[default]
    None,
    /// One throwaway isolated instance per command or terminal.
    Ephemeral,
    /// One long-lived instance per tenant, reference counted.
    Persistent,
    /// Persistent pooling on the alternate container runtime.
    PersistentAlternate,
}

impl BackendKind {
    /// Short name used in logs and diagnostics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ephemeral => "ephemeral",
            Self::Persistent => "persistent",
            Self::PersistentAlternate => "persistent-alternate",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shortest prefix accepted for the address block.
pub const MIN_PREFIX_LEN: u8 = 8;
/// Longest prefix that still leaves room for a gateway and one instance.
pub const MAX_PREFIX_LEN: u8 = 30;

/// Subnet mask for `prefix_len`; anything past 32 is treated as a host route.
#[must_use]
pub fn prefix_mask(prefix_len: u8) -> u32 {
    let host_bits = 32u32.saturating_sub(u32::from(prefix_len));
    u32::MAX.checked_shl(host_bits).unwrap_or(0)
}

/// Private address block handed out to isolated instances.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// First address of the block; scanning starts just after it.
    pub base: Ipv4Addr,
    /// Subnet prefix length of the block.
    pub prefix_len: u8,
    /// Gateway assigned to every instance. Never leased.
    pub gateway: Ipv4Addr,
    /// Additional addresses that must never be leased.
    pub reserved: Vec<Ipv4Addr>,
    /// Host bridge (or runtime network) instances are attached to.
    pub bridge: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base: Ipv4Addr::new(10, 0, 3, 0),
            prefix_len: 24,
            gateway: Ipv4Addr::new(10, 0, 3, 1),
            reserved: Vec::new(),
            bridge: String::from("lxcbr0"),
        }
    }
}

impl NetworkConfig {
    /// Subnet mask derived from the prefix length.
    #[must_use]
    pub fn mask(&self) -> u32 {
        prefix_mask(self.prefix_len)
    }

    /// Returns `true` if `addr` belongs to this subnet.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = self.mask();
        u32::from(addr) & mask == u32::from(self.base) & mask
    }
}

/// Configuration for the sandbox manager.
///
/// # Example
///
/// ```
/// use workspace_sandbox::config::{BackendKind, ManagerConfig};
/// use std::time::Duration;
///
/// let config = ManagerConfig::default()
///     .with_backend(BackendKind::Persistent)
///     .with_idle_expiry(Duration::from_secs(30))
///     .with_run_as("ubuntu");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Selected backend.
    pub backend: BackendKind,
    /// Address block for instance networking.
    pub network: NetworkConfig,
    /// Prefix for generated instance names.
    pub name_prefix: String,
    /// Grace period before an unused persistent instance is stopped. Zero stops immediately.
    pub idle_expiry_secs: u64,
    /// Upper bound handed to the platform stop command. Zero lets the tool decide.
    pub stop_wait_secs: u64,
    /// How long to wait for a started instance to report running.
    pub start_timeout_secs: u64,
    /// Host user that attached commands run as.
    pub run_as: Option<String>,
    /// Commands that run on the host instead of inside an ephemeral sandbox.
    pub host_commands: Vec<String>,
    /// Per-tenant storage quotas are enforced by the filesystem layer.
    pub storage_quota: bool,
    /// Image used by the alternate runtime.
    pub image: String,
    /// Prefix platform commands with `sudo`.
    pub use_sudo: bool,
    /// Directory for generated instance configuration files.
    pub runtime_dir: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            network: NetworkConfig::default(),
            name_prefix: String::from("wsbox-"),
            idle_expiry_secs: 0,
            stop_wait_secs: 0,
            start_timeout_secs: 30,
            run_as: None,
            host_commands: Vec::new(),
            storage_quota: false,
            image: String::from("ubuntu:24.04"),
            use_sudo: true,
            runtime_dir: std::env::temp_dir().join("wsbox"),
        }
    }
}

impl ManagerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Load` if the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&content).map_err(|e| match e {
            ConfigError::Load { reason, .. } => ConfigError::Load {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Parses configuration from a YAML document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Load` if the document is malformed.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Load {
            path: String::from("<inline>"),
            reason: e.to_string(),
        })
    }

    /// Sets the backend.
    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the address block.
    #[must_use]
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Sets the instance name prefix.
    #[must_use]
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Sets the idle-expiry grace period.
    #[must_use]
    pub fn with_idle_expiry(mut self, expiry: Duration) -> Self {
        self.idle_expiry_secs = expiry.as_secs();
        self
    }

    /// Sets the stop wait bound.
    #[must_use]
    pub fn with_stop_wait(mut self, wait: Duration) -> Self {
        self.stop_wait_secs = wait.as_secs();
        self
    }

    /// Sets the host user for attached commands.
    #[must_use]
    pub fn with_run_as(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    /// Adds a command that bypasses ephemeral isolation.
    #[must_use]
    pub fn with_host_command(mut self, command: impl Into<String>) -> Self {
        self.host_commands.push(command.into());
        self
    }

    /// Enables or disables storage quotas.
    #[must_use]
    pub fn with_storage_quota(mut self, enabled: bool) -> Self {
        self.storage_quota = enabled;
        self
    }

    /// Enables or disables `sudo` for platform commands.
    #[must_use]
    pub fn with_sudo(mut self, enabled: bool) -> Self {
        self.use_sudo = enabled;
        self
    }

    /// Sets the directory for generated instance config files.
    #[must_use]
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    /// Idle expiry as a `Duration`, or `None` for immediate stop.
    #[must_use]
    pub fn idle_expiry(&self) -> Option<Duration> {
        (self.idle_expiry_secs > 0).then(|| Duration::from_secs(self.idle_expiry_secs))
    }

    /// Stop wait as a `Duration`, or `None` to let the tool decide.
    #[must_use]
    pub fn stop_wait(&self) -> Option<Duration> {
        (self.stop_wait_secs > 0).then(|| Duration::from_secs(self.stop_wait_secs))
    }

    /// Start timeout as a `Duration`.
    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    /// Checks backend/feature combinations and the address block.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == BackendKind::PersistentAlternate && self.storage_quota {
            return Err(ConfigError::QuotaConflict {
                backend: self.backend.to_string(),
            });
        }

        let net = &self.network;
        if !(MIN_PREFIX_LEN..=MAX_PREFIX_LEN).contains(&net.prefix_len) {
            return Err(ConfigError::InvalidPrefix {
                prefix_len: net.prefix_len,
            });
        }
        if !net.contains(net.gateway) {
            return Err(ConfigError::GatewayOutsideSubnet {
                gateway: net.gateway,
                base: net.base,
                prefix_len: net.prefix_len,
            });
        }

        if self.name_prefix.is_empty() {
            return Err(ConfigError::EmptyNamePrefix);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.backend, BackendKind::None);
        assert_eq!(config.name_prefix, "wsbox-");
        assert!(config.idle_expiry().is_none());
        assert!(config.stop_wait().is_none());
        assert_eq!(config.start_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = ManagerConfig::new()
            .with_backend(BackendKind::Ephemeral)
            .with_name_prefix("fs-")
            .with_idle_expiry(Duration::from_secs(30))
            .with_stop_wait(Duration::from_secs(5))
            .with_run_as("ubuntu")
            .with_host_command("git");

        assert_eq!(config.backend, BackendKind::Ephemeral);
        assert_eq!(config.name_prefix, "fs-");
        assert_eq!(config.idle_expiry(), Some(Duration::from_secs(30)));
        assert_eq!(config.stop_wait(), Some(Duration::from_secs(5)));
        assert_eq!(config.run_as.as_deref(), Some("ubuntu"));
        assert_eq!(config.host_commands, vec![String::from("git")]);
    }

    #[test]
    fn test_alternate_runtime_rejects_storage_quota() {
        let config = ManagerConfig::new()
            .with_backend(BackendKind::PersistentAlternate)
            .with_storage_quota(true);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::QuotaConflict { .. })
        ));

        let config = config.with_backend(BackendKind::Persistent);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_gateway_must_be_in_subnet() {
        let network = NetworkConfig {
            gateway: Ipv4Addr::new(192, 168, 0, 1),
            ..NetworkConfig::default()
        };
        let config = ManagerConfig::new().with_network(network);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::GatewayOutsideSubnet { .. })
        ));
    }

    #[test]
    fn test_prefix_range() {
        let network = NetworkConfig {
            prefix_len: 31,
            ..NetworkConfig::default()
        };
        let config = ManagerConfig::new().with_network(network);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPrefix { prefix_len: 31 })
        );
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r"
backend: persistent-alternate
name_prefix: fs-
idle_expiry_secs: 30
network:
  base: 10.1.0.0
  prefix_len: 16
  gateway: 10.1.0.1
  reserved: [10.1.0.2]
host_commands: [git]
";
        let config = ManagerConfig::from_yaml_str(yaml).expect("valid yaml");
        assert_eq!(config.backend, BackendKind::PersistentAlternate);
        assert_eq!(config.network.prefix_len, 16);
        assert_eq!(config.network.reserved, vec![Ipv4Addr::new(10, 1, 0, 2)]);
        assert_eq!(config.idle_expiry(), Some(Duration::from_secs(30)));
        assert_eq!(config.host_commands, vec![String::from("git")]);
        // untouched fields keep their defaults
        assert_eq!(config.start_timeout_secs, 30);
    }

    #[test]
    fn test_from_yaml_rejects_unknown_backend() {
        let result = ManagerConfig::from_yaml_str("backend: vm\n");
        assert!(matches!(result, Err(ConfigError::Load { .. })));
    }
}
