//! Long-lived isolated instances, one per tenant.
//!
//! A tenant's instance is created lazily on first acquisition and kept running while
//! any attached command holds a lease on it. When the last lease is dropped the
//! instance is stopped, either immediately or after an idle grace period.
//!
//! # State machine
//!
//! ```text
//!            acquire                 started
//! Stopped ───────────▶ Starting ───────────────▶ Running
//!    ▲                    │ failed                  │ last release
//!    │◀───────────────────┘                         │ (+ idle expiry)
//!    │                                              ▼
//!    └──────────────────────────────────────── Stopping
//!                       stopped
//! ```
//!
//! Callers arriving while a transition is in flight queue behind it and are all
//! resolved when it settles.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use workspace_sandbox::config::ManagerConfig;
//! use workspace_sandbox::network::AddressAllocator;
//! use workspace_sandbox::platform::LxcPlatform;
//! use workspace_sandbox::pool::{InstancePool, PoolSettings, TenantId};
//!
//! # async fn demo() -> Result<(), workspace_sandbox::error::SandboxError> {
//! let config = ManagerConfig::default();
//! let pool = InstancePool::new(
//!     Arc::new(LxcPlatform::new(true, &config.runtime_dir)),
//!     AddressAllocator::new(&config.network),
//!     PoolSettings::from_config(&config),
//! );
//!
//! let lease = pool.acquire(&TenantId::new("fs1"), "/srv/fs1".as_ref()).await?;
//! println!("attached to {}", lease.instance_name());
//! drop(lease); // last lease: the instance stops
//! # Ok(())
//! # }
//! ```

mod lifecycle;
mod state;

pub use lifecycle::{InstanceLease, InstancePool, PoolSettings};
pub use state::InstanceState;

use std::fmt::{self, Write as _};

/// Opaque key identifying a tenant's workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(String);

impl TenantId {
    /// Wraps a tenant key.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key encoded with characters every platform accepts in an instance name.
    ///
    /// ASCII letters, digits and `-` pass through. Every other byte, `_` included, becomes
    /// `_` plus two lowercase hex digits, so distinct keys never share a fragment.
    #[must_use]
    pub fn name_fragment(&self) -> String {
        let mut fragment = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                fragment.push(char::from(byte));
            } else {
                let _ = write!(fragment, "_{byte:02x}");
            }
        }
        fragment
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_display() {
        let id = TenantId::new("fs1");
        assert_eq!(id.to_string(), "fs1");
        assert_eq!(id.as_str(), "fs1");
        assert_eq!(TenantId::from("fs1"), id);
    }

    #[test]
    fn test_name_fragment_escapes_unsafe_bytes() {
        assert_eq!(TenantId::new("fs1-x").name_fragment(), "fs1-x");
        assert_eq!(TenantId::new("team/a b.c").name_fragment(), "team_2fa_20b_2ec");
        assert_eq!(TenantId::new("fs_1").name_fragment(), "fs_5f1");
        assert_eq!(TenantId::new("é").name_fragment(), "_c3_a9");
    }

    #[test]
    fn test_name_fragment_keeps_keys_apart() {
        let keys = ["team.a", "team-a", "team_a", "team_2ea", "team a", "team/a"];
        let mut fragments: Vec<String> =
            keys.iter().map(|k| TenantId::new(*k).name_fragment()).collect();
        fragments.sort();
        fragments.dedup();
        assert_eq!(fragments.len(), keys.len());
    }
}
