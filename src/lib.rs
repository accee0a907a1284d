//! Workspace Sandbox - sandbox lifecycle manager for multi-tenant workspace filesystems.
//!
//! This crate decides where a tenant's commands run and keeps the isolation layer
//! consistent while they do: a private address block leased to isolated instances,
//! throwaway instances for one-shot commands, and a reference-counted pool of
//! long-lived instances with idle expiry.
//!
//! # Backends
//!
//! - `none`: commands run directly on the host
//! - `ephemeral`: one LXC instance per command, with a leased address
//! - `persistent`: one pooled LXC instance per tenant, commands attach to it
//! - `persistent-alternate`: pooling on the Docker runtime
//!
//! # Example
//!
//! ```no_run
//! use workspace_sandbox::config::{BackendKind, ManagerConfig};
//! use workspace_sandbox::manager::SandboxManager;
//! use workspace_sandbox::pool::TenantId;
//! use workspace_sandbox::sandbox::CommandDescriptor;
//!
//! #[tokio::main]
//! async fn main() -> miette::Result<()> {
//!     let config = ManagerConfig::default().with_backend(BackendKind::Ephemeral);
//!     let manager = SandboxManager::new(config)?;
//!
//!     let mut desc = CommandDescriptor::new(TenantId::new("fs1"), "/srv/fs1", "ls")
//!         .with_arg("-la");
//!     let output = manager.execute(&mut desc).await?.wait().await?;
//!     print!("{}", output.stdout);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod network;
pub mod platform;
pub mod pool;
pub mod sandbox;
pub mod system;

// Re-export commonly used types
pub use config::{BackendKind, ManagerConfig};
pub use error::{Error, Result};
pub use manager::SandboxManager;
pub use pool::TenantId;
pub use sandbox::{CommandDescriptor, ExecOutput, SandboxBackend};
