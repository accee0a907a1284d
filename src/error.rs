//! Error types for the workspace sandbox manager.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.

use std::net::Ipv4Addr;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Host is missing tools the selected backend needs
    #[error("System requirements check failed")]
    #[diagnostic(code(wsbox::system::requirements))]
    SystemRequirements(#[from] SystemRequirementsError),

    /// Invalid deployment configuration
    #[error("Invalid sandbox configuration")]
    #[diagnostic(code(wsbox::config))]
    Config(#[from] ConfigError),

    /// Sandbox operation failed
    #[error("Sandbox operation failed")]
    #[diagnostic(code(wsbox::sandbox))]
    Sandbox(#[from] SandboxError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(wsbox::io))]
    Io(#[from] std::io::Error),
}

/// Errors related to host requirements for a backend.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemRequirementsError {
    /// A platform tool is not installed
    #[error("`{tool}` is required by the {backend} backend but was not found")]
    #[diagnostic(
        code(wsbox::system::tool_missing),
        help("Install the tool or select a different backend")
    )]
    ToolMissing { tool: String, backend: String },

    /// cgroups v2 not mounted
    #[error("cgroups v2 is not available")]
    #[diagnostic(
        code(wsbox::system::cgroups),
        help("LXC instances need the unified cgroup hierarchy at /sys/fs/cgroup")
    )]
    CgroupsV2Unavailable,

    /// A system check could not read its source
    #[error("Failed to read {context}")]
    #[diagnostic(code(wsbox::system::read_failed))]
    ReadFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration problems detected at startup.
///
/// These are fatal: the manager refuses to start rather than failing on first use.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum ConfigError {
    /// The alternate runtime cannot enforce per-tenant storage quotas
    #[error("backend `{backend}` cannot be combined with storage quotas")]
    #[diagnostic(
        code(wsbox::config::quota_conflict),
        help("Disable `storage_quota` or select the `persistent` backend")
    )]
    QuotaConflict { backend: String },

    /// Network prefix length out of the supported range
    #[error("network prefix length /{prefix_len} is outside the supported range /8../30")]
    #[diagnostic(code(wsbox::config::prefix))]
    InvalidPrefix { prefix_len: u8 },

    /// Gateway does not belong to the address pool's subnet
    #[error("gateway {gateway} is not inside {base}/{prefix_len}")]
    #[diagnostic(code(wsbox::config::gateway))]
    GatewayOutsideSubnet {
        gateway: Ipv4Addr,
        base: Ipv4Addr,
        prefix_len: u8,
    },

    /// Instance names need a non-empty prefix
    #[error("instance name prefix must not be empty")]
    #[diagnostic(code(wsbox::config::name_prefix))]
    EmptyNamePrefix,

    /// Configuration file could not be read or parsed
    #[error("failed to load configuration from {path}: {reason}")]
    #[diagnostic(code(wsbox::config::load))]
    Load { path: String, reason: String },
}

/// Errors raised by sandbox lifecycle and execution operations.
///
/// The type is `Clone` so that a failed start transition can hand the identical
/// error to the caller and to every waiter queued behind it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum SandboxError {
    /// Invalid backend/feature combination
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    /// A platform CLI tool exited non-zero
    #[error("`{program} {args}` failed with exit code {code:?}: {stderr}")]
    #[diagnostic(code(wsbox::platform::command))]
    PlatformCommand {
        program: String,
        args: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The attached process could not be started
    #[error("failed to spawn `{command}`: {reason}")]
    #[diagnostic(code(wsbox::spawn))]
    Spawn { command: String, reason: String },

    /// Signal delivery targeted a dead or unknown process
    #[error("failed to deliver {signal} to {target}: {reason}")]
    #[diagnostic(code(wsbox::signal))]
    Signal {
        target: String,
        signal: String,
        reason: String,
    },

    /// Every address in the pool is reserved or leased
    #[error("address pool {base}/{prefix_len} is exhausted")]
    #[diagnostic(
        code(wsbox::network::exhausted),
        help("Widen the network prefix or reduce concurrent ephemeral sandboxes")
    )]
    AddressExhausted { base: Ipv4Addr, prefix_len: u8 },

    /// Command descriptor rejected before spawning
    #[error("invalid command: {0}")]
    #[diagnostic(code(wsbox::command::invalid))]
    InvalidCommand(String),

    /// Command or arguments were changed after a process was attached
    #[error("command `{0}` already has a live process attached")]
    #[diagnostic(code(wsbox::command::attached))]
    CommandAttached(String),

    /// The selected backend cannot open terminals
    #[error("backend `{0}` does not support terminal sessions")]
    #[diagnostic(code(wsbox::terminal::unsupported))]
    TerminalUnsupported(&'static str),

    /// The platform did not report the instance running in time
    #[error("instance `{name}` did not reach running state within {timeout_seconds}s")]
    #[diagnostic(code(wsbox::platform::timeout))]
    StartTimeout { name: String, timeout_seconds: u64 },

    /// The command ran longer than its configured timeout and was killed
    #[error("command `{command}` timed out after {timeout_ms}ms")]
    #[diagnostic(code(wsbox::command::timeout))]
    Timeout { command: String, timeout_ms: u128 },

    /// Generic I/O failure with context
    #[error("I/O error while {context}: {reason}")]
    #[diagnostic(code(wsbox::io))]
    Io { context: String, reason: String },
}

impl SandboxError {
    /// Wraps an [`std::io::Error`] with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: &std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            reason: source.to_string(),
        }
    }

    /// Returns `true` for signal failures, which callers treat as benign.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Signal { .. })
    }
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
