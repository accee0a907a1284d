//! The isolation tool surface.
//!
//! Every interaction with the container runtime goes through the [`Platform`]
//! trait: lifecycle commands (`create`, `start`, `wait_running`, `stop`), command
//! wrappers (`execute_spec` for one-shot instances, `attach_spec` for running ones)
//! and the privileged pid signal. Lifecycle commands run out-of-process through
//! `tokio::process`, so none of them block the runtime.

mod docker;
mod lxc;

pub use docker::DockerPlatform;
pub use lxc::LxcPlatform;

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tempfile::TempPath;
use tracing::{debug, trace};

use crate::error::SandboxError;

/// A program invocation, independent of how it will be spawned.
///
/// Converts into a `tokio::process::Command` for captured execution and into a
/// `portable_pty::CommandBuilder` for terminal sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to run.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory on the host.
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Creates a spec for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds environment variables.
    #[must_use]
    pub fn envs(mut self, env: &[(String, String)]) -> Self {
        self.env.extend(env.iter().cloned());
        self
    }

    /// Sets the host working directory.
    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Builds a `tokio::process::Command`; stdin is closed, output is piped.
    #[must_use]
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Builds a `portable_pty::CommandBuilder` for a terminal session.
    #[must_use]
    pub fn to_pty_command(&self) -> portable_pty::CommandBuilder {
        let mut cmd = portable_pty::CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            cmd.cwd(dir);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Everything needed to create an isolated instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Unique instance name.
    pub name: String,
    /// Canonical host path of the tenant root, bind-mounted read-write.
    pub root: PathBuf,
    /// Leased address.
    pub address: Ipv4Addr,
    /// Subnet prefix length for `address`.
    pub prefix_len: u8,
    /// Default gateway.
    pub gateway: Ipv4Addr,
    /// Bridge or runtime network to attach to.
    pub bridge: String,
}

/// A command to run inside an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Escaped command line for `sh -c`.
    pub command_line: String,
    /// Working directory inside the sandbox.
    pub working_dir: PathBuf,
    /// Extra environment.
    pub env: Vec<(String, String)>,
    /// Host user identity to run as.
    pub run_as: Option<String>,
    /// Allocate a terminal inside the runtime.
    pub interactive: bool,
    /// Unique per request; names the command's pid file inside the instance.
    pub exec_id: String,
}

/// A prepared one-shot invocation plus files that must outlive it.
#[derive(Debug)]
pub struct Launch {
    /// The wrapper to spawn.
    pub command: CommandSpec,
    /// Generated configuration, removed when dropped.
    pub scratch: Option<TempPath>,
}

/// The container runtime as seen by the sandbox backends.
#[async_trait]
pub trait Platform: Send + Sync + fmt::Debug {
    /// Short runtime name for logs.
    fn name(&self) -> &'static str;

    /// Creates the instance described by `spec` without starting it.
    async fn create(&self, spec: &InstanceSpec) -> Result<(), SandboxError>;

    /// Starts a created instance in the background.
    async fn start(&self, name: &str) -> Result<(), SandboxError>;

    /// Returns once the runtime reports the instance running.
    async fn wait_running(&self, name: &str, timeout: Duration) -> Result<(), SandboxError>;

    /// Stops the instance, bounded by `wait` when given.
    async fn stop(&self, name: &str, wait: Option<Duration>) -> Result<(), SandboxError>;

    /// Wraps a command so it runs in a fresh one-shot instance.
    fn execute_spec(
        &self,
        instance: &InstanceSpec,
        request: &ExecRequest,
    ) -> Result<Launch, SandboxError>;

    /// Wraps a command so it runs inside the already running instance `name`.
    fn attach_spec(&self, name: &str, request: &ExecRequest) -> CommandSpec;

    /// Delivers `signal` to a host pid with elevated privileges.
    async fn signal_pid(&self, pid: u32, signal: Signal) -> Result<(), SandboxError>;

    /// Delivers `signal` to a command started from [`attach_spec`](Self::attach_spec).
    ///
    /// `host_pid` is the attach client and `exec_id` the request's identifier. The
    /// default signals the host pid, which suits tools that forward signals into the
    /// instance.
    async fn signal_attached(
        &self,
        instance: &str,
        exec_id: &str,
        host_pid: u32,
        signal: Signal,
    ) -> Result<(), SandboxError> {
        trace!(%instance, %exec_id, "Signalling attach client");
        self.signal_pid(host_pid, signal).await
    }
}

/// Runs a platform tool to completion.
///
/// A non-zero exit becomes `SandboxError::PlatformCommand` carrying the trimmed stderr.
pub(crate) async fn run_tool(spec: &CommandSpec) -> Result<Output, SandboxError> {
    trace!(command = %spec, "Running platform tool");
    let output = spec
        .to_command()
        .output()
        .await
        .map_err(|e| SandboxError::Spawn {
            command: spec.program.clone(),
            reason: e.to_string(),
        })?;

    if output.status.success() {
        debug!(command = %spec, "Platform tool succeeded");
        return Ok(output);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    debug!(command = %spec, code = ?output.status.code(), %stderr, "Platform tool failed");
    Err(SandboxError::PlatformCommand {
        program: spec.program.clone(),
        args: spec.args.join(" "),
        code: output.status.code(),
        stderr,
    })
}

/// Builds a tool invocation, optionally through `sudo -n`.
pub(crate) fn tool(use_sudo: bool, program: &str) -> CommandSpec {
    if use_sudo {
        CommandSpec::new("sudo").args(["-n", program])
    } else {
        CommandSpec::new(program)
    }
}

/// Sends a signal to a pid through `kill(1)`, which may run under `sudo`.
///
/// The target is usually not our child (it lives in another namespace or belongs to
/// another user), so a plain `kill(2)` from this process would be refused.
pub(crate) async fn signal_host_pid(
    use_sudo: bool,
    pid: u32,
    signal: Signal,
) -> Result<(), SandboxError> {
    let name = signal.as_str().trim_start_matches("SIG");
    let spec = tool(use_sudo, "kill").args(["-s", name, &pid.to_string()]);

    match run_tool(&spec).await {
        Ok(_) => Ok(()),
        Err(SandboxError::PlatformCommand { stderr, .. }) => Err(SandboxError::Signal {
            target: format!("pid {pid}"),
            signal: signal.as_str().to_string(),
            reason: stderr,
        }),
        Err(other) => Err(other),
    }
}
