//! Command descriptors: one logical command or terminal request bound to a tenant.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, instrument};

use crate::error::SandboxError;
use crate::pool::TenantId;

/// Default terminal width.
pub const DEFAULT_TERMINAL_COLS: u16 = 80;

/// Default terminal height.
pub const DEFAULT_TERMINAL_ROWS: u16 = 24;

/// Per-command options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOptions {
    /// Working directory, relative to the workspace mount point.
    pub working_dir: Option<PathBuf>,
    /// Keep stdin attached (terminal sessions are always interactive).
    pub interactive: bool,
    /// Terminal width in columns.
    pub terminal_cols: u16,
    /// Terminal height in rows.
    pub terminal_rows: u16,
    /// Extra environment for the command.
    pub env: Vec<(String, String)>,
    /// Kill the command if it runs longer than this.
    pub timeout: Option<Duration>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            working_dir: None,
            interactive: false,
            terminal_cols: DEFAULT_TERMINAL_COLS,
            terminal_rows: DEFAULT_TERMINAL_ROWS,
            env: Vec::new(),
            timeout: None,
        }
    }
}

/// Live process attached to a descriptor.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    instance: Option<String>,
    exec_id: Option<String>,
    exited: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub(crate) fn new(pid: Option<u32>, instance: Option<String>, exited: Arc<AtomicBool>) -> Self {
        Self {
            pid,
            instance,
            exec_id: None,
            exited,
        }
    }

    pub(crate) fn with_exec_id(mut self, exec_id: impl Into<String>) -> Self {
        self.exec_id = Some(exec_id.into());
        self
    }

    /// Host pid of the spawned process (the isolation wrapper, for sandboxed commands).
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Name of the isolated instance the process runs in, if any.
    #[must_use]
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    /// Identifier of the attach request, used to find the command inside the instance.
    #[must_use]
    pub fn exec_id(&self) -> Option<&str> {
        self.exec_id.as_deref()
    }

    /// Returns `true` until the process has been reaped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.exited.load(Ordering::Acquire)
    }
}

/// A command or terminal request for one tenant.
///
/// Build the descriptor, hand it to a backend's `execute` or `execute_terminal`, and
/// keep it around to `kill` or `destroy` the process later. Once a process handle is
/// attached, the command and its arguments can no longer change.
///
/// # Example
///
/// ```
/// use workspace_sandbox::pool::TenantId;
/// use workspace_sandbox::sandbox::CommandDescriptor;
///
/// let desc = CommandDescriptor::new(TenantId::new("fs1"), "/srv/fs1", "echo")
///     .with_args(["hello", "$HOME"]);
/// assert_eq!(desc.command_line(), r#"echo "hello" "\$HOME""#);
/// ```
#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    tenant: TenantId,
    root: PathBuf,
    command: String,
    args: Vec<String>,
    options: CommandOptions,
    process: Option<ProcessHandle>,
}

impl CommandDescriptor {
    /// Creates a descriptor for `command` in `tenant`'s workspace rooted at `root`.
    #[must_use]
    pub fn new(tenant: TenantId, root: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            tenant,
            root: root.into(),
            command: command.into(),
            args: Vec::new(),
            options: CommandOptions::default(),
            process: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: CommandOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.working_dir = Some(dir.into());
        self
    }

    /// Sets the terminal size.
    #[must_use]
    pub fn with_terminal_size(mut self, cols: u16, rows: u16) -> Self {
        self.options.terminal_cols = cols;
        self.options.terminal_rows = rows;
        self
    }

    /// Sets the execution timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.push((key.into(), value.into()));
        self
    }

    /// Replaces the command name.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::CommandAttached` once a process is attached.
    pub fn set_command(&mut self, command: impl Into<String>) -> Result<(), SandboxError> {
        self.ensure_detached()?;
        self.command = command.into();
        Ok(())
    }

    /// Replaces the argument list.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::CommandAttached` once a process is attached.
    pub fn set_args<I, S>(&mut self, args: I) -> Result<(), SandboxError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_detached()?;
        self.args = args.into_iter().map(Into::into).collect();
        Ok(())
    }

    fn ensure_detached(&self) -> Result<(), SandboxError> {
        match self.process {
            Some(_) => Err(SandboxError::CommandAttached(self.command.clone())),
            None => Ok(()),
        }
    }

    /// The owning tenant.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Host path of the tenant's filesystem root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The command name.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The argument list.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The options.
    #[must_use]
    pub fn options(&self) -> &CommandOptions {
        &self.options
    }

    /// The attached process, once spawned.
    #[must_use]
    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    pub(crate) fn attach(&mut self, handle: ProcessHandle) {
        debug!(command = %self.command, pid = ?handle.pid, "Process attached");
        self.process = Some(handle);
    }

    pub(crate) fn validate(&self) -> Result<(), SandboxError> {
        if self.command.is_empty() {
            return Err(SandboxError::InvalidCommand(
                "command cannot be empty".to_string(),
            ));
        }
        if self.command.chars().any(|c| c.is_whitespace() || c == '\0') {
            return Err(SandboxError::InvalidCommand(format!(
                "command name contains whitespace or NUL: {:?}",
                self.command
            )));
        }
        if self.args.iter().any(|a| a.contains('\0')) {
            return Err(SandboxError::InvalidCommand(
                "arguments cannot contain NUL bytes".to_string(),
            ));
        }
        if self.process.is_some() {
            return Err(SandboxError::CommandAttached(self.command.clone()));
        }
        Ok(())
    }

    /// Joins the command name with each argument shell-quoted.
    ///
    /// The result is safe to pass to `sh -c` inside the sandbox.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = self.command.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line
    }

    /// Sends `signal` straight to the attached process.
    ///
    /// A missing or already-exited process is a successful no-op.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Signal` if the kernel refuses delivery for any other reason.
    #[instrument(skip(self), fields(command = %self.command))]
    pub fn kill(&self, signal: Signal) -> Result<(), SandboxError> {
        let Some(process) = self.process.as_ref() else {
            debug!("No process attached, nothing to kill");
            return Ok(());
        };
        // once reaped, the pid may already belong to someone else
        if !process.is_running() {
            debug!("Process already reaped, nothing to kill");
            return Ok(());
        }
        let Some(pid) = process.pid else {
            return Ok(());
        };
        let Ok(raw) = i32::try_from(pid) else {
            return Ok(());
        };

        match kill(Pid::from_raw(raw), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                debug!(pid, "Process already gone");
                Ok(())
            }
            Err(e) => Err(SandboxError::Signal {
                target: format!("pid {pid}"),
                signal: signal.as_str().to_string(),
                reason: e.desc().to_string(),
            }),
        }
    }
}

/// Double-quotes `arg` for a POSIX shell.
///
/// Inside double quotes only `"`, `\`, `$` and `` ` `` are special, so escaping those
/// four with a backslash reproduces the argument verbatim after shell tokenizing.
#[must_use]
pub fn shell_quote(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
