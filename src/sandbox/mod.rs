//! Sandbox backends: where and how a tenant's commands run.
//!
//! Every backend implements [`SandboxBackend`], so request handlers drive them
//! uniformly:
//!
//! - [`HostBackend`] runs commands directly on the host (no isolation).
//! - [`EphemeralBackend`] wraps each command in a throwaway isolated instance with a
//!   leased address.
//! - [`PersistentBackend`] attaches commands to the tenant's long-lived pooled instance.
//!
//! # Example
//!
//! ```no_run
//! use workspace_sandbox::pool::TenantId;
//! use workspace_sandbox::sandbox::{CommandDescriptor, HostBackend, SandboxBackend};
//!
//! # async fn demo() -> Result<(), workspace_sandbox::error::SandboxError> {
//! let backend = HostBackend::new();
//! let mut desc = CommandDescriptor::new(TenantId::new("fs1"), "/srv/fs1", "echo")
//!     .with_arg("hello");
//!
//! let output = backend.execute(&mut desc).await?.wait().await?;
//! assert!(output.success());
//! println!("Output: {}", output.stdout);
//! # Ok(())
//! # }
//! ```

mod command;
mod ephemeral;
mod host;
mod persistent;
mod process;
mod workspace;

pub use command::{
    CommandDescriptor, CommandOptions, DEFAULT_TERMINAL_COLS, DEFAULT_TERMINAL_ROWS,
    ProcessHandle, shell_quote,
};
pub use ephemeral::EphemeralBackend;
pub use host::HostBackend;
pub use persistent::PersistentBackend;
pub use workspace::{WORKSPACE_MOUNT_POINT, host_working_dir, prepare_root, sandbox_working_dir};

use std::fmt;
use std::io::{Read, Write};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use portable_pty::{MasterPty, PtySize};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::SandboxError;
use crate::platform::ExecRequest;

/// Output of a completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code (128 + N when killed by signal N).
    pub exit_code: i32,
}

impl ExecOutput {
    /// Returns `true` if the command exited successfully (exit code 0).
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

fn completion_lost() -> SandboxError {
    SandboxError::Io {
        context: "waiting for process completion".to_string(),
        reason: "completion channel closed".to_string(),
    }
}

/// A spawned command. Completion arrives exactly once through [`Execution::wait`].
#[derive(Debug)]
pub struct Execution {
    pid: Option<u32>,
    done: oneshot::Receiver<Result<ExecOutput, SandboxError>>,
}

impl Execution {
    pub(crate) fn new(
        pid: Option<u32>,
        done: oneshot::Receiver<Result<ExecOutput, SandboxError>>,
    ) -> Self {
        Self { pid, done }
    }

    /// Host pid of the spawned process.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Waits for the process to exit and its resources to be released.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Timeout` when the command outlived its timeout, or an
    /// I/O error if output could not be collected.
    pub async fn wait(self) -> Result<ExecOutput, SandboxError> {
        self.done.await.map_err(|_| completion_lost())?
    }
}

/// An interactive pseudo-terminal session.
pub struct TerminalSession {
    pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    done: oneshot::Receiver<Result<i32, SandboxError>>,
}

impl fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("pid", &self.pid)
            .field("reader_taken", &self.reader.is_none())
            .field("writer_taken", &self.writer.is_none())
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    pub(crate) fn new(
        pid: Option<u32>,
        master: Box<dyn MasterPty + Send>,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        done: oneshot::Receiver<Result<i32, SandboxError>>,
    ) -> Self {
        Self {
            pid,
            master,
            reader: Some(reader),
            writer: Some(writer),
            done,
        }
    }

    /// Host pid of the process on the terminal.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Takes the terminal output stream. Blocking; read it from a dedicated thread.
    pub fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.reader.take()
    }

    /// Takes the terminal input stream.
    pub fn take_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        self.writer.take()
    }

    /// Resizes the terminal.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Io` if the pty rejects the new size.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SandboxError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SandboxError::Io {
                context: format!("resizing terminal to {cols}x{rows}"),
                reason: e.to_string(),
            })
    }

    /// Waits for the session to end and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the process could not be reaped, or if called again
    /// after the exit code was already delivered.
    pub async fn wait(&mut self) -> Result<i32, SandboxError> {
        (&mut self.done).await.map_err(|_| completion_lost())?
    }
}

/// Uniform interface over all sandbox backends.
#[async_trait]
pub trait SandboxBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs and errors.
    fn name(&self) -> &'static str;

    /// Whether [`execute_terminal`](Self::execute_terminal) is available.
    fn supports_terminal(&self) -> bool;

    /// Spawns the descriptor's command and attaches the process to it.
    async fn execute(&self, desc: &mut CommandDescriptor) -> Result<Execution, SandboxError>;

    /// Opens an interactive terminal sized by the descriptor's options.
    async fn execute_terminal(
        &self,
        desc: &mut CommandDescriptor,
    ) -> Result<TerminalSession, SandboxError>;

    /// Delivers `signal` to the descriptor's process. A missing or dead process is
    /// not an error.
    async fn kill(&self, desc: &CommandDescriptor, signal: Signal) -> Result<(), SandboxError> {
        absorb_benign(desc.kill(signal))
    }

    /// Releases descriptor-local resources.
    async fn destroy(&self, _desc: &mut CommandDescriptor) -> Result<(), SandboxError> {
        Ok(())
    }
}

/// Swallows signal failures, which only mean the target already exited.
pub(crate) fn absorb_benign(result: Result<(), SandboxError>) -> Result<(), SandboxError> {
    match result {
        Err(err) if err.is_benign() => {
            debug!(error = %err, "Ignoring benign signal failure");
            Ok(())
        }
        other => other,
    }
}

/// Builds the in-sandbox request for `desc`.
pub(crate) fn exec_request(
    desc: &CommandDescriptor,
    run_as: Option<&str>,
    interactive: bool,
) -> Result<ExecRequest, SandboxError> {
    Ok(ExecRequest {
        command_line: desc.command_line(),
        working_dir: sandbox_working_dir(desc.options().working_dir.as_deref())?,
        env: desc.options().env.clone(),
        run_as: run_as.map(String::from),
        interactive: interactive || desc.options().interactive,
        exec_id: Uuid::new_v4().simple().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TenantId;
    use std::path::PathBuf;

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput {
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert!(ok.success());
        let failed = ExecOutput {
            exit_code: 2,
            ..ok
        };
        assert!(!failed.success());
    }

    #[test]
    fn test_exec_request_maps_working_dir() {
        let desc = CommandDescriptor::new(TenantId::new("fs1"), "/srv/fs1", "ls")
            .with_arg("-l")
            .with_working_dir("src")
            .with_env("LANG", "C");
        let request = exec_request(&desc, Some("ubuntu"), false).expect("request");

        assert_eq!(request.command_line, r#"ls "-l""#);
        assert_eq!(request.working_dir, PathBuf::from("/workspace/src"));
        assert_eq!(request.env, vec![("LANG".to_string(), "C".to_string())]);
        assert_eq!(request.run_as.as_deref(), Some("ubuntu"));
        assert!(!request.interactive);

        let again = exec_request(&desc, None, false).expect("request");
        assert_eq!(request.exec_id.len(), 32);
        assert_ne!(request.exec_id, again.exec_id);
    }

    #[test]
    fn test_absorb_benign() {
        let signal = Err(SandboxError::Signal {
            target: "pid 1".to_string(),
            signal: "SIGTERM".to_string(),
            reason: "gone".to_string(),
        });
        assert!(absorb_benign(signal).is_ok());

        let spawn = Err(SandboxError::Spawn {
            command: "x".to_string(),
            reason: "missing".to_string(),
        });
        assert!(absorb_benign(spawn).is_err());
    }
}
