//! Spawning wrapped commands and reporting their completion.
//!
//! Each spawn takes a `guard` value that is dropped exactly once, after the process
//! has exited and before completion is reported. Backends pass their per-process
//! resources (address leases, instance leases, scratch config files) as the guard.

use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use portable_pty::{PtySize, native_pty_system};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::{ExecOutput, TerminalSession};
use crate::error::SandboxError;
use crate::platform::CommandSpec;

pub(crate) type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Runs the backend's kill path for a timed-out process, given its pid.
pub(crate) type TimeoutHook = Box<dyn FnOnce(Option<u32>) -> HookFuture + Send>;

/// A spawned process whose completion will arrive on a channel.
pub(crate) struct Spawned<T> {
    pub pid: Option<u32>,
    pub exited: Arc<AtomicBool>,
    pub done: oneshot::Receiver<Result<T, SandboxError>>,
}

/// Spawns `spec` with captured output.
///
/// When `timeout` elapses, `on_timeout` runs first, then the wrapper is killed and
/// the completion carries `SandboxError::Timeout`.
pub(crate) fn spawn_captured<G>(
    spec: &CommandSpec,
    timeout: Option<Duration>,
    on_timeout: Option<TimeoutHook>,
    guard: G,
) -> Result<Spawned<ExecOutput>, SandboxError>
where
    G: Send + 'static,
{
    trace!(command = %spec, "Spawning child process");
    let child = spec.to_command().spawn().map_err(|e| SandboxError::Spawn {
        command: spec.program.clone(),
        reason: e.to_string(),
    })?;
    let pid = child.id();
    let exited = Arc::new(AtomicBool::new(false));
    let (tx, rx) = oneshot::channel();

    let flag = Arc::clone(&exited);
    let command = spec.to_string();
    tokio::spawn(async move {
        let result = collect(child, pid, &command, timeout, on_timeout).await;
        flag.store(true, Ordering::Release);
        drop(guard);
        if tx.send(result).is_err() {
            trace!(%command, "Completion dropped by caller");
        }
    });

    Ok(Spawned {
        pid,
        exited,
        done: rx,
    })
}

async fn collect(
    mut child: tokio::process::Child,
    pid: Option<u32>,
    command: &str,
    timeout: Option<Duration>,
    on_timeout: Option<TimeoutHook>,
) -> Result<ExecOutput, SandboxError> {
    let start = Instant::now();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // drain both pipes while waiting so the child cannot block on a full pipe
    let run = async {
        let (status, out, err) = tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr));
        Ok::<_, std::io::Error>((status?, out, err))
    };

    let finished = match timeout {
        None => run.await,
        Some(limit) => {
            if let Ok(finished) = tokio::time::timeout(limit, run).await {
                finished
            } else {
                debug!(elapsed_ms = %start.elapsed().as_millis(), "Command timed out, running kill path");
                if let Some(hook) = on_timeout {
                    hook(pid).await;
                }
                if let Err(e) = child.start_kill() {
                    trace!(error = %e, "Wrapper already gone");
                }
                if let Err(e) = child.wait().await {
                    warn!(error = %e, "Failed to reap timed-out wrapper");
                }
                return Err(SandboxError::Timeout {
                    command: command.to_string(),
                    timeout_ms: limit.as_millis(),
                });
            }
        }
    };

    let (status, stdout, stderr) =
        finished.map_err(|e| SandboxError::io(format!("waiting for `{command}`"), &e))?;
    let exit_code = exit_code(status);
    debug!(exit_code, elapsed_ms = %start.elapsed().as_millis(), "Command completed");
    Ok(ExecOutput {
        stdout,
        stderr,
        exit_code,
    })
}

async fn read_pipe<R>(pipe: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut reader) = pipe {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            trace!(error = %e, "Pipe read ended early");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Shell convention: killed by signal N reports 128 + N.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

/// Spawns `spec` attached to a fresh pseudo-terminal of `cols` x `rows`.
///
/// Returns the session together with the flag that flips once the process is reaped.
pub(crate) fn spawn_terminal<G>(
    spec: &CommandSpec,
    cols: u16,
    rows: u16,
    guard: G,
) -> Result<(TerminalSession, Arc<AtomicBool>), SandboxError>
where
    G: Send + 'static,
{
    let spawn_error = |reason: String| SandboxError::Spawn {
        command: spec.program.clone(),
        reason,
    };

    let pair = native_pty_system()
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| spawn_error(format!("failed to open pty: {e}")))?;
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| spawn_error(format!("failed to clone pty reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| spawn_error(format!("failed to take pty writer: {e}")))?;

    trace!(command = %spec, cols, rows, "Spawning terminal session");
    let mut child = pair
        .slave
        .spawn_command(spec.to_pty_command())
        .map_err(|e| spawn_error(e.to_string()))?;
    // the child holds its own copy; keeping ours would prevent EOF on the reader
    drop(pair.slave);

    let pid = child.process_id();
    let exited = Arc::new(AtomicBool::new(false));
    let (tx, rx) = oneshot::channel();
    let flag = Arc::clone(&exited);
    let command = spec.to_string();

    tokio::task::spawn_blocking(move || {
        let result = child
            .wait()
            .map(|status| i32::try_from(status.exit_code()).unwrap_or(i32::MAX))
            .map_err(|e| SandboxError::io(format!("waiting for terminal `{command}`"), &e));
        debug!(?result, "Terminal session ended");
        flag.store(true, Ordering::Release);
        drop(guard);
        if tx.send(result).is_err() {
            trace!("Terminal completion dropped by caller");
        }
    });

    let session = TerminalSession::new(pid, pair.master, reader, writer, rx);
    Ok((session, exited))
}
