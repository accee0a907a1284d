//! The alternate container runtime, driven through the `docker` CLI.

use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tracing::{debug, instrument};

use super::{
    CommandSpec, ExecRequest, InstanceSpec, Launch, Platform, run_tool, signal_host_pid, tool,
};
use crate::error::SandboxError;
use crate::sandbox::WORKSPACE_MOUNT_POINT;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Drives the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerPlatform {
    use_sudo: bool,
    image: String,
}

impl DockerPlatform {
    /// Creates a driver that starts instances from `image`.
    #[must_use]
    pub fn new(use_sudo: bool, image: impl Into<String>) -> Self {
        Self {
            use_sudo,
            image: image.into(),
        }
    }

    fn docker(&self) -> CommandSpec {
        tool(self.use_sudo, "docker")
    }

    fn exec_flags(request: &ExecRequest) -> Vec<String> {
        let mut flags = Vec::new();
        if request.interactive {
            flags.push("-it".to_string());
        }
        if let Some(user) = &request.run_as {
            flags.extend(["-u".to_string(), user.clone()]);
        }
        flags.extend([
            "-w".to_string(),
            request.working_dir.to_string_lossy().into_owned(),
        ]);
        for (key, value) in &request.env {
            flags.extend(["-e".to_string(), format!("{key}={value}")]);
        }
        flags
    }

    fn mount_flag(spec: &InstanceSpec) -> String {
        format!("{}:{WORKSPACE_MOUNT_POINT}:rw", spec.root.display())
    }

    /// Where an attached command records its in-container pid.
    fn pid_file(exec_id: &str) -> String {
        format!("/tmp/.wsbox-{exec_id}.pid")
    }

    /// `docker exec` into `name` that signals the command recorded under `exec_id`.
    ///
    /// The exec client does not forward signals, so the signal is sent from inside the
    /// instance to the pid the command wrote at launch.
    #[must_use]
    pub fn signal_spec(&self, name: &str, exec_id: &str, signal: Signal) -> CommandSpec {
        let script = format!(
            "kill -s {} \"$(cat {})\"",
            signal.as_str().trim_start_matches("SIG"),
            Self::pid_file(exec_id)
        );
        self.docker()
            .args(["exec", name, "sh", "-c", script.as_str()])
    }
}

#[async_trait]
impl Platform for DockerPlatform {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, address = %spec.address))]
    async fn create(&self, spec: &InstanceSpec) -> Result<(), SandboxError> {
        // a stale container with the same name would make `create` fail
        let remove = self.docker().args(["rm", "-f", spec.name.as_str()]);
        if let Err(e) = run_tool(&remove).await {
            debug!(error = %e, "No stale container to remove");
        }

        let create = self
            .docker()
            .args(["create", "--name", spec.name.as_str()])
            .args(["--hostname", spec.name.as_str()])
            .arg("-v")
            .arg(Self::mount_flag(spec))
            .args(["-w", WORKSPACE_MOUNT_POINT])
            .args(["--network", spec.bridge.as_str()])
            .arg("--ip")
            .arg(spec.address.to_string())
            .arg(self.image.as_str())
            .args(["sleep", "infinity"]);
        run_tool(&create).await.map(drop)
    }

    #[instrument(skip(self))]
    async fn start(&self, name: &str) -> Result<(), SandboxError> {
        run_tool(&self.docker().args(["start", name])).await.map(drop)
    }

    #[instrument(skip(self))]
    async fn wait_running(&self, name: &str, timeout: Duration) -> Result<(), SandboxError> {
        let inspect = self
            .docker()
            .args(["inspect", "-f", "{{.State.Running}}", name]);

        let poll = async {
            loop {
                let output = run_tool(&inspect).await?;
                if String::from_utf8_lossy(&output.stdout).trim() == "true" {
                    return Ok::<(), SandboxError>(());
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| SandboxError::StartTimeout {
                name: name.to_string(),
                timeout_seconds: timeout.as_secs(),
            })?
    }

    #[instrument(skip(self))]
    async fn stop(&self, name: &str, wait: Option<Duration>) -> Result<(), SandboxError> {
        let mut stop = self.docker().arg("stop");
        if let Some(wait) = wait {
            stop = stop.arg("-t").arg(wait.as_secs().to_string());
        }
        run_tool(&stop.arg(name)).await?;

        let remove = self.docker().args(["rm", "-f", name]);
        if let Err(e) = run_tool(&remove).await {
            debug!(error = %e, "Container removal failed after stop");
        }
        Ok(())
    }

    fn execute_spec(
        &self,
        instance: &InstanceSpec,
        request: &ExecRequest,
    ) -> Result<Launch, SandboxError> {
        let command = self
            .docker()
            .args(["run", "--rm", "--name", instance.name.as_str()])
            .args(["--hostname", instance.name.as_str()])
            .arg("-v")
            .arg(Self::mount_flag(instance))
            .args(["--network", instance.bridge.as_str()])
            .arg("--ip")
            .arg(instance.address.to_string())
            .args(Self::exec_flags(request))
            .arg(self.image.as_str())
            .args(["sh", "-c", request.command_line.as_str()]);

        Ok(Launch {
            command,
            scratch: None,
        })
    }

    fn attach_spec(&self, name: &str, request: &ExecRequest) -> CommandSpec {
        // the pid file is removed with the container when the instance stops
        let script = format!(
            "echo $$ > {} && exec {}",
            Self::pid_file(&request.exec_id),
            request.command_line
        );
        self.docker()
            .arg("exec")
            .args(Self::exec_flags(request))
            .arg(name)
            .args(["sh", "-c", script.as_str()])
    }

    async fn signal_pid(&self, pid: u32, signal: Signal) -> Result<(), SandboxError> {
        signal_host_pid(self.use_sudo, pid, signal).await
    }

    #[instrument(skip(self, _host_pid))]
    async fn signal_attached(
        &self,
        instance: &str,
        exec_id: &str,
        _host_pid: u32,
        signal: Signal,
    ) -> Result<(), SandboxError> {
        match run_tool(&self.signal_spec(instance, exec_id, signal)).await {
            Ok(_) => Ok(()),
            Err(SandboxError::PlatformCommand { stderr, .. }) => Err(SandboxError::Signal {
                target: format!("{exec_id} in {instance}"),
                signal: signal.as_str().to_string(),
                reason: stderr,
            }),
            Err(other) => Err(other),
        }
    }
}
