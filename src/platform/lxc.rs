//! LXC command-line tools.
//!
//! Instances are described by a generated config file: host root filesystem shared
//! read-only by the tool, the tenant root bind-mounted read-write at `/workspace`,
//! and a veth interface on the configured bridge with a static address. Stopping an
//! instance destroys its definition, so the next start reads a fresh config.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tracing::{debug, instrument, warn};

use super::{
    CommandSpec, ExecRequest, InstanceSpec, Launch, Platform, run_tool, signal_host_pid, tool,
};
use crate::error::SandboxError;
use crate::sandbox::{WORKSPACE_MOUNT_POINT, shell_quote};

/// Drives `lxc-*` tools.
#[derive(Debug, Clone)]
pub struct LxcPlatform {
    use_sudo: bool,
    runtime_dir: PathBuf,
}

impl LxcPlatform {
    /// Creates a driver that writes instance configs under `runtime_dir`.
    #[must_use]
    pub fn new(use_sudo: bool, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            use_sudo,
            runtime_dir: runtime_dir.into(),
        }
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(format!("{name}.conf"))
    }

    fn ensure_runtime_dir(&self) -> Result<(), SandboxError> {
        std::fs::create_dir_all(&self.runtime_dir).map_err(|e| {
            SandboxError::io(
                format!("creating runtime dir {}", self.runtime_dir.display()),
                &e,
            )
        })
    }

    /// Shell snippet run inside the instance: change directory, optionally switch user.
    fn inner_command(request: &ExecRequest) -> Vec<String> {
        let script = format!(
            "cd {} && exec {}",
            shell_quote(&request.working_dir.to_string_lossy()),
            request.command_line
        );
        match &request.run_as {
            Some(user) => vec![
                "su".to_string(),
                user.clone(),
                "-s".to_string(),
                "/bin/sh".to_string(),
                "-c".to_string(),
                script,
            ],
            None => vec!["/bin/sh".to_string(), "-c".to_string(), script],
        }
    }

    /// `lxc-destroy` for a definition left by an earlier run, then `lxc-create` from `conf`.
    fn create_commands(&self, name: &str, conf: &Path) -> [CommandSpec; 2] {
        let conf = conf.to_string_lossy();
        [
            self.destroy_command(name),
            tool(self.use_sudo, "lxc-create").args(["-n", name, "-f", &*conf]),
        ]
    }

    /// `lxc-stop`, then `lxc-destroy` so the stored definition and address go with it.
    fn stop_commands(&self, name: &str, wait: Option<Duration>) -> [CommandSpec; 2] {
        let mut stop = tool(self.use_sudo, "lxc-stop").args(["-n", name]);
        if let Some(wait) = wait {
            stop = stop.arg("-t").arg(wait.as_secs().to_string());
        }
        [stop, self.destroy_command(name)]
    }

    fn destroy_command(&self, name: &str) -> CommandSpec {
        tool(self.use_sudo, "lxc-destroy").args(["-n", name, "-f"])
    }

    fn env_args(request: &ExecRequest) -> Vec<String> {
        request
            .env
            .iter()
            .flat_map(|(k, v)| ["--set-var".to_string(), format!("{k}={v}")])
            .collect()
    }
}

/// Renders the LXC configuration for `spec`.
#[must_use]
pub fn render_config(spec: &InstanceSpec) -> String {
    let mut conf = String::new();
    let _ = writeln!(conf, "lxc.uts.name = {}", spec.name);
    let _ = writeln!(
        conf,
        "lxc.mount.entry = {} {} none bind,rw,create=dir 0 0",
        spec.root.display(),
        WORKSPACE_MOUNT_POINT.trim_start_matches('/')
    );
    let _ = writeln!(conf, "lxc.net.0.type = veth");
    let _ = writeln!(conf, "lxc.net.0.link = {}", spec.bridge);
    let _ = writeln!(conf, "lxc.net.0.flags = up");
    let _ = writeln!(
        conf,
        "lxc.net.0.ipv4.address = {}/{}",
        spec.address, spec.prefix_len
    );
    let _ = writeln!(conf, "lxc.net.0.ipv4.gateway = {}", spec.gateway);
    conf
}

fn write_config(path: &Path, content: &str) -> Result<(), SandboxError> {
    std::fs::write(path, content)
        .map_err(|e| SandboxError::io(format!("writing {}", path.display()), &e))
}

#[async_trait]
impl Platform for LxcPlatform {
    fn name(&self) -> &'static str {
        "lxc"
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, address = %spec.address))]
    async fn create(&self, spec: &InstanceSpec) -> Result<(), SandboxError> {
        self.ensure_runtime_dir()?;
        let path = self.config_path(&spec.name);
        write_config(&path, &render_config(spec))?;

        let [destroy, create] = self.create_commands(&spec.name, &path);
        // a stored definition would keep its old config and address
        if let Err(e) = run_tool(&destroy).await {
            debug!(error = %e, "No stale instance to destroy");
        }
        run_tool(&create).await.map(drop)
    }

    #[instrument(skip(self))]
    async fn start(&self, name: &str) -> Result<(), SandboxError> {
        let start = tool(self.use_sudo, "lxc-start").args(["-n", name, "-d"]);
        run_tool(&start).await.map(drop)
    }

    #[instrument(skip(self))]
    async fn wait_running(&self, name: &str, timeout: Duration) -> Result<(), SandboxError> {
        let secs = timeout.as_secs().max(1);
        let secs_arg = secs.to_string();
        let wait = tool(self.use_sudo, "lxc-wait").args([
            "-n",
            name,
            "-s",
            "RUNNING",
            "-t",
            secs_arg.as_str(),
        ]);
        run_tool(&wait).await.map(drop).map_err(|e| match e {
            SandboxError::PlatformCommand { .. } => SandboxError::StartTimeout {
                name: name.to_string(),
                timeout_seconds: secs,
            },
            other => other,
        })
    }

    #[instrument(skip(self))]
    async fn stop(&self, name: &str, wait: Option<Duration>) -> Result<(), SandboxError> {
        let [stop, destroy] = self.stop_commands(name, wait);
        let result = run_tool(&stop).await.map(drop);
        if let Err(e) = run_tool(&destroy).await {
            warn!(error = %e, "Failed to destroy instance after stop");
        }

        let path = self.config_path(name);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove instance config");
            }
        }
        result
    }

    fn execute_spec(
        &self,
        instance: &InstanceSpec,
        request: &ExecRequest,
    ) -> Result<Launch, SandboxError> {
        self.ensure_runtime_dir()?;
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-", instance.name))
            .suffix(".conf")
            .tempfile_in(&self.runtime_dir)
            .map_err(|e| SandboxError::io("creating instance config", &e))?;
        file.write_all(render_config(instance).as_bytes())
            .map_err(|e| SandboxError::io("writing instance config", &e))?;
        let scratch = file.into_temp_path();

        let conf = scratch.to_string_lossy().into_owned();
        let command = tool(self.use_sudo, "lxc-execute")
            .args(["-n", instance.name.as_str(), "-f", conf.as_str()])
            .args(Self::env_args(request))
            .arg("--")
            .args(Self::inner_command(request));

        Ok(Launch {
            command,
            scratch: Some(scratch),
        })
    }

    fn attach_spec(&self, name: &str, request: &ExecRequest) -> CommandSpec {
        tool(self.use_sudo, "lxc-attach")
            .args(["-n", name])
            .args(Self::env_args(request))
            .arg("--")
            .args(Self::inner_command(request))
    }

    async fn signal_pid(&self, pid: u32, signal: Signal) -> Result<(), SandboxError> {
        signal_host_pid(self.use_sudo, pid, signal).await
    }
}
