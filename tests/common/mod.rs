//! Shared test helpers: a recording platform that runs commands on the host.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tempfile::TempDir;

use workspace_sandbox::config::ManagerConfig;
use workspace_sandbox::error::SandboxError;
use workspace_sandbox::network::AddressAllocator;
use workspace_sandbox::platform::{CommandSpec, ExecRequest, InstanceSpec, Launch, Platform};
use workspace_sandbox::pool::{InstancePool, PoolSettings};

/// Records every lifecycle call and runs wrapped commands under `sh -c` on the host.
#[derive(Debug, Default)]
pub struct FakePlatform {
    pub calls: Mutex<Vec<String>>,
    pub addresses: Mutex<Vec<Ipv4Addr>>,
    pub creates: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub start_delay: Mutex<Option<Duration>>,
    pub stop_delay: Mutex<Option<Duration>>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = Some(delay);
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock() = Some(delay);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Platform for FakePlatform {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<(), SandboxError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.addresses.lock().push(spec.address);
        self.record(format!("create {} {}", spec.name, spec.address));
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), SandboxError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.record(format!("start {name}"));
        let delay = *self.start_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SandboxError::PlatformCommand {
                program: "lxc-start".to_string(),
                args: format!("-n {name} -d"),
                code: Some(1),
                stderr: "failed to start container".to_string(),
            });
        }
        Ok(())
    }

    async fn wait_running(&self, name: &str, _timeout: Duration) -> Result<(), SandboxError> {
        self.record(format!("wait {name}"));
        Ok(())
    }

    async fn stop(&self, name: &str, _wait: Option<Duration>) -> Result<(), SandboxError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.record(format!("stop {name}"));
        let delay = *self.stop_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(SandboxError::PlatformCommand {
                program: "lxc-stop".to_string(),
                args: format!("-n {name}"),
                code: Some(1),
                stderr: "failed to stop container".to_string(),
            });
        }
        Ok(())
    }

    fn execute_spec(
        &self,
        instance: &InstanceSpec,
        request: &ExecRequest,
    ) -> Result<Launch, SandboxError> {
        self.addresses.lock().push(instance.address);
        self.record(format!("execute {} {}", instance.name, instance.address));
        Ok(Launch {
            command: CommandSpec::new("sh")
                .args(["-c", format!("exec {}", request.command_line).as_str()])
                .envs(&request.env)
                .cwd(&instance.root),
            scratch: None,
        })
    }

    fn attach_spec(&self, name: &str, request: &ExecRequest) -> CommandSpec {
        self.record(format!("attach {name}"));
        CommandSpec::new("sh")
            .args(["-c", format!("exec {}", request.command_line).as_str()])
            .envs(&request.env)
    }

    async fn signal_attached(
        &self,
        instance: &str,
        exec_id: &str,
        host_pid: u32,
        signal: Signal,
    ) -> Result<(), SandboxError> {
        self.record(format!("signal_attached {instance} {exec_id}"));
        self.signal_pid(host_pid, signal).await
    }

    async fn signal_pid(&self, pid: u32, signal: Signal) -> Result<(), SandboxError> {
        self.record(format!("signal {pid} {}", signal.as_str()));
        let raw = i32::try_from(pid).unwrap_or(i32::MAX);
        match kill(Pid::from_raw(raw), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(SandboxError::Signal {
                target: format!("pid {pid}"),
                signal: signal.as_str().to_string(),
                reason: "No such process".to_string(),
            }),
            Err(e) => Err(SandboxError::Signal {
                target: format!("pid {pid}"),
                signal: signal.as_str().to_string(),
                reason: e.desc().to_string(),
            }),
        }
    }
}

/// A pool over `platform` with the given idle expiry (zero stops immediately).
pub fn test_pool(
    platform: &Arc<FakePlatform>,
    idle_expiry: Duration,
) -> (InstancePool, AddressAllocator) {
    let config = ManagerConfig::default().with_idle_expiry(idle_expiry);
    let allocator = AddressAllocator::new(&config.network);
    let pool = InstancePool::new(
        Arc::clone(platform) as Arc<dyn Platform>,
        allocator.clone(),
        PoolSettings::from_config(&config),
    );
    (pool, allocator)
}

/// A fresh tenant root.
pub fn tenant_root() -> TempDir {
    TempDir::new().expect("failed to create tenant root")
}

/// Yields until `check` holds, bounded so a broken invariant fails instead of hanging.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
