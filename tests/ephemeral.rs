//! Ephemeral backend tests.
//!
//! These tests verify:
//! - Each command gets its own address, returned exactly when the wrapper exits
//! - Concurrent commands never share an address
//! - Host exception commands bypass the platform entirely
//! - Timeouts and kills go through the platform stop, and a failed stop is reported

mod common;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;

use common::{FakePlatform, eventually, tenant_root};
use workspace_sandbox::config::{BackendKind, ManagerConfig};
use workspace_sandbox::error::SandboxError;
use workspace_sandbox::network::AddressAllocator;
use workspace_sandbox::platform::Platform;
use workspace_sandbox::pool::TenantId;
use workspace_sandbox::sandbox::{CommandDescriptor, EphemeralBackend, SandboxBackend};

/// Builds an ephemeral backend over a fake platform.
fn ephemeral(config: ManagerConfig) -> (EphemeralBackend, Arc<FakePlatform>) {
    let platform = FakePlatform::new();
    let config = config.with_backend(BackendKind::Ephemeral);
    let backend = EphemeralBackend::new(
        Arc::clone(&platform) as Arc<dyn Platform>,
        AddressAllocator::new(&config.network),
        &config,
    );
    (backend, platform)
}

// ============================================================================
// Address lifecycle
// ============================================================================

#[tokio::test]
async fn test_address_released_when_command_exits() {
    let (backend, platform) = ephemeral(ManagerConfig::default());
    let root = tenant_root();

    let mut desc = CommandDescriptor::new(TenantId::new("fs1"), root.path(), "sh")
        .with_arg("-c")
        .with_arg("sleep 0.2; echo done");
    let execution = backend.execute(&mut desc).await.expect("failed to execute");

    assert_eq!(backend.allocator().leased_count(), 1);
    let address = platform.addresses.lock()[0];
    assert!(backend.allocator().is_leased(address));

    let output = execution.wait().await.expect("failed to wait");
    assert_eq!(output.stdout, "done\n");
    assert_eq!(output.exit_code, 0);
    assert_eq!(backend.allocator().leased_count(), 0);
    assert!(!backend.allocator().is_leased(address));

    let instance = desc
        .process()
        .and_then(|p| p.instance())
        .expect("instance name recorded");
    assert!(instance.starts_with("wsbox-fs1-"));
}

#[tokio::test]
async fn test_concurrent_commands_get_distinct_addresses() {
    let (backend, platform) = ephemeral(ManagerConfig::default());
    let root = tenant_root();

    let mut executions = Vec::new();
    for _ in 0..5 {
        let mut desc = CommandDescriptor::new(TenantId::new("fs1"), root.path(), "sleep")
            .with_arg("0.2");
        executions.push(backend.execute(&mut desc).await.expect("failed to execute"));
    }
    assert_eq!(backend.allocator().leased_count(), 5);

    let mut addresses = platform.addresses.lock().clone();
    addresses.sort();
    addresses.dedup();
    assert_eq!(addresses.len(), 5);

    for execution in executions {
        let output = execution.wait().await.expect("failed to wait");
        assert!(output.success());
    }
    assert_eq!(backend.allocator().leased_count(), 0);
}

#[tokio::test]
async fn test_env_reaches_command() {
    let (backend, _platform) = ephemeral(ManagerConfig::default());
    let root = tenant_root();

    let mut desc = CommandDescriptor::new(TenantId::new("fs1"), root.path(), "sh")
        .with_arg("-c")
        .with_arg("echo $GREETING")
        .with_env("GREETING", "hello");
    let output = backend
        .execute(&mut desc)
        .await
        .expect("failed to execute")
        .wait()
        .await
        .expect("failed to wait");
    assert_eq!(output.stdout, "hello\n");
}

#[tokio::test]
async fn test_descriptor_cannot_be_reused() {
    let (backend, _platform) = ephemeral(ManagerConfig::default());
    let root = tenant_root();

    let mut desc = CommandDescriptor::new(TenantId::new("fs1"), root.path(), "true");
    let execution = backend.execute(&mut desc).await.expect("failed to execute");
    execution.wait().await.expect("failed to wait");

    let err = backend
        .execute(&mut desc)
        .await
        .expect_err("second execute should fail");
    assert!(matches!(err, SandboxError::CommandAttached(_)));
    assert_eq!(backend.allocator().leased_count(), 0);
}

// ============================================================================
// Host exceptions
// ============================================================================

#[tokio::test]
async fn test_host_command_bypasses_platform() {
    let (backend, platform) = ephemeral(ManagerConfig::default().with_host_command("printf"));
    let root = tenant_root();

    let mut desc = CommandDescriptor::new(TenantId::new("fs1"), root.path(), "printf")
        .with_arg("on host");
    let output = backend
        .execute(&mut desc)
        .await
        .expect("failed to execute")
        .wait()
        .await
        .expect("failed to wait");

    assert_eq!(output.stdout, "on host");
    assert!(platform.calls().is_empty());
    assert_eq!(backend.allocator().leased_count(), 0);
    assert!(desc.process().and_then(|p| p.instance()).is_none());
}

#[tokio::test]
async fn test_host_command_terminal_bypasses_platform() {
    let (backend, platform) = ephemeral(ManagerConfig::default().with_host_command("printf"));
    let root = tenant_root();

    let mut desc = CommandDescriptor::new(TenantId::new("fs1"), root.path(), "printf")
        .with_arg("host terminal");
    let mut session = backend
        .execute_terminal(&mut desc)
        .await
        .expect("failed to open terminal");

    let mut reader = session.take_reader().expect("reader available once");
    let transcript = tokio::task::spawn_blocking(move || {
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        // EIO marks the end of output once the child side closes
        while let Ok(n) = reader.read(&mut buf) {
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&collected).to_string()
    });

    let code = session.wait().await.expect("failed to wait");
    assert_eq!(code, 0);
    drop(session);

    let transcript = transcript.await.expect("reader task panicked");
    assert!(transcript.contains("host terminal"));
    assert!(platform.calls().is_empty());
    assert_eq!(backend.allocator().leased_count(), 0);
    assert!(desc.process().and_then(|p| p.instance()).is_none());
}

// ============================================================================
// Timeouts and kills
// ============================================================================

#[tokio::test]
async fn test_timeout_stops_instance_and_frees_address() {
    let (backend, platform) = ephemeral(ManagerConfig::default());
    let root = tenant_root();

    let mut desc = CommandDescriptor::new(TenantId::new("fs1"), root.path(), "sleep")
        .with_arg("10")
        .with_timeout(Duration::from_millis(200));
    let err = backend
        .execute(&mut desc)
        .await
        .expect("failed to execute")
        .wait()
        .await
        .expect_err("command should time out");

    assert!(matches!(err, SandboxError::Timeout { .. }));
    assert!(platform.calls().iter().any(|c| c.starts_with("stop wsbox-fs1-")));
    assert_eq!(backend.allocator().leased_count(), 0);
}

#[tokio::test]
async fn test_kill_stops_instance_through_platform() {
    let (backend, platform) = ephemeral(ManagerConfig::default());
    let root = tenant_root();

    let mut desc = CommandDescriptor::new(TenantId::new("fs1"), root.path(), "sleep")
        .with_arg("0.3");
    let execution = backend.execute(&mut desc).await.expect("failed to execute");
    let instance = desc
        .process()
        .and_then(|p| p.instance())
        .expect("instance name recorded")
        .to_string();

    backend
        .kill(&desc, Signal::SIGTERM)
        .await
        .expect("failed to kill");
    assert!(platform.calls().contains(&format!("stop {instance}")));

    execution.wait().await.expect("failed to wait");
    assert!(
        eventually(|| desc.process().is_some_and(|p| !p.is_running())).await,
        "process still marked running"
    );

    // a finished command is not stopped again
    let stops = platform.stops();
    backend
        .kill(&desc, Signal::SIGTERM)
        .await
        .expect("kill after exit is a no-op");
    assert_eq!(platform.stops(), stops);
}

#[tokio::test]
async fn test_kill_without_process_is_noop() {
    let (backend, platform) = ephemeral(ManagerConfig::default());
    let root = tenant_root();

    let desc = CommandDescriptor::new(TenantId::new("fs1"), root.path(), "true");
    backend
        .kill(&desc, Signal::SIGKILL)
        .await
        .expect("kill without a process is a no-op");
    assert!(platform.calls().is_empty());
}

#[tokio::test]
async fn test_kill_reports_failed_stop_while_running() {
    let (backend, platform) = ephemeral(ManagerConfig::default());
    platform.set_fail_stop(true);
    let root = tenant_root();

    let mut desc = CommandDescriptor::new(TenantId::new("fs1"), root.path(), "sleep")
        .with_arg("0.5");
    let execution = backend.execute(&mut desc).await.expect("failed to execute");

    let err = backend
        .kill(&desc, Signal::SIGTERM)
        .await
        .expect_err("a failed stop of a live wrapper is an error");
    assert!(matches!(err, SandboxError::PlatformCommand { .. }));
    assert!(desc.process().is_some_and(|p| p.is_running()));

    let output = execution.wait().await.expect("failed to wait");
    assert!(output.success());
    assert_eq!(backend.allocator().leased_count(), 0);
}
