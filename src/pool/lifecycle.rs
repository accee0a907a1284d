//! Pooled instance lifecycle.
//!
//! All registry mutations happen inside one `parking_lot` critical section and the
//! lock is never held across an `.await`. Start and stop transitions run as spawned
//! tasks, so a caller that gives up waiting cannot leave an instance stuck in
//! `Starting` or `Stopping`.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use super::{InstanceState, TenantId};
use crate::config::ManagerConfig;
use crate::error::SandboxError;
use crate::network::{AddressAllocator, AddressLease};
use crate::platform::{InstanceSpec, Platform};

/// Pool tunables, usually derived from [`ManagerConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Prefix for generated instance names.
    pub name_prefix: String,
    /// Grace period after the last release. `None` stops immediately.
    pub idle_expiry: Option<Duration>,
    /// Bound handed to the platform stop command.
    pub stop_wait: Option<Duration>,
    /// How long to wait for a started instance to report running.
    pub start_timeout: Duration,
    /// Gateway configured inside every instance.
    pub gateway: Ipv4Addr,
    /// Prefix length of the instance address.
    pub prefix_len: u8,
    /// Bridge or runtime network.
    pub bridge: String,
}

impl PoolSettings {
    /// Extracts the pool settings from a manager configuration.
    #[must_use]
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            name_prefix: config.name_prefix.clone(),
            idle_expiry: config.idle_expiry(),
            stop_wait: config.stop_wait(),
            start_timeout: config.start_timeout(),
            gateway: config.network.gateway,
            prefix_len: config.network.prefix_len,
            bridge: config.network.bridge.clone(),
        }
    }
}

/// Outcome of a transition, as delivered to one waiter.
enum Settled {
    Running(InstanceLease),
    Stopped,
    Failed(SandboxError),
}

type Waiter = oneshot::Sender<Settled>;

struct Slot {
    name: String,
    root: PathBuf,
    state: InstanceState,
    ref_count: usize,
    waiters: Vec<Waiter>,
    idle_timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    address: Option<AddressLease>,
}

impl Slot {
    fn new(name: String, root: &Path) -> Self {
        Self {
            name,
            root: root.to_path_buf(),
            state: InstanceState::Stopped,
            ref_count: 0,
            waiters: Vec::new(),
            idle_timer: None,
            timer_generation: 0,
            address: None,
        }
    }

    /// Aborts a pending idle timer. The generation bump also defeats a timer that
    /// already fired and is waiting for the registry lock.
    fn cancel_timer(&mut self) {
        self.timer_generation = self.timer_generation.wrapping_add(1);
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
            trace!(instance = %self.name, "Idle timer cancelled");
        }
    }
}

/// Work captured when an instance enters `Stopping`.
struct StopJob {
    name: String,
    address: Option<AddressLease>,
}

struct PoolInner {
    platform: Arc<dyn Platform>,
    allocator: AddressAllocator,
    settings: PoolSettings,
    slots: Mutex<HashMap<TenantId, Slot>>,
}

/// Registry of pooled instances keyed by tenant.
///
/// Cloning is cheap and every clone shares the same registry.
#[derive(Clone)]
pub struct InstancePool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancePool")
            .field("platform", &self.inner.platform.name())
            .field("settings", &self.inner.settings)
            .field("instances", &self.len())
            .finish_non_exhaustive()
    }
}

impl InstancePool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(
        platform: Arc<dyn Platform>,
        allocator: AddressAllocator,
        settings: PoolSettings,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                platform,
                allocator,
                settings,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The pool settings.
    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    fn instance_name(&self, tenant: &TenantId) -> String {
        format!("{}{}", self.inner.settings.name_prefix, tenant.name_fragment())
    }

    /// Acquires a lease on `tenant`'s running instance, starting it if needed.
    ///
    /// `root` is the host path bind-mounted at `/workspace`; it is only read when the
    /// instance has to be created.
    ///
    /// # Errors
    ///
    /// Returns the error of the failed start transition. Every caller queued behind
    /// the same transition receives the same error.
    #[instrument(skip(self, root), fields(%tenant))]
    pub async fn acquire(
        &self,
        tenant: &TenantId,
        root: &Path,
    ) -> Result<InstanceLease, SandboxError> {
        loop {
            let settled = {
                let mut slots = self.inner.slots.lock();
                let slot = slots
                    .entry(tenant.clone())
                    .or_insert_with(|| Slot::new(self.instance_name(tenant), root));

                let (tx, rx) = oneshot::channel();
                match slot.state {
                    InstanceState::Running => {
                        slot.cancel_timer();
                        slot.ref_count += 1;
                        trace!(ref_count = slot.ref_count, "Reusing running instance");
                        return Ok(InstanceLease::new(self.clone(), tenant, &slot.name));
                    }
                    InstanceState::Stopped => {
                        slot.state = InstanceState::Starting;
                        slot.root = root.to_path_buf();
                        slot.waiters.push(tx);
                        debug!(instance = %slot.name, "Stopped -> Starting");

                        let pool = self.clone();
                        let tenant = tenant.clone();
                        tokio::spawn(async move { pool.start_transition(tenant).await });
                    }
                    InstanceState::Starting | InstanceState::Stopping => {
                        slot.waiters.push(tx);
                        trace!(state = %slot.state, waiters = slot.waiters.len(), "Queued behind transition");
                    }
                }
                rx
            };

            match settled.await {
                Ok(Settled::Running(lease)) => return Ok(lease),
                Ok(Settled::Stopped) => {
                    trace!("Instance stopped while waiting, retrying");
                }
                Ok(Settled::Failed(err)) => return Err(err),
                Err(_) => {
                    return Err(SandboxError::Io {
                        context: format!("waiting for instance of {tenant}"),
                        reason: "transition task ended without a result".to_string(),
                    });
                }
            }
        }
    }

    async fn start_transition(self, tenant: TenantId) {
        let target = {
            let slots = self.inner.slots.lock();
            slots
                .get(&tenant)
                .map(|slot| (slot.name.clone(), slot.root.clone()))
        };
        let Some((name, root)) = target else {
            warn!(%tenant, "Start transition found no registry entry");
            return;
        };

        let result = self.bring_up(&name, &root).await;
        self.finish_start(&tenant, result);
    }

    /// Two-phase startup: create + start, then wait until the platform reports running.
    #[instrument(skip(self, root), fields(root = %root.display()))]
    async fn bring_up(&self, name: &str, root: &Path) -> Result<AddressLease, SandboxError> {
        let settings = &self.inner.settings;
        let platform = &self.inner.platform;

        let address = self.inner.allocator.acquire()?;
        let spec = InstanceSpec {
            name: name.to_string(),
            root: root.to_path_buf(),
            address: address.addr(),
            prefix_len: settings.prefix_len,
            gateway: settings.gateway,
            bridge: settings.bridge.clone(),
        };

        platform.create(&spec).await?;

        let started = async {
            platform.start(name).await?;
            platform.wait_running(name, settings.start_timeout).await
        };
        if let Err(err) = started.await {
            if let Err(stop_err) = platform.stop(name, settings.stop_wait).await {
                debug!(error = %stop_err, "Cleanup stop after failed start also failed");
            }
            return Err(err);
        }

        Ok(address)
    }

    fn finish_start(&self, tenant: &TenantId, result: Result<AddressLease, SandboxError>) {
        let mut deliveries = Vec::new();
        let mut idle_stop = None;
        {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.get_mut(tenant) else {
                warn!(%tenant, "Instance vanished during start");
                return;
            };
            let waiters = std::mem::take(&mut slot.waiters);

            match result {
                Ok(address) => {
                    slot.state = InstanceState::Running;
                    slot.address = Some(address);
                    for tx in waiters {
                        slot.ref_count += 1;
                        let lease = InstanceLease::new(self.clone(), tenant, &slot.name);
                        deliveries.push((tx, Settled::Running(lease)));
                    }
                    debug!(instance = %slot.name, ref_count = slot.ref_count, "Starting -> Running");
                    if slot.ref_count == 0 {
                        idle_stop = self.on_idle(tenant, slot);
                    }
                }
                Err(err) => {
                    debug!(instance = %slot.name, error = %err, waiters = waiters.len(), "Starting -> Stopped");
                    slot.state = InstanceState::Stopped;
                    slots.remove(tenant);
                    for tx in waiters {
                        deliveries.push((tx, Settled::Failed(err.clone())));
                    }
                }
            }
        }

        // an abandoned waiter's lease is dropped here, outside the lock
        for (tx, settled) in deliveries {
            drop(tx.send(settled));
        }
        if let Some(job) = idle_stop {
            self.spawn_stop(tenant.clone(), job);
        }
    }

    /// Returns one lease. Called from [`InstanceLease`]'s `Drop`.
    fn release(&self, tenant: &TenantId) {
        let job = {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.get_mut(tenant) else {
                warn!(%tenant, "Release for unknown instance");
                return;
            };
            if slot.ref_count == 0 {
                warn!(%tenant, "Release without a matching acquire");
                return;
            }
            slot.ref_count -= 1;
            trace!(%tenant, ref_count = slot.ref_count, "Lease released");

            if slot.ref_count > 0 || slot.state != InstanceState::Running {
                return;
            }
            self.on_idle(tenant, slot)
        };

        if let Some(job) = job {
            self.spawn_stop(tenant.clone(), job);
        }
    }

    /// Handles a running instance whose last lease went away: arm the idle timer, or
    /// begin stopping right away.
    fn on_idle(&self, tenant: &TenantId, slot: &mut Slot) -> Option<StopJob> {
        let Ok(handle) = Handle::try_current() else {
            warn!(%tenant, "Released outside a runtime, instance stays running until shutdown");
            return None;
        };

        match self.inner.settings.idle_expiry {
            Some(expiry) => {
                self.arm_idle_timer(&handle, tenant, slot, expiry);
                None
            }
            None => Some(Self::begin_stop(slot)),
        }
    }

    fn arm_idle_timer(&self, handle: &Handle, tenant: &TenantId, slot: &mut Slot, expiry: Duration) {
        slot.cancel_timer();
        let generation = slot.timer_generation;
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let tenant = tenant.clone();

        debug!(instance = %slot.name, ?expiry, "Idle timer armed");
        slot.idle_timer = Some(handle.spawn(async move {
            tokio::time::sleep(expiry).await;
            if let Some(inner) = pool.upgrade() {
                InstancePool { inner }.expire(&tenant, generation).await;
            }
        }));
    }

    async fn expire(&self, tenant: &TenantId, generation: u64) {
        let job = {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.get_mut(tenant) else {
                return;
            };
            if slot.timer_generation != generation
                || slot.state != InstanceState::Running
                || slot.ref_count > 0
            {
                trace!(%tenant, "Stale idle timer ignored");
                return;
            }
            // this task is the timer; do not abort it
            slot.idle_timer = None;
            debug!(instance = %slot.name, "Idle expiry reached");
            Self::begin_stop(slot)
        };

        if let Err(err) = self.run_stop(tenant, job).await {
            warn!(%tenant, error = %err, "Idle stop failed");
        }
    }

    /// `Running -> Stopping`. The caller must have checked the state.
    fn begin_stop(slot: &mut Slot) -> StopJob {
        slot.cancel_timer();
        slot.state = InstanceState::Stopping;
        debug!(instance = %slot.name, "Running -> Stopping");
        StopJob {
            name: slot.name.clone(),
            address: slot.address.take(),
        }
    }

    fn spawn_stop(&self, tenant: TenantId, job: StopJob) {
        let pool = self.clone();
        let Ok(handle) = Handle::try_current() else {
            warn!(%tenant, "No runtime to stop instance on");
            return;
        };
        handle.spawn(async move {
            if let Err(err) = pool.run_stop(&tenant, job).await {
                warn!(%tenant, error = %err, "Stop failed");
            }
        });
    }

    /// Issues the platform stop and settles `Stopping -> Stopped`.
    ///
    /// The instance lands in `Stopped` even when the platform command fails; the error
    /// is still returned.
    async fn run_stop(&self, tenant: &TenantId, job: StopJob) -> Result<(), SandboxError> {
        let result = self
            .inner
            .platform
            .stop(&job.name, self.inner.settings.stop_wait)
            .await;
        drop(job.address);

        let waiters = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(tenant) {
                Some(slot) => {
                    slot.state = InstanceState::Stopped;
                    let mut waiters = std::mem::take(&mut slot.waiters);
                    waiters.retain(|tx| !tx.is_closed());
                    debug!(instance = %slot.name, waiters = waiters.len(), "Stopping -> Stopped");
                    if waiters.is_empty() {
                        slots.remove(tenant);
                        trace!(%tenant, "Removed from registry");
                    }
                    waiters
                }
                None => Vec::new(),
            }
        };

        for tx in waiters {
            drop(tx.send(Settled::Stopped));
        }
        result
    }

    /// Stops `tenant`'s instance if it is running with no leases.
    ///
    /// A no-op in every other state, including while leases are held.
    ///
    /// # Errors
    ///
    /// Returns the platform error. The instance is `Stopped` either way.
    #[instrument(skip(self), fields(%tenant))]
    pub async fn stop(&self, tenant: &TenantId) -> Result<(), SandboxError> {
        let job = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(tenant) {
                Some(slot) if slot.state == InstanceState::Running && slot.ref_count == 0 => {
                    Some(Self::begin_stop(slot))
                }
                Some(slot) => {
                    debug!(state = %slot.state, ref_count = slot.ref_count, "Stop ignored");
                    None
                }
                None => None,
            }
        };

        let Some(job) = job else {
            return Ok(());
        };
        let pool = self.clone();
        let tenant = tenant.clone();
        tokio::spawn(async move { pool.run_stop(&tenant, job).await })
            .await
            .unwrap_or_else(|e| {
                Err(SandboxError::Io {
                    context: "stopping instance".to_string(),
                    reason: e.to_string(),
                })
            })
    }

    /// Stops every running instance that has no leases.
    ///
    /// # Errors
    ///
    /// Returns the last platform error; every instance is attempted.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), SandboxError> {
        let jobs: Vec<(TenantId, StopJob)> = {
            let mut slots = self.inner.slots.lock();
            slots
                .iter_mut()
                .filter(|(_, slot)| slot.state == InstanceState::Running && slot.ref_count == 0)
                .map(|(tenant, slot)| (tenant.clone(), Self::begin_stop(slot)))
                .collect()
        };

        debug!(count = jobs.len(), "Shutting down idle instances");
        let mut outcome = Ok(());
        for (tenant, job) in jobs {
            if let Err(err) = self.run_stop(&tenant, job).await {
                warn!(%tenant, error = %err, "Shutdown stop failed");
                outcome = Err(err);
            }
        }
        outcome
    }

    /// Current state of `tenant`'s instance; `Stopped` when not registered.
    #[must_use]
    pub fn state(&self, tenant: &TenantId) -> InstanceState {
        self.inner
            .slots
            .lock()
            .get(tenant)
            .map_or(InstanceState::Stopped, |slot| slot.state)
    }

    /// Number of live leases on `tenant`'s instance.
    #[must_use]
    pub fn ref_count(&self, tenant: &TenantId) -> usize {
        self.inner
            .slots
            .lock()
            .get(tenant)
            .map_or(0, |slot| slot.ref_count)
    }

    /// Address held by `tenant`'s instance while it is running.
    #[must_use]
    pub fn address(&self, tenant: &TenantId) -> Option<Ipv4Addr> {
        self.inner
            .slots
            .lock()
            .get(tenant)
            .and_then(|slot| slot.address.as_ref().map(AddressLease::addr))
    }

    /// Returns `true` if `tenant` has a registry entry.
    #[must_use]
    pub fn contains(&self, tenant: &TenantId) -> bool {
        self.inner.slots.lock().contains_key(tenant)
    }

    /// Number of registry entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Returns `true` if no tenant has a registry entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.slots.lock().is_empty()
    }
}

/// A hold on a running pooled instance.
///
/// Dropping the lease releases it; the last release stops the instance (after the
/// idle grace period, if one is configured).
#[derive(Debug)]
pub struct InstanceLease {
    pool: InstancePool,
    tenant: TenantId,
    name: String,
    released: bool,
}

impl InstanceLease {
    fn new(pool: InstancePool, tenant: &TenantId, name: &str) -> Self {
        Self {
            pool,
            tenant: tenant.clone(),
            name: name.to_string(),
            released: false,
        }
    }

    /// The tenant this lease belongs to.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Platform name of the running instance.
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.name
    }

    /// Releases the lease now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(&self.tenant);
        }
    }
}
