//! VmManager — single owner of all VM state.
//!
//! Holds the live handle table and the IP/context-id allocators. Generic over
//! [`VmmBackend`] so the hypervisor layer can be swapped for testing without
//! touching real processes or sockets.
//!
//! Operations on the same task are serialized by a per-task mutex; across
//! tasks they run in parallel. Rollback on a failed create releases every
//! resource the failed steps acquired, and `terminate` is idempotent — a
//! second call finds no handle and returns success.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use schema::{ProgressStage, TaskConfig};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{Config, subnet_prefix};
use crate::network::{CidAllocator, IpAllocator};
use crate::vmm::{BootSpec, VmError, VmResources, VmmBackend, VmmClient, VmmProcess};

/// How long a hypervisor gets to exit after SIGTERM before SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ─── Per-VM state ──────────────────────────────────────────────────────────

/// Everything the manager knows about one live VM.
pub struct VmHandle<B: VmmBackend> {
    pub resources: VmResources,
    client: B::Client,
    process: Mutex<B::Process>,
}

// ─── VmManager ─────────────────────────────────────────────────────────────

pub struct VmManager<B: VmmBackend> {
    backend: B,
    config: Arc<Config>,
    gateway: Ipv4Addr,
    cids: CidAllocator,
    ips: IpAllocator,
    handles: RwLock<HashMap<Uuid, Arc<VmHandle<B>>>>,
    locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl<B: VmmBackend> VmManager<B> {
    pub fn new(backend: B, config: Arc<Config>) -> Result<Self, VmError> {
        let gateway = config
            .network
            .gateway()
            .map_err(|e| VmError::Internal(e.to_string()))?;
        let prefix =
            subnet_prefix(&config.network.subnet).map_err(|e| VmError::Internal(e.to_string()))?;
        Ok(Self {
            backend,
            gateway,
            cids: CidAllocator::new(config.vm.vsock_cid_start),
            ips: IpAllocator::new(prefix),
            handles: RwLock::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
            config,
        })
    }

    /// Hand out the next context id. Ownership passes to the caller until
    /// `create` succeeds (after which `terminate` frees it) or `create`
    /// fails (which frees it on rollback).
    pub fn allocate_context_id(&self) -> u32 {
        self.cids.allocate()
    }

    /// Bring a VM up for a task: allocate the IP, create host-side files and
    /// devices, launch the hypervisor, drive its configuration API in order,
    /// and start the instance. `progress` is invoked at each boot stage.
    ///
    /// Idempotent: a second call for a live task returns the existing
    /// assignment without touching the hypervisor.
    #[instrument(skip(self, task_config, ssh_public_key, progress), fields(task_id = %task_id))]
    pub async fn create(
        &self,
        task_id: Uuid,
        context_id: u32,
        task_config: &TaskConfig,
        ssh_public_key: Option<String>,
        progress: impl Fn(ProgressStage) + Send + Sync,
    ) -> Result<VmResources, VmError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        if let Some(handle) = self.handle(task_id) {
            return Ok(handle.resources.clone());
        }

        progress(ProgressStage::CreatingVm);

        let ip = match self.ips.allocate() {
            Ok(ip) => ip,
            Err(e) => {
                self.cids.release(context_id);
                return Err(e);
            }
        };
        let res = VmResources::assign(task_id, context_id, ip, self.gateway, &self.config.hypervisor);
        let spec = BootSpec {
            vcpu_count: task_config.vcpu_count,
            memory_mb: task_config.max_memory_mb,
            storage_gb: task_config.storage_gb,
            ssh_public_key,
        };

        info!(ip = %res.ip, context_id = res.context_id, tap = %res.tap_device, "Creating VM");

        if let Err(e) = self.backend.prepare(&res, &spec).await {
            self.rollback(&res).await;
            return Err(e);
        }

        progress(ProgressStage::WaitingForSocket);
        let (client, mut process) = match self.backend.spawn(&res).await {
            Ok(pair) => pair,
            Err(e) => {
                self.rollback(&res).await;
                return Err(e);
            }
        };

        progress(ProgressStage::ConfiguringVm);
        if let Err(e) = client.configure(&spec, &res).await {
            let _ = process.shutdown(Duration::ZERO).await;
            self.rollback(&res).await;
            return Err(e);
        }

        progress(ProgressStage::BootingVm);
        if let Err(e) = client.start().await {
            let _ = process.shutdown(Duration::ZERO).await;
            self.rollback(&res).await;
            return Err(e);
        }

        let handle = Arc::new(VmHandle {
            resources: res.clone(),
            client,
            process: Mutex::new(process),
        });
        self.handles.write().unwrap().insert(task_id, handle);

        info!(task_id = %task_id, ip = %res.ip, "VM created and booted");
        Ok(res)
    }

    /// Idempotent: pausing a task with no live VM is a no-op.
    #[instrument(skip(self))]
    pub async fn pause(&self, task_id: Uuid) -> Result<(), VmError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let Some(handle) = self.handle(task_id) else {
            return Ok(());
        };
        handle.client.pause().await?;
        info!(task_id = %task_id, "VM paused");
        Ok(())
    }

    /// Idempotent: resuming a task with no live VM is a no-op. The relay
    /// loops survive the pause — they just block on the guest side.
    #[instrument(skip(self))]
    pub async fn resume(&self, task_id: Uuid) -> Result<(), VmError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let Some(handle) = self.handle(task_id) else {
            return Ok(());
        };
        handle.client.resume().await?;
        info!(task_id = %task_id, "VM resumed");
        Ok(())
    }

    /// Graceful-then-forceful teardown, then file and device cleanup, then
    /// the IP and context id go back to their pools. Calling this on a task
    /// that is already gone is a successful no-op.
    #[instrument(skip(self))]
    pub async fn terminate(&self, task_id: Uuid) -> Result<(), VmError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let removed = self.handles.write().unwrap().remove(&task_id);
        let Some(handle) = removed else {
            return Ok(());
        };

        if let Err(e) = handle.process.lock().await.shutdown(SHUTDOWN_GRACE).await {
            warn!(task_id = %task_id, error = %e, "Hypervisor shutdown reported an error");
        }
        if let Err(e) = self.backend.cleanup(&handle.resources).await {
            warn!(task_id = %task_id, error = %e, "VM cleanup reported an error");
        }

        self.ips.release(handle.resources.ip);
        self.cids.release(handle.resources.context_id);

        // Drop the lock entry only when nobody else is queued on it, so two
        // late operations can never end up serialized on different mutexes.
        {
            let mut locks = self.locks.lock().unwrap();
            if let Some(entry) = locks.get(&task_id) {
                if Arc::strong_count(entry) <= 2 {
                    locks.remove(&task_id);
                }
            }
        }

        info!(task_id = %task_id, "VM terminated");
        Ok(())
    }

    pub fn resources(&self, task_id: Uuid) -> Option<VmResources> {
        self.handle(task_id).map(|h| h.resources.clone())
    }

    pub fn live_count(&self) -> usize {
        self.handles.read().unwrap().len()
    }

    // ─── Helpers ───────────────────────────────────────────────────────

    fn handle(&self, task_id: Uuid) -> Option<Arc<VmHandle<B>>> {
        self.handles.read().unwrap().get(&task_id).cloned()
    }

    fn task_lock(&self, task_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(task_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Undo a partially-built VM: remove whatever files and devices exist
    /// and put the allocations back.
    async fn rollback(&self, res: &VmResources) {
        if let Err(e) = self.backend.cleanup(res).await {
            warn!(task_id = %res.task_id, error = %e, "Cleanup after failed create");
        }
        self.ips.release(res.ip);
        self.cids.release(res.context_id);
    }
}
