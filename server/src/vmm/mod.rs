//! Hypervisor abstraction layer.
//!
//! The VM manager is generic over [`VmmBackend`] so the hypervisor layer can
//! be swapped for testing without touching real processes, sockets, or the
//! filesystem. The real backend drives a microVM hypervisor through its
//! control API over a unix socket.

pub mod firecracker;
#[cfg(test)]
pub mod mock;

use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::config::HypervisorConfig;
use crate::network;

pub use firecracker::FirecrackerBackend;

// ─── Errors ────────────────────────────────────────────────────────────────

/// VM lifecycle failures, one variant per failing stage so the record in the
/// task store names what broke.
#[derive(Debug)]
pub enum VmError {
    /// No free IP or context id
    Allocation(String),
    /// Missing kernel, rootfs template, or host tooling
    Preflight(String),
    /// The hypervisor process failed to spawn or died early
    ProcessLaunch(String),
    /// A control API call returned non-2xx; `step` names the call
    Api { step: &'static str, message: String },
    /// The control socket never appeared within the deadline
    SocketTimeout(String),
    Io(std::io::Error),
    Internal(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Allocation(msg) => write!(f, "allocation: {msg}"),
            VmError::Preflight(msg) => write!(f, "preflight: {msg}"),
            VmError::ProcessLaunch(msg) => write!(f, "process launch: {msg}"),
            VmError::Api { step, message } => write!(f, "hypervisor API {step}: {message}"),
            VmError::SocketTimeout(msg) => write!(f, "control socket timeout: {msg}"),
            VmError::Io(err) => write!(f, "io: {err}"),
            VmError::Internal(msg) => write!(f, "internal: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for VmError {
    fn from(err: std::io::Error) -> Self {
        VmError::Io(err)
    }
}

// ─── Per-VM resource assignment ────────────────────────────────────────────

/// Host-side identity of one VM: every path, device, and address assigned to
/// it. Built once at create and threaded through prepare/spawn/cleanup.
#[derive(Debug, Clone)]
pub struct VmResources {
    pub task_id: Uuid,
    pub context_id: u32,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub tap_device: String,
    pub volume_path: PathBuf,
    pub control_socket: PathBuf,
    pub vsock_path: PathBuf,
    pub log_path: PathBuf,
    pub pid_path: PathBuf,
}

impl VmResources {
    pub fn assign(
        task_id: Uuid,
        context_id: u32,
        ip: Ipv4Addr,
        gateway: Ipv4Addr,
        hypervisor: &HypervisorConfig,
    ) -> Self {
        Self {
            task_id,
            context_id,
            ip,
            gateway,
            tap_device: network::tap_name(task_id),
            volume_path: hypervisor.volume_path(task_id),
            control_socket: hypervisor.control_socket_path(task_id),
            vsock_path: hypervisor.vsock_path(task_id),
            log_path: hypervisor.log_path(task_id),
            pid_path: hypervisor.pid_path(task_id),
        }
    }
}

/// Boot parameters derived from the task config.
#[derive(Debug, Clone)]
pub struct BootSpec {
    pub vcpu_count: u8,
    pub memory_mb: u64,
    pub storage_gb: u64,
    pub ssh_public_key: Option<String>,
}

// ─── Backend traits ────────────────────────────────────────────────────────

/// Per-VM control API client, live once the hypervisor process is up.
pub trait VmmClient: Send + Sync + 'static {
    /// Configure boot source, machine, drives, network, and vsock — in that
    /// order. Must be called exactly once, before [`VmmClient::start`].
    fn configure(
        &self,
        spec: &BootSpec,
        res: &VmResources,
    ) -> impl Future<Output = Result<(), VmError>> + Send;

    /// Issue the instance-start action.
    fn start(&self) -> impl Future<Output = Result<(), VmError>> + Send;

    fn pause(&self) -> impl Future<Output = Result<(), VmError>> + Send;

    fn resume(&self) -> impl Future<Output = Result<(), VmError>> + Send;
}

/// OS process handle for a running hypervisor.
pub trait VmmProcess: Send + 'static {
    fn pid(&self) -> Option<u32>;

    /// Graceful then forceful: SIGTERM, wait up to `grace`, then SIGKILL,
    /// and reap the child either way.
    fn shutdown(&mut self, grace: Duration) -> impl Future<Output = Result<(), VmError>> + Send;
}

/// Factory for the per-VM client and process plus the host-side files and
/// devices they need.
pub trait VmmBackend: Send + Sync + 'static {
    type Client: VmmClient;
    type Process: VmmProcess;

    /// Create the directory layout, tap device, volume, and log file.
    fn prepare(
        &self,
        res: &VmResources,
        spec: &BootSpec,
    ) -> impl Future<Output = Result<(), VmError>> + Send;

    /// Launch the hypervisor and wait for its control socket.
    fn spawn(
        &self,
        res: &VmResources,
    ) -> impl Future<Output = Result<(Self::Client, Self::Process), VmError>> + Send;

    /// Remove the volume, sockets, pid file, and tap device. Idempotent;
    /// called both on create rollback and on terminate.
    fn cleanup(&self, res: &VmResources) -> impl Future<Output = Result<(), VmError>> + Send;
}
