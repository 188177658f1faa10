//! Firecracker backend.
//!
//! Spawns one `firecracker` process per task and drives its configuration
//! REST API over the control unix socket: boot source, machine config,
//! drives, network interface, vsock, then the instance-start action.
//! Pause/resume go through `PATCH /vm`. The process must not be launched
//! before its log file exists — the hypervisor refuses to start otherwise.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixConnector, Uri as UnixUri};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::json;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::config::{HypervisorConfig, NetworkConfig};
use crate::vmm::{BootSpec, VmError, VmResources, VmmBackend, VmmClient, VmmProcess};

/// How long the control socket may take to appear after spawn.
const SOCKET_WAIT: Duration = Duration::from_secs(5);
const SOCKET_POLL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct FirecrackerBackend {
    hypervisor: HypervisorConfig,
    network: NetworkConfig,
}

impl FirecrackerBackend {
    pub fn new(hypervisor: HypervisorConfig, network: NetworkConfig) -> Self {
        Self { hypervisor, network }
    }
}

impl VmmBackend for FirecrackerBackend {
    type Client = FirecrackerClient;
    type Process = FirecrackerProcess;

    async fn prepare(&self, res: &VmResources, spec: &BootSpec) -> Result<(), VmError> {
        // Preflight: everything we are about to copy or exec must exist.
        for (what, path) in [
            ("hypervisor binary", &self.hypervisor.bin_path),
            ("kernel", &self.hypervisor.kernel_path),
            ("rootfs template", &self.hypervisor.rootfs_path),
        ] {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Err(VmError::Preflight(format!(
                    "{what} missing: {}",
                    path.display()
                )));
            }
        }

        for dir in [
            &self.hypervisor.volumes_dir,
            &self.hypervisor.sockets_dir,
            &self.hypervisor.logs_dir,
            &self.hypervisor.pids_dir,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }

        // A stale socket from a crashed run makes the hypervisor refuse to bind.
        remove_if_exists(&res.control_socket).await?;
        remove_if_exists(&res.vsock_path).await?;

        copy_volume(&self.hypervisor.rootfs_path, &res.volume_path, spec.storage_gb).await?;

        // The hypervisor refuses to launch when the log file is absent.
        tokio::fs::File::create(&res.log_path).await?;

        crate::network::create_tap_device(&res.tap_device, &self.network.bridge_name).await?;

        Ok(())
    }

    async fn spawn(&self, res: &VmResources) -> Result<(FirecrackerClient, FirecrackerProcess), VmError> {
        let mut child = Command::new(&self.hypervisor.bin_path)
            .arg("--api-sock")
            .arg(&res.control_socket)
            .arg("--id")
            .arg(res.task_id.to_string())
            .arg("--log-path")
            .arg(&res.log_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| VmError::ProcessLaunch(format!("spawn {}: {e}", self.hypervisor.bin_path.display())))?;

        if let Some(pid) = child.id() {
            tokio::fs::write(&res.pid_path, pid.to_string()).await?;
        }

        // The process daemonizes only after the socket is ready, so poll for
        // it and bail if the child dies first.
        let deadline = Instant::now() + SOCKET_WAIT;
        loop {
            if tokio::fs::try_exists(&res.control_socket).await.unwrap_or(false) {
                break;
            }
            if let Some(status) = child.try_wait().map_err(VmError::Io)? {
                return Err(VmError::ProcessLaunch(format!(
                    "hypervisor exited before its control socket came up: {status}"
                )));
            }
            if Instant::now() >= deadline {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(VmError::SocketTimeout(format!(
                    "{} not ready within {SOCKET_WAIT:?}",
                    res.control_socket.display()
                )));
            }
            sleep(SOCKET_POLL).await;
        }

        info!(task_id = %res.task_id, pid = ?child.id(), "Hypervisor process started");

        let client = FirecrackerClient::new(
            &res.control_socket,
            self.hypervisor.kernel_path.clone(),
            self.hypervisor.machine_type.clone(),
        );
        let process = FirecrackerProcess { child };
        Ok((client, process))
    }

    async fn cleanup(&self, res: &VmResources) -> Result<(), VmError> {
        remove_if_exists(&res.volume_path).await?;
        remove_if_exists(&res.control_socket).await?;
        remove_if_exists(&res.vsock_path).await?;
        remove_if_exists(&res.pid_path).await?;
        crate::network::delete_tap_device(&res.tap_device).await?;
        Ok(())
    }
}

async fn remove_if_exists(path: &std::path::Path) -> Result<(), VmError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VmError::Io(e)),
    }
}

/// Startup reconciliation. No VM handle survives a restart, so every pid
/// file in the runtime directory belongs to a dead task: kill the recorded
/// process and remove the task's files and tap device. Returns how many
/// orphans were swept.
pub async fn sweep_orphans(hypervisor: &HypervisorConfig) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(&hypervisor.pids_dir).await else {
        return 0;
    };

    let mut swept = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pid") {
            continue;
        }
        let Some(task_id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
        else {
            continue;
        };

        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            if let Ok(pid) = content.trim().parse::<i32>() {
                warn!(task_id = %task_id, pid = pid, "Killing orphaned hypervisor process");
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }

        let _ = remove_if_exists(&hypervisor.volume_path(task_id)).await;
        let _ = remove_if_exists(&hypervisor.control_socket_path(task_id)).await;
        let _ = remove_if_exists(&hypervisor.vsock_path(task_id)).await;
        let _ = remove_if_exists(&path).await;
        let _ = crate::network::delete_tap_device(&crate::network::tap_name(task_id)).await;
        swept += 1;
    }
    swept
}

/// Copy the rootfs template into the per-task volume (reflink when the
/// filesystem supports it, full copy otherwise) and grow it sparsely to the
/// requested size.
async fn copy_volume(
    template: &std::path::Path,
    volume: &std::path::Path,
    storage_gb: u64,
) -> Result<(), VmError> {
    let output = Command::new("cp")
        .arg("--reflink=auto")
        .arg("--sparse=always")
        .arg(template)
        .arg(volume)
        .output()
        .await
        .map_err(VmError::Io)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VmError::Preflight(format!(
            "volume copy failed: {}",
            stderr.trim()
        )));
    }

    let target_len = storage_gb * 1024 * 1024 * 1024;
    let file = tokio::fs::OpenOptions::new().write(true).open(volume).await?;
    let current = file.metadata().await?.len();
    if current < target_len {
        file.set_len(target_len).await?;
    }
    Ok(())
}

// ─── Process handle ────────────────────────────────────────────────────────

pub struct FirecrackerProcess {
    child: Child,
}

impl VmmProcess for FirecrackerProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<(), VmError> {
        let Some(pid) = self.child.id() else {
            // Already reaped
            return Ok(());
        };

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid = pid, error = %e, "SIGTERM failed (process may be gone)");
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(result) => {
                result.map_err(VmError::Io)?;
            }
            Err(_elapsed) => {
                warn!(pid = pid, "Hypervisor ignored SIGTERM, sending SIGKILL");
                self.child.start_kill().map_err(VmError::Io)?;
                self.child.wait().await.map_err(VmError::Io)?;
            }
        }
        Ok(())
    }
}

// ─── Control API client ────────────────────────────────────────────────────

/// Stateless REST client for one hypervisor's control socket.
#[derive(Clone)]
pub struct FirecrackerClient {
    socket_path: PathBuf,
    kernel_path: PathBuf,
    machine_type: Option<String>,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl FirecrackerClient {
    pub fn new(
        socket_path: &std::path::Path,
        kernel_path: PathBuf,
        machine_type: Option<String>,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(UnixConnector);
        Self {
            socket_path: socket_path.to_path_buf(),
            kernel_path,
            machine_type,
            client,
        }
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
        step: &'static str,
    ) -> Result<(), VmError> {
        let uri: hyper::Uri = UnixUri::new(&self.socket_path, endpoint).into();
        let payload = match body {
            Some(value) => Bytes::from(value.to_string()),
            None => Bytes::new(),
        };
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(payload))
            .map_err(|e| VmError::Api {
                step,
                message: e.to_string(),
            })?;

        let response = self.client.request(request).await.map_err(|e| VmError::Api {
            step,
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let bytes = response
                .into_body()
                .collect()
                .await
                .map(|b| b.to_bytes())
                .unwrap_or_default();
            return Err(VmError::Api {
                step,
                message: format!("{status}: {}", String::from_utf8_lossy(&bytes)),
            });
        }
        Ok(())
    }

    fn boot_args(spec: &BootSpec, res: &VmResources) -> String {
        let mut args = format!(
            "console=ttyS0 reboot=k panic=1 pci=off lia.ip={} lia.gateway={}",
            res.ip, res.gateway
        );
        if let Some(key) = &spec.ssh_public_key {
            args.push_str(&format!(" lia.ssh_key={}", urlencoding::encode(key)));
        }
        args
    }
}

impl VmmClient for FirecrackerClient {
    async fn configure(&self, spec: &BootSpec, res: &VmResources) -> Result<(), VmError> {
        self.send(
            Method::PUT,
            "/boot-source",
            Some(json!({
                "kernel_image_path": self.kernel_path.to_string_lossy(),
                "boot_args": Self::boot_args(spec, res),
            })),
            "boot-source",
        )
        .await?;

        let mut machine = json!({
            "vcpu_count": spec.vcpu_count,
            "mem_size_mib": spec.memory_mb,
            "smt": false,
        });
        if let Some(machine_type) = &self.machine_type {
            machine["machine_type"] = json!(machine_type);
        }
        self.send(Method::PUT, "/machine-config", Some(machine), "machine-config")
            .await?;

        self.send(
            Method::PUT,
            "/drives/rootfs",
            Some(json!({
                "drive_id": "rootfs",
                "path_on_host": res.volume_path.to_string_lossy(),
                "is_root_device": true,
                "is_read_only": false,
            })),
            "drives",
        )
        .await?;

        self.send(
            Method::PUT,
            "/network-interfaces/eth0",
            Some(json!({
                "iface_id": "eth0",
                "host_dev_name": res.tap_device,
            })),
            "network-interfaces",
        )
        .await?;

        self.send(
            Method::PUT,
            "/vsock",
            Some(json!({
                "guest_cid": res.context_id,
                "uds_path": res.vsock_path.to_string_lossy(),
            })),
            "vsock",
        )
        .await?;

        Ok(())
    }

    async fn start(&self) -> Result<(), VmError> {
        self.send(
            Method::PUT,
            "/actions",
            Some(json!({ "action_type": "InstanceStart" })),
            "instance-start",
        )
        .await
    }

    async fn pause(&self) -> Result<(), VmError> {
        self.send(
            Method::PATCH,
            "/vm",
            Some(json!({ "state": "Paused" })),
            "pause",
        )
        .await
    }

    async fn resume(&self) -> Result<(), VmError> {
        self.send(
            Method::PATCH,
            "/vm",
            Some(json!({ "state": "Resumed" })),
            "resume",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HypervisorConfig;
    use uuid::Uuid;

    fn resources() -> VmResources {
        VmResources::assign(
            Uuid::new_v4(),
            105,
            "172.16.0.103".parse().unwrap(),
            "172.16.0.1".parse().unwrap(),
            &HypervisorConfig::default(),
        )
    }

    #[test]
    fn boot_args_carry_ip_and_gateway() {
        let spec = BootSpec {
            vcpu_count: 2,
            memory_mb: 2048,
            storage_gb: 50,
            ssh_public_key: None,
        };
        let args = FirecrackerClient::boot_args(&spec, &resources());
        assert!(args.contains("lia.ip=172.16.0.103"), "got: {args}");
        assert!(args.contains("lia.gateway=172.16.0.1"), "got: {args}");
        assert!(!args.contains("lia.ssh_key"), "got: {args}");
    }

    #[test]
    fn ssh_key_is_url_encoded() {
        let spec = BootSpec {
            vcpu_count: 2,
            memory_mb: 2048,
            storage_gb: 50,
            ssh_public_key: Some("ssh-ed25519 AAAA+base64/chars user@host".to_string()),
        };
        let args = FirecrackerClient::boot_args(&spec, &resources());
        assert!(args.contains("lia.ssh_key=ssh-ed25519%20AAAA%2Bbase64%2Fchars%20user%40host"), "got: {args}");
        // The encoded key must not introduce a space that would split the arg
        let key_arg = args.split_whitespace().find(|a| a.starts_with("lia.ssh_key=")).unwrap();
        assert!(key_arg.len() > "lia.ssh_key=".len());
    }

    #[test]
    fn resource_paths_are_namespaced_by_task_id() {
        let res = resources();
        let id = res.task_id.to_string();
        assert!(res.volume_path.to_string_lossy().contains(&id));
        assert!(res.control_socket.to_string_lossy().ends_with(&format!("{id}.control")));
        assert!(res.vsock_path.to_string_lossy().ends_with(&format!("{id}.vsock")));
        assert!(res.log_path.to_string_lossy().ends_with(&format!("{id}.log")));
        assert!(res.pid_path.to_string_lossy().ends_with(&format!("{id}.pid")));
    }
}
