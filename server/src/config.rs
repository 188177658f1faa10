//! Server configuration.
//!
//! Read once at startup: compiled-in defaults, overlaid by `config.toml`,
//! overlaid by `config.local.toml` (both optional, merged key by key). The
//! result is an immutable [`Config`] handed to every component by `Arc` —
//! nothing reads configuration after startup.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug)]
pub enum ConfigError {
    Read(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(path, err) => write!(f, "cannot read {}: {err}", path.display()),
            ConfigError::Parse(path, err) => write!(f, "cannot parse {}: {err}", path.display()),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL the browser UI is reachable at; used to build `web_url`.
    pub web_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            web_url: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://tasks.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub bin_path: PathBuf,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub volumes_dir: PathBuf,
    pub sockets_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub pids_dir: PathBuf,
    /// Passed through to the machine section when set.
    pub machine_type: Option<String>,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            bin_path: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_path: PathBuf::from("/var/lib/vm-api/vmlinux"),
            rootfs_path: PathBuf::from("/var/lib/vm-api/rootfs.ext4"),
            volumes_dir: PathBuf::from("/var/lib/vm-api/volumes"),
            sockets_dir: PathBuf::from("/run/vm-api/sockets"),
            logs_dir: PathBuf::from("/var/log/vm-api"),
            pids_dir: PathBuf::from("/run/vm-api/pids"),
            machine_type: None,
        }
    }
}

impl HypervisorConfig {
    pub fn volume_path(&self, task_id: Uuid) -> PathBuf {
        self.volumes_dir.join(format!("{task_id}.ext4"))
    }

    pub fn control_socket_path(&self, task_id: Uuid) -> PathBuf {
        self.sockets_dir.join(format!("{task_id}.control"))
    }

    pub fn vsock_path(&self, task_id: Uuid) -> PathBuf {
        self.sockets_dir.join(format!("{task_id}.vsock"))
    }

    pub fn log_path(&self, task_id: Uuid) -> PathBuf {
        self.logs_dir.join(format!("{task_id}.log"))
    }

    pub fn pid_path(&self, task_id: Uuid) -> PathBuf {
        self.pids_dir.join(format!("{task_id}.pid"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmConfigDefaults {
    pub default_vcpu_count: u8,
    pub default_memory_mb: u64,
    pub default_storage_gb: u64,
    /// Fractional minutes; a running task with no subscriber input and no
    /// non-heartbeat output for this long is paused.
    pub idle_timeout_minutes: f64,
    /// First vsock context id handed out. Never below 3.
    pub vsock_cid_start: u32,
}

impl Default for VmConfigDefaults {
    fn default() -> Self {
        Self {
            default_vcpu_count: 2,
            default_memory_mb: 2048,
            default_storage_gb: 50,
            idle_timeout_minutes: 30.0,
            vsock_cid_start: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bridge_name: String,
    /// Bridge address, also the guests' gateway.
    pub bridge_ip: String,
    /// /24 the guest IPs are carved from; hosts .100–.254 are assignable.
    pub subnet: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: "br-vmapi".to_string(),
            bridge_ip: "172.16.0.1".to_string(),
            subnet: "172.16.0.0/24".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn gateway(&self) -> Result<Ipv4Addr, ConfigError> {
        self.bridge_ip
            .split('/')
            .next()
            .unwrap_or("")
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad bridge_ip: {}", self.bridge_ip)))
    }
}

/// Held only in process memory; the Debug impl redacts so the key can never
/// reach a log line through a formatted dump.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct Secrets {
    pub agent_api_key: String,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("agent_api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub hypervisor: HypervisorConfig,
    pub vm: VmConfigDefaults,
    pub network: NetworkConfig,
    pub secrets: Secrets,
}

impl Config {
    /// `config.toml` overlaid by `config.local.toml`, over defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_files(Path::new("config.toml"), Path::new("config.local.toml"))
    }

    pub fn from_files(base: &Path, local: &Path) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        for path in [base, local] {
            if let Some(value) = read_toml(path)? {
                merge(&mut merged, value);
            }
        }
        let config: Config = merged
            .try_into()
            .map_err(|e| ConfigError::Parse(base.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.network.gateway()?;
        subnet_prefix(&self.network.subnet)?;
        if self.vm.idle_timeout_minutes <= 0.0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_minutes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn task_web_url(&self, task_id: Uuid) -> String {
        format!("{}/tasks/{task_id}", self.server.web_url.trim_end_matches('/'))
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.vm.idle_timeout_minutes * 60.0)
    }
}

/// First three octets of a `/24` such as `"172.16.0.0/24"`.
pub fn subnet_prefix(subnet: &str) -> Result<[u8; 3], ConfigError> {
    let addr = subnet.split('/').next().unwrap_or("");
    let parsed: Ipv4Addr = addr
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("bad subnet: {subnet}")))?;
    let [a, b, c, _] = parsed.octets();
    Ok([a, b, c])
}

fn read_toml(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ConfigError::Read(path.to_path_buf(), e)),
    };
    let value = content
        .parse::<toml::Value>()
        .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
    Ok(Some(value))
}

/// Key-level merge; overlay wins, tables recurse.
fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
