//! Per-VM network resources: context-id and IP allocators, tap devices.
//!
//! Both allocators are an atomic counter plus a mutex-protected freed set;
//! allocation searches the freed set first, so values recycle only after an
//! explicit release (which `terminate` performs). Live values never alias.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::process::Command;
use uuid::Uuid;

use crate::vmm::VmError;

/// First assignable host octet in the /24.
pub const IP_HOST_START: u32 = 100;
/// Last assignable host octet in the /24.
pub const IP_HOST_END: u32 = 254;

/// Context ids below this are reserved by the vsock transport.
const CID_FLOOR: u32 = 3;

// ─── Context-id allocator ──────────────────────────────────────────────────

pub struct CidAllocator {
    next: AtomicU32,
    freed: Mutex<BTreeSet<u32>>,
}

impl CidAllocator {
    pub fn new(start: u32) -> Self {
        Self {
            next: AtomicU32::new(start.max(CID_FLOOR)),
            freed: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn allocate(&self) -> u32 {
        let mut freed = self.freed.lock().unwrap();
        if let Some(cid) = freed.pop_first() {
            return cid;
        }
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn release(&self, cid: u32) {
        self.freed.lock().unwrap().insert(cid);
    }
}

// ─── IP allocator ──────────────────────────────────────────────────────────

pub struct IpAllocator {
    prefix: [u8; 3],
    next: AtomicU32,
    freed: Mutex<BTreeSet<u32>>,
}

impl IpAllocator {
    /// `prefix` is the first three octets of the /24.
    pub fn new(prefix: [u8; 3]) -> Self {
        Self {
            prefix,
            next: AtomicU32::new(IP_HOST_START),
            freed: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn allocate(&self) -> Result<Ipv4Addr, VmError> {
        let mut freed = self.freed.lock().unwrap();
        let host = match freed.pop_first() {
            Some(host) => host,
            None => {
                let host = self.next.fetch_add(1, Ordering::Relaxed);
                if host > IP_HOST_END {
                    return Err(VmError::Allocation(format!(
                        "no free IP in {}.{}.{}.0/24",
                        self.prefix[0], self.prefix[1], self.prefix[2]
                    )));
                }
                host
            }
        };
        Ok(self.ip_for(host))
    }

    pub fn release(&self, ip: Ipv4Addr) {
        let octets = ip.octets();
        if octets[..3] == self.prefix {
            self.freed.lock().unwrap().insert(octets[3] as u32);
        }
    }

    fn ip_for(&self, host: u32) -> Ipv4Addr {
        Ipv4Addr::new(self.prefix[0], self.prefix[1], self.prefix[2], host as u8)
    }
}

// ─── Tap devices ───────────────────────────────────────────────────────────

/// Deterministic tap name from the task id's short prefix. Fits IFNAMSIZ.
pub fn tap_name(task_id: Uuid) -> String {
    let simple = task_id.simple().to_string();
    format!("tap-{}", &simple[..8])
}

/// Create a tap device and attach it to the bridge.
pub async fn create_tap_device(tap: &str, bridge: &str) -> Result<(), VmError> {
    tracing::info!(tap = tap, bridge = bridge, "Creating tap device");

    run_ip(&["tuntap", "add", "dev", tap, "mode", "tap"]).await?;
    run_ip(&["link", "set", tap, "up"]).await?;
    run_ip(&["link", "set", tap, "master", bridge]).await?;

    Ok(())
}

/// Tear a tap device down. Missing devices are fine — terminate is
/// idempotent and the device may never have been created.
pub async fn delete_tap_device(tap: &str) -> Result<(), VmError> {
    tracing::info!(tap = tap, "Deleting tap device");

    let output = Command::new("ip")
        .args(["link", "delete", tap])
        .output()
        .await
        .map_err(VmError::Io)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("Cannot find device") {
            tracing::warn!(tap = tap, error = %stderr.trim(), "Failed to delete tap device");
        }
    }
    Ok(())
}

async fn run_ip(args: &[&str]) -> Result<(), VmError> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(VmError::Io)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VmError::Preflight(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn cids_start_at_configured_base_and_never_below_three() {
        let alloc = CidAllocator::new(100);
        assert_eq!(alloc.allocate(), 100);
        assert_eq!(alloc.allocate(), 101);

        let low = CidAllocator::new(0);
        assert!(low.allocate() >= 3);
    }

    #[test]
    fn cid_freed_values_are_reused_first() {
        let alloc = CidAllocator::new(100);
        let a = alloc.allocate();
        let b = alloc.allocate();
        alloc.release(a);
        assert_eq!(alloc.allocate(), a, "freed set is searched first");
        assert_eq!(alloc.allocate(), b + 1);
    }

    #[test]
    fn live_allocations_never_alias() {
        let cids = CidAllocator::new(100);
        let ips = IpAllocator::new([172, 16, 0]);

        let mut seen_cids = HashSet::new();
        let mut seen_ips = HashSet::new();
        for _ in 0..50 {
            assert!(seen_cids.insert(cids.allocate()));
            assert!(seen_ips.insert(ips.allocate().unwrap()));
        }
    }

    #[test]
    fn ip_pool_starts_at_100_and_exhausts() {
        let alloc = IpAllocator::new([172, 16, 0]);
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(172, 16, 0, 100));

        for _ in 101..=IP_HOST_END {
            alloc.allocate().unwrap();
        }
        let err = alloc.allocate().unwrap_err();
        assert!(matches!(err, VmError::Allocation(_)), "got {err:?}");
    }

    #[test]
    fn released_ip_is_reusable() {
        let alloc = IpAllocator::new([10, 0, 7]);
        let first = alloc.allocate().unwrap();
        let _second = alloc.allocate().unwrap();
        alloc.release(first);
        assert_eq!(alloc.allocate().unwrap(), first);
    }

    #[test]
    fn release_ignores_foreign_addresses() {
        let alloc = IpAllocator::new([172, 16, 0]);
        alloc.release(Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(172, 16, 0, 100));
    }

    #[test]
    fn tap_names_are_deterministic_and_short() {
        let id = Uuid::new_v4();
        let name = tap_name(id);
        assert_eq!(name, tap_name(id));
        assert!(name.starts_with("tap-"));
        assert!(name.len() <= 15, "must fit IFNAMSIZ: {name}");
    }
}
