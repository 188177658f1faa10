//! Mock hypervisor backend for unit testing.
//!
//! Lightweight implementations of the VMM traits that track calls without
//! touching real processes, sockets, or the filesystem. Each mock records
//! what was called so tests can assert on the sequence of operations;
//! failures are injected via [`MockBackendConfig`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::vmm::{BootSpec, VmError, VmResources, VmmBackend, VmmClient, VmmProcess};

// ─── Failure injection ─────────────────────────────────────────────────────

/// Controls which operations should fail. All default to `None` (success).
#[derive(Debug, Clone, Default)]
pub struct MockBackendConfig {
    pub prepare_error: Option<String>,
    pub spawn_error: Option<String>,
    pub configure_error: Option<String>,
    pub start_error: Option<String>,
    pub pause_error: Option<String>,
    pub resume_error: Option<String>,
}

// ─── Call tracker ──────────────────────────────────────────────────────────

/// Shared counters, cloned into every client and process the backend hands
/// out, so tests can assert on what actually ran.
#[derive(Debug, Clone, Default)]
pub struct MockCallTracker {
    pub prepares: Arc<AtomicUsize>,
    pub spawns: Arc<AtomicUsize>,
    pub configures: Arc<AtomicUsize>,
    pub starts: Arc<AtomicUsize>,
    pub pauses: Arc<AtomicUsize>,
    pub resumes: Arc<AtomicUsize>,
    pub shutdowns: Arc<AtomicUsize>,
    pub cleanups: Arc<AtomicUsize>,
}

impl MockCallTracker {
    pub fn prepare_count(&self) -> usize {
        self.prepares.load(Ordering::Relaxed)
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::Relaxed)
    }

    pub fn configure_count(&self) -> usize {
        self.configures.load(Ordering::Relaxed)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn pause_count(&self) -> usize {
        self.pauses.load(Ordering::Relaxed)
    }

    pub fn resume_count(&self) -> usize {
        self.resumes.load(Ordering::Relaxed)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::Relaxed)
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::Relaxed)
    }
}

// ─── Mock client ───────────────────────────────────────────────────────────

pub struct MockClient {
    tracker: MockCallTracker,
    config: MockBackendConfig,
}

impl VmmClient for MockClient {
    async fn configure(&self, _spec: &BootSpec, _res: &VmResources) -> Result<(), VmError> {
        self.tracker.configures.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = &self.config.configure_error {
            return Err(VmError::Api {
                step: "machine-config",
                message: e.clone(),
            });
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), VmError> {
        self.tracker.starts.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = &self.config.start_error {
            return Err(VmError::Api {
                step: "instance-start",
                message: e.clone(),
            });
        }
        Ok(())
    }

    async fn pause(&self) -> Result<(), VmError> {
        self.tracker.pauses.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = &self.config.pause_error {
            return Err(VmError::Api {
                step: "pause",
                message: e.clone(),
            });
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), VmError> {
        self.tracker.resumes.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = &self.config.resume_error {
            return Err(VmError::Api {
                step: "resume",
                message: e.clone(),
            });
        }
        Ok(())
    }
}

// ─── Mock process ──────────────────────────────────────────────────────────

pub struct MockProcess {
    tracker: MockCallTracker,
}

impl VmmProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn shutdown(&mut self, _grace: Duration) -> Result<(), VmError> {
        self.tracker.shutdowns.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ─── Mock backend ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MockBackend {
    tracker: MockCallTracker,
    config: MockBackendConfig,
}

impl MockBackend {
    /// All-success mock.
    pub fn new() -> (Self, MockCallTracker) {
        Self::with_config(MockBackendConfig::default())
    }

    pub fn with_config(config: MockBackendConfig) -> (Self, MockCallTracker) {
        let tracker = MockCallTracker::default();
        let backend = Self {
            tracker: tracker.clone(),
            config,
        };
        (backend, tracker)
    }
}

impl VmmBackend for MockBackend {
    type Client = MockClient;
    type Process = MockProcess;

    async fn prepare(&self, _res: &VmResources, _spec: &BootSpec) -> Result<(), VmError> {
        self.tracker.prepares.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = &self.config.prepare_error {
            return Err(VmError::Preflight(e.clone()));
        }
        Ok(())
    }

    async fn spawn(&self, _res: &VmResources) -> Result<(MockClient, MockProcess), VmError> {
        self.tracker.spawns.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = &self.config.spawn_error {
            return Err(VmError::ProcessLaunch(e.clone()));
        }
        let client = MockClient {
            tracker: self.tracker.clone(),
            config: self.config.clone(),
        };
        let process = MockProcess {
            tracker: self.tracker.clone(),
        };
        Ok((client, process))
    }

    async fn cleanup(&self, _res: &VmResources) -> Result<(), VmError> {
        self.tracker.cleanups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
