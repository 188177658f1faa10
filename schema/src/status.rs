//! Task status machine and origin tags.
//!
//! The status graph is the single source of truth for which transitions the
//! store will accept:
//!
//! ```text
//! pending ──► starting ──► running ──► suspended
//!    │          │            │            │
//!    └──────────┴────────────┴────────────┴──► terminated
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task. Stored as lowercase text in the database and
/// serialized the same way on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Row inserted, no VM resources assigned yet
    Pending,
    /// VM resources assigned, boot pipeline in flight
    Starting,
    /// Guest booted and the agent channel is live
    Running,
    /// Hypervisor paused (idle timeout or explicit)
    Suspended,
    /// Final state; never left
    Terminated,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Starting => "starting",
            TaskStatus::Running => "running",
            TaskStatus::Suspended => "suspended",
            TaskStatus::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Terminated)
    }

    /// Whether `self → next` is an edge of the status graph.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Starting, Running)
                | (Running, Suspended)
                | (Suspended, Running)
                | (Pending, Terminated)
                | (Starting, Terminated)
                | (Running, Terminated)
                | (Suspended, Terminated)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "starting" => Ok(TaskStatus::Starting),
            "running" => Ok(TaskStatus::Running),
            "suspended" => Ok(TaskStatus::Suspended),
            "terminated" => Ok(TaskStatus::Terminated),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Where the task was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    Discord,
    Web,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Discord => "discord",
            TaskSource::Web => "web",
        }
    }
}

impl fmt::Display for TaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for TaskSource {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "discord" => Ok(TaskSource::Discord),
            "web" => Ok(TaskSource::Web),
            other => Err(format!("unknown task source: {other}")),
        }
    }
}
