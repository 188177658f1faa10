//! REST response bodies.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::requests::TaskConfig;
use crate::status::{TaskSource, TaskStatus};

/// The task row as clients see it. Timestamps are RFC 3339 strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub user_id: String,
    pub guild_id: Option<String>,
    pub status: TaskStatus,
    pub source: TaskSource,
    pub repositories: Vec<String>,
    pub vm_id: Option<String>,
    pub config: Option<TaskConfig>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
    pub web_url: String,
    pub ssh_command: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskResponse>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

/// Error payload for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
