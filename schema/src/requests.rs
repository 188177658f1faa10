//! REST request bodies and their validation.
//!
//! Validation is done by hand on the deserialized value so the error message
//! can name the offending field. Unknown fields are rejected at the serde
//! layer — a client sending a misspelled key gets a 400, not silence.

use serde::{Deserialize, Serialize};

use crate::status::TaskSource;

/// Upper bound on the initial prompt, in characters.
pub const MAX_PROMPT_CHARS: usize = 100_000;

/// Per-task resource knobs. All fields default so a partial (or absent)
/// `config` object in the create request is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskConfig {
    pub timeout_minutes: u64,
    pub max_memory_mb: u64,
    pub vcpu_count: u8,
    pub storage_gb: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 30,
            max_memory_mb: 2048,
            vcpu_count: 2,
            storage_gb: 50,
        }
    }
}

/// A file to materialize in the guest's working directory before the agent
/// starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTaskRequest {
    pub prompt: String,
    pub repositories: Vec<String>,
    pub source: TaskSource,
    pub user_id: Option<String>,
    pub guild_id: Option<String>,
    pub config: Option<TaskConfig>,
    pub files: Option<Vec<TaskFile>>,
    pub ssh_public_key: Option<String>,
}

impl CreateTaskRequest {
    /// Check every field constraint; returns the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if self.prompt.is_empty() {
            return Err("prompt must not be empty".to_string());
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(format!("prompt exceeds {MAX_PROMPT_CHARS} characters"));
        }
        if self.repositories.is_empty() {
            return Err("at least one repository is required".to_string());
        }
        for repo in &self.repositories {
            if !is_valid_repository(repo) {
                return Err(format!("invalid repository: {repo:?} (expected owner/name)"));
            }
        }
        if let Some(user_id) = &self.user_id {
            if user_id.is_empty() {
                return Err("user_id must not be empty".to_string());
            }
        }
        if let Some(files) = &self.files {
            for file in files {
                if file.name.is_empty() {
                    return Err("file name must not be empty".to_string());
                }
            }
        }
        Ok(())
    }
}

/// `owner/name`, both segments limited to alphanumerics plus `.`, `_`, `-`.
pub fn is_valid_repository(repo: &str) -> bool {
    let Some((owner, name)) = repo.split_once('/') else {
        return false;
    };
    let segment_ok = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    };
    segment_ok(owner) && segment_ok(name)
}

/// Query parameters for `GET /api/v1/tasks`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTasksQuery {
    pub user_id: Option<String>,
    pub status: Option<crate::status::TaskStatus>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl ListTasksQuery {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page.unwrap_or(20).clamp(1, 100)
    }
}
