//! REST surface.
//!
//! Handlers validate, dispatch to the store / VM manager / hubs, and shape
//! responses; they hold no state beyond the shared handles in [`AppState`].
//! Long-running work (VM boot) is spawned into a detached pipeline and the
//! create response returns immediately with status=starting.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use schema::{
    CreateTaskRequest, ListTasksQuery, TaskConfig, TaskEvent, TaskListResponse, TaskResponse,
    TaskStatus,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::database::DatabaseError;
use crate::error::ApiError;
use crate::hub::HubRegistry;
use crate::lifecycle::{self, CancellationSet, PipelineInput};
use crate::tasks::{NewTask, Task, TaskStore};
use crate::vm_manager::VmManager;
use crate::vmm::VmmBackend;
use crate::ws;

pub struct AppState<B: VmmBackend> {
    pub config: Arc<Config>,
    pub store: TaskStore,
    pub manager: Arc<VmManager<B>>,
    pub hubs: Arc<HubRegistry>,
    pub cancels: Arc<CancellationSet>,
}

impl<B: VmmBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            store: self.store.clone(),
            manager: Arc::clone(&self.manager),
            hubs: Arc::clone(&self.hubs),
            cancels: Arc::clone(&self.cancels),
        }
    }
}

/// The `/api/v1` routes.
pub fn routes<B: VmmBackend>() -> Router<AppState<B>> {
    Router::new()
        .route("/tasks", post(create_task::<B>).get(list_tasks::<B>))
        .route("/tasks/{id}", get(get_task::<B>).delete(delete_task::<B>))
        .route("/tasks/{id}/resume", post(resume_task::<B>))
        .route("/tasks/{id}/output", get(task_output::<B>))
        .route("/tasks/{id}/stream", get(ws::stream_task::<B>))
}

/// Shape a domain task for the wire.
pub fn task_response(task: &Task, config: &Config) -> TaskResponse {
    let ssh_command = task
        .ip_address
        .as_deref()
        .map(|ip| format!("ssh agent@{ip}"));
    TaskResponse {
        id: task.id,
        user_id: task.user_id.clone(),
        guild_id: task.guild_id.clone(),
        status: task.status,
        source: task.source,
        repositories: task.repositories.clone(),
        vm_id: task.vm_id.clone(),
        config: Some(task.config.clone()),
        created_at: task.created_at.clone(),
        started_at: task.started_at.clone(),
        completed_at: task.completed_at.clone(),
        exit_code: task.exit_code,
        error_message: task.error_message.clone(),
        web_url: config.task_web_url(task.id),
        ssh_command,
        ip_address: task.ip_address.clone(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_task<B: VmmBackend>(
    State(state): State<AppState<B>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<TaskResponse>, ApiError> {
    // Deserialize by hand so every shape violation is a 400 with the field
    // named, not a generic rejection.
    let request: CreateTaskRequest =
        serde_json::from_value(body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    request.validate().map_err(ApiError::BadRequest)?;

    let config: TaskConfig = request.config.clone().unwrap_or_default();
    let task = state
        .store
        .create(NewTask {
            user_id: request.user_id.clone(),
            source: request.source,
            repositories: request.repositories.clone(),
            config,
            group_id: request.guild_id.clone(),
            ssh_public_key: request.ssh_public_key.clone(),
        })
        .await?;

    info!(task_id = %task.id, user_id = %task.user_id, source = %task.source, "Task created");

    let context_id = state.manager.allocate_context_id();
    let vm_id = format!("vm-{}", &task.id.simple().to_string()[..8]);
    let task = match state.store.mark_starting(task.id, &vm_id, context_id).await {
        Ok(task) => task,
        Err(e) => {
            let _ = state
                .store
                .mark_terminated(task.id, Some(1), Some(&e.to_string()))
                .await;
            return Err(e.into());
        }
    };

    lifecycle::spawn(
        state.clone(),
        task.clone(),
        PipelineInput {
            context_id,
            prompt: request.prompt,
            files: request.files.unwrap_or_default(),
        },
    );

    Ok(Json(task_response(&task, &state.config)))
}

async fn get_task<B: VmmBackend>(
    State(state): State<AppState<B>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {id}")))?;
    Ok(Json(task_response(&task, &state.config)))
}

async fn list_tasks<B: VmmBackend>(
    State(state): State<AppState<B>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<TaskListResponse>, ApiError> {
    let (tasks, total) = state.store.list(&query).await?;
    let tasks = tasks
        .iter()
        .map(|task| task_response(task, &state.config))
        .collect();
    Ok(Json(TaskListResponse {
        tasks,
        total,
        page: query.page(),
        per_page: query.per_page(),
    }))
}

async fn delete_task<B: VmmBackend>(
    State(state): State<AppState<B>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let task = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {id}")))?;

    // Stop the pipeline first so it cannot race new work in, then tear the
    // VM down (idempotent, serialized behind any in-flight create).
    state.cancels.cancel(id);
    if let Err(e) = state.manager.terminate(id).await {
        warn!(task_id = %id, error = %e, "VM teardown on delete reported an error");
    }

    if task.status != TaskStatus::Terminated {
        match state.store.mark_terminated(id, None, None).await {
            Ok(_) => {
                if let Some(hub) = state.hubs.get(id) {
                    hub.publish_status(TaskStatus::Terminated, None);
                }
            }
            // A background failure settled the row between our read and the
            // update; the task is terminated either way.
            Err(DatabaseError::InvalidState(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    state.hubs.remove_if_done(id);
    info!(task_id = %id, "Task deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_task<B: VmmBackend>(
    State(state): State<AppState<B>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {id}")))?;

    if task.status != TaskStatus::Suspended {
        return Err(ApiError::InvalidState(format!(
            "task {id} is {}, only suspended tasks can be resumed",
            task.status
        )));
    }

    state.manager.resume(id).await?;
    let task = state.store.mark_resumed(id).await?;

    if let Some(hub) = state.hubs.get(id) {
        // Resuming resets the idle clock.
        hub.touch();
        hub.publish_status(TaskStatus::Running, None);
    }

    Ok(Json(task_response(&task, &state.config)))
}

async fn task_output<B: VmmBackend>(
    State(state): State<AppState<B>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TaskEvent>>, ApiError> {
    if state.store.get(id).await?.is_none() {
        return Err(ApiError::NotFound(format!("task {id}")));
    }
    let events = state
        .hubs
        .get(id)
        .map(|hub| hub.snapshot())
        .unwrap_or_default();
    Ok(Json(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::vmm::mock::MockBackend;
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_state() -> AppState<MockBackend> {
        let config = Arc::new(Config::default());
        let db = Database::new("sqlite::memory:", 1).await.unwrap();
        let store = TaskStore::new(db);
        let (backend, _tracker) = MockBackend::new();
        let manager = Arc::new(VmManager::new(backend, Arc::clone(&config)).unwrap());
        AppState {
            config,
            store,
            manager,
            hubs: HubRegistry::new(),
            cancels: CancellationSet::new(),
        }
    }

    fn app(state: AppState<MockBackend>) -> Router {
        Router::new()
            .route("/health", get(|| async { "OK" }))
            .nest("/api/v1", routes())
            .with_state(state)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    const VALID_CREATE: &str =
        r#"{"prompt": "hi", "repositories": ["octo/repo"], "source": "web", "user_id": "u-1"}"#;

    #[tokio::test]
    async fn health_is_ok() {
        let response = app(test_state().await)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_returns_starting_with_web_url() {
        let state = test_state().await;
        let response = app(state.clone())
            .oneshot(post_json("/api/v1/tasks", VALID_CREATE))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "starting");
        assert_eq!(body["user_id"], "u-1");
        assert!(body["vm_id"].as_str().unwrap().starts_with("vm-"));
        let id = body["id"].as_str().unwrap();
        assert_eq!(
            body["web_url"].as_str().unwrap(),
            format!("http://localhost:8080/tasks/{id}")
        );
    }

    #[tokio::test]
    async fn invalid_repository_is_400_and_inserts_nothing() {
        let state = test_state().await;
        let response = app(state.clone())
            .oneshot(post_json(
                "/api/v1/tasks",
                r#"{"prompt": "hi", "repositories": ["bad repo"], "source": "web"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let (tasks, total) = state.store.list(&ListTasksQuery::default()).await.unwrap();
        assert!(tasks.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn unknown_body_field_is_400() {
        let response = app(test_state().await)
            .oneshot(post_json(
                "/api/v1/tasks",
                r#"{"prompt": "hi", "repositories": ["a/b"], "source": "web", "nope": true}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_unknown_task_is_404() {
        let response = app(test_state().await)
            .oneshot(
                Request::get(format!("/api/v1/tasks/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn created_task_is_fetchable_and_listed() {
        let state = test_state().await;
        let created = body_json(
            app(state.clone())
                .oneshot(post_json("/api/v1/tasks", VALID_CREATE))
                .await
                .unwrap(),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();

        let fetched = body_json(
            app(state.clone())
                .oneshot(
                    Request::get(format!("/api/v1/tasks/{id}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(fetched["id"], id.as_str());

        let listed = body_json(
            app(state)
                .oneshot(
                    Request::get("/api/v1/tasks?user_id=u-1&per_page=5")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(listed["total"], 1);
        assert_eq!(listed["page"], 1);
        assert_eq!(listed["per_page"], 5);
        assert_eq!(listed["tasks"][0]["id"], id.as_str());
    }

    #[tokio::test]
    async fn resume_when_not_suspended_is_409() {
        let state = test_state().await;
        let created = body_json(
            app(state.clone())
                .oneshot(post_json("/api/v1/tasks", VALID_CREATE))
                .await
                .unwrap(),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();

        let response = app(state.clone())
            .oneshot(post_json(&format!("/api/v1/tasks/{id}/resume"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // status unchanged
        let task = state.store.get(id.parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Starting);
    }

    #[tokio::test]
    async fn delete_terminates_and_is_idempotent() {
        let state = test_state().await;
        let created = body_json(
            app(state.clone())
                .oneshot(post_json("/api/v1/tasks", VALID_CREATE))
                .await
                .unwrap(),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();

        let response = app(state.clone())
            .oneshot(
                Request::delete(format!("/api/v1/tasks/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let task = state.store.get(id.parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Terminated);
        assert!(task.completed_at.is_some());

        // Deleting again observes the same state.
        let response = app(state.clone())
            .oneshot(
                Request::delete(format!("/api/v1/tasks/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn delete_unknown_task_is_404() {
        let response = app(test_state().await)
            .oneshot(
                Request::delete(format!("/api/v1/tasks/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn output_is_404_for_unknown_and_empty_for_fresh_tasks() {
        let state = test_state().await;
        let response = app(state.clone())
            .oneshot(
                Request::get(format!("/api/v1/tasks/{}/output", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let created = body_json(
            app(state.clone())
                .oneshot(post_json("/api/v1/tasks", VALID_CREATE))
                .await
                .unwrap(),
        )
        .await;
        let id = created["id"].as_str().unwrap();

        let response = app(state.clone())
            .oneshot(
                Request::get(format!("/api/v1/tasks/{id}/output"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let events = body.as_array().unwrap();
        // Only boot-progress events can be here this early, never output.
        assert!(
            events
                .iter()
                .all(|e| e["type"] == "progress" || e["type"] == "status" || e["type"] == "error")
        );
    }
}
