//! Per-task background work.
//!
//! The HTTP handler returns as soon as a task is marked starting; everything
//! after that happens here, in a detached pipeline registered in the
//! cancellation set: bring the VM up, connect the relay, flip the store to
//! running, then supervise the relay until the guest exits — and record
//! every failure into the store instead of surfacing it anywhere that could
//! panic. Teardown cancels the set and awaits, never detaches silently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use schema::wire::{HostMessage, InitFile};
use schema::{ProgressStage, TaskFile, TaskStatus};
use tokio::io::BufStream;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::database::DatabaseError;
use crate::hub::TaskHub;
use crate::relay::{self, RelayError, RelayOutcome};
use crate::tasks::Task;
use crate::vmm::{VmError, VmResources, VmmBackend};

/// Wall-clock budget from mark_starting to mark_running.
pub const CREATE_DEADLINE: Duration = Duration::from_secs(30);

/// How often the idle detector samples the hub.
const IDLE_SAMPLE: Duration = Duration::from_secs(1);

// ─── Cancellation set ──────────────────────────────────────────────────────

/// One token per detached pipeline, keyed by task id. Teardown paths cancel
/// through here so no background task outlives its task row unobserved.
#[derive(Default)]
pub struct CancellationSet {
    tokens: StdMutex<HashMap<Uuid, CancellationToken>>,
}

impl CancellationSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, task_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().unwrap().insert(task_id, token.clone());
        token
    }

    pub fn cancel(&self, task_id: Uuid) {
        if let Some(token) = self.tokens.lock().unwrap().get(&task_id) {
            token.cancel();
        }
    }

    pub fn remove(&self, task_id: Uuid) {
        self.tokens.lock().unwrap().remove(&task_id);
    }

    pub fn cancel_all(&self) {
        for token in self.tokens.lock().unwrap().values() {
            token.cancel();
        }
    }
}

// ─── Pipeline ──────────────────────────────────────────────────────────────

/// What the create request contributes to the boot pipeline beyond the task
/// row itself.
#[derive(Debug, Clone)]
pub struct PipelineInput {
    pub context_id: u32,
    pub prompt: String,
    pub files: Vec<TaskFile>,
}

#[derive(Debug)]
enum PipelineError {
    Vm(VmError),
    Relay(RelayError),
    Store(DatabaseError),
    Deadline,
    Cancelled,
    Internal(String),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Vm(e) => write!(f, "{e}"),
            PipelineError::Relay(e) => write!(f, "{e}"),
            PipelineError::Store(e) => write!(f, "{e}"),
            PipelineError::Deadline => write!(f, "boot exceeded {CREATE_DEADLINE:?}"),
            PipelineError::Cancelled => write!(f, "cancelled"),
            PipelineError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<VmError> for PipelineError {
    fn from(e: VmError) -> Self {
        PipelineError::Vm(e)
    }
}

impl From<RelayError> for PipelineError {
    fn from(e: RelayError) -> Self {
        PipelineError::Relay(e)
    }
}

impl From<DatabaseError> for PipelineError {
    fn from(e: DatabaseError) -> Self {
        PipelineError::Store(e)
    }
}

/// Detach the boot-and-supervise pipeline for a freshly started task.
pub fn spawn<B: VmmBackend>(state: AppState<B>, task: Task, input: PipelineInput) {
    tokio::spawn(run_pipeline(state, task, input));
}

async fn run_pipeline<B: VmmBackend>(state: AppState<B>, task: Task, input: PipelineInput) {
    let task_id = task.id;
    let cancel = state.cancels.register(task_id);
    let hub = state.hubs.get_or_create(task_id);

    // The boot work runs as its own task: cancelling or timing out the
    // pipeline must never drop a create mid-step, and `terminate` serializes
    // behind the per-task lock to clean up whatever the boot managed to
    // build before it noticed the cancellation.
    let boot = tokio::spawn(bring_up(
        state.clone(),
        task,
        input,
        hub.clone(),
        cancel.clone(),
    ));

    let boot_result = tokio::select! {
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        joined = tokio::time::timeout(CREATE_DEADLINE, boot) => match joined {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(PipelineError::Internal(format!(
                "boot task failed: {join_error}"
            ))),
            Err(_elapsed) => {
                cancel.cancel();
                Err(PipelineError::Deadline)
            }
        },
    };

    match boot_result {
        Ok(stream) => {
            supervise_relay(&state, task_id, hub.clone(), stream, cancel.clone()).await;
        }
        Err(PipelineError::Cancelled) => {
            // The canceller owns the store record; just make sure nothing
            // the boot built stays behind.
            let _ = state.manager.terminate(task_id).await;
        }
        Err(_) if cancel.is_cancelled() => {
            let _ = state.manager.terminate(task_id).await;
        }
        Err(error) => {
            let message = error.to_string();
            warn!(task_id = %task_id, error = %message, "Task failed to start");
            hub.publish_error(message.clone());
            if let Err(e) = state
                .store
                .mark_terminated(task_id, Some(1), Some(&message))
                .await
            {
                warn!(task_id = %task_id, error = %e, "Could not record boot failure");
            }
            hub.publish_status(TaskStatus::Terminated, Some(1));
            let _ = state.manager.terminate(task_id).await;
        }
    }

    state.cancels.remove(task_id);
    state.hubs.remove_if_done(task_id);
}

/// Create the VM, connect and initialize the relay, and mark the task
/// running. Checks the token between steps so an external cancel stops the
/// pipeline at the next boundary without tearing a step in half.
async fn bring_up<B: VmmBackend>(
    state: AppState<B>,
    task: Task,
    input: PipelineInput,
    hub: Arc<TaskHub>,
    cancel: CancellationToken,
) -> Result<BufStream<UnixStream>, PipelineError> {
    let task_id = task.id;

    let progress_hub = hub.clone();
    let res: VmResources = state
        .manager
        .create(
            task_id,
            input.context_id,
            &task.config,
            task.ssh_public_key.clone(),
            move |stage| {
                info!(task_id = %task_id, stage = stage.as_str(), "Boot progress");
                progress_hub.publish_progress(stage);
            },
        )
        .await?;

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    hub.publish_progress(ProgressStage::ConnectingAgent);
    let mut stream = relay::connect(&res.vsock_path, relay::AGENT_PORT).await?;

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    hub.publish_progress(ProgressStage::InitializingClaude);
    let files = if input.files.is_empty() {
        None
    } else {
        Some(
            input
                .files
                .into_iter()
                .map(|f: TaskFile| InitFile {
                    name: f.name,
                    content: f.content,
                })
                .collect(),
        )
    };
    let init = HostMessage::Init {
        api_key: state.config.secrets.agent_api_key.clone(),
        prompt: input.prompt,
        files,
    };
    relay::send_init(&mut stream, &init).await?;

    state.store.mark_running(task_id, res.ip).await?;
    hub.publish_status(TaskStatus::Running, None);
    hub.publish_progress(ProgressStage::Ready);
    hub.touch();

    info!(task_id = %task_id, ip = %res.ip, "Task is running");
    Ok(stream)
}

/// Pump the relay until the guest exits or someone pulls the plug, then
/// settle the task record and tear the VM down.
async fn supervise_relay<B: VmmBackend>(
    state: &AppState<B>,
    task_id: Uuid,
    hub: Arc<TaskHub>,
    stream: BufStream<UnixStream>,
    cancel: CancellationToken,
) {
    let (input_tx, input_rx) = mpsc::channel(64);
    hub.register_input(input_tx);

    let idle_cancel = cancel.child_token();
    let idle = tokio::spawn(idle_monitor(
        state.clone(),
        task_id,
        hub.clone(),
        idle_cancel.clone(),
    ));

    let outcome = relay::run(stream, hub.clone(), input_rx, cancel.clone()).await;

    idle_cancel.cancel();
    let _ = idle.await;
    hub.clear_input();

    match outcome {
        Ok(RelayOutcome::Exit(code)) => {
            info!(task_id = %task_id, exit_code = code, "Agent exited");
            let _ = state
                .store
                .mark_terminated(task_id, Some(code as i64), None)
                .await;
            hub.publish_status(TaskStatus::Terminated, Some(code as i64));
        }
        Ok(RelayOutcome::Eof) | Ok(RelayOutcome::InputClosed) => {
            warn!(task_id = %task_id, "Agent channel closed without an exit frame");
            let _ = state
                .store
                .mark_terminated(task_id, Some(1), Some("agent channel closed"))
                .await;
            hub.publish_status(TaskStatus::Terminated, Some(1));
        }
        Ok(RelayOutcome::Cancelled) => {
            // The canceller records the store state.
        }
        Err(error) => {
            let message = error.to_string();
            warn!(task_id = %task_id, error = %message, "Relay failed");
            hub.publish_error(message.clone());
            let _ = state
                .store
                .mark_terminated(task_id, Some(1), Some(&message))
                .await;
            hub.publish_status(TaskStatus::Terminated, Some(1));
        }
    }

    if let Err(e) = state.manager.terminate(task_id).await {
        warn!(task_id = %task_id, error = %e, "VM teardown after relay close failed");
    }
}

/// Auto-suspend: sample the hub's last-activity instant; once a running task
/// has been quiet past the configured timeout, pause it. Input from any
/// subscriber and non-heartbeat output both reset the clock; a resume does
/// too (the resume handler touches the hub).
async fn idle_monitor<B: VmmBackend>(
    state: AppState<B>,
    task_id: Uuid,
    hub: Arc<TaskHub>,
    cancel: CancellationToken,
) {
    let timeout = state.config.idle_timeout();
    let mut interval = tokio::time::interval(IDLE_SAMPLE);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        if hub.idle_for() < timeout {
            continue;
        }

        let status = match state.store.get(task_id).await {
            Ok(Some(task)) => task.status,
            _ => continue,
        };
        if status != TaskStatus::Running {
            continue;
        }

        info!(task_id = %task_id, idle = ?hub.idle_for(), "Idle timeout, suspending");
        if let Err(e) = state.manager.pause(task_id).await {
            warn!(task_id = %task_id, error = %e, "Idle pause failed");
            continue;
        }
        match state.store.mark_suspended(task_id).await {
            Ok(_) => hub.publish_status(TaskStatus::Suspended, None),
            Err(e) => warn!(task_id = %task_id, error = %e, "Could not record suspension"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_set_round_trip() {
        let set = CancellationSet::new();
        let id = Uuid::new_v4();

        let token = set.register(id);
        assert!(!token.is_cancelled());

        set.cancel(id);
        assert!(token.is_cancelled());

        set.remove(id);
        // cancelling an unknown id is a no-op
        set.cancel(id);
    }

    #[test]
    fn cancel_all_fires_every_token() {
        let set = CancellationSet::new();
        let tokens: Vec<_> = (0..3).map(|_| set.register(Uuid::new_v4())).collect();
        set.cancel_all();
        assert!(tokens.iter().all(|t| t.is_cancelled()));
    }
}
