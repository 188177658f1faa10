//! Events fanned out to task subscribers, and the messages subscribers may
//! send back.
//!
//! One tagged sum type covers the hub's event stream and the WebSocket frames
//! verbatim — what the hub buffers is exactly what a subscriber receives.

use serde::{Deserialize, Serialize};

use crate::status::TaskStatus;

/// Boot-pipeline markers, published in order while a task comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    CreatingVm,
    WaitingForSocket,
    ConfiguringVm,
    BootingVm,
    ConnectingAgent,
    InitializingClaude,
    Ready,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStage::CreatingVm => "creating_vm",
            ProgressStage::WaitingForSocket => "waiting_for_socket",
            ProgressStage::ConfiguringVm => "configuring_vm",
            ProgressStage::BootingVm => "booting_vm",
            ProgressStage::ConnectingAgent => "connecting_agent",
            ProgressStage::InitializingClaude => "initializing_claude",
            ProgressStage::Ready => "ready",
        }
    }

    /// Human-readable one-liner shown in stream UIs.
    pub fn message(&self) -> &'static str {
        match self {
            ProgressStage::CreatingVm => "Allocating VM resources",
            ProgressStage::WaitingForSocket => "Waiting for hypervisor control socket",
            ProgressStage::ConfiguringVm => "Configuring virtual machine",
            ProgressStage::BootingVm => "Booting virtual machine",
            ProgressStage::ConnectingAgent => "Connecting to agent supervisor",
            ProgressStage::InitializingClaude => "Initializing agent session",
            ProgressStage::Ready => "Agent ready",
        }
    }
}

/// Server → subscriber events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// One output frame from the guest agent.
    Output { data: String, timestamp_ms: i64 },
    /// Task status change.
    Status {
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i64>,
    },
    /// Boot-progress marker.
    Progress { stage: ProgressStage, message: String },
    /// Terminal error; the stream closes after this.
    Error { message: String },
    /// Reply to a client `ping`.
    Pong,
}

/// Subscriber → server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Text forwarded to the agent's stdin.
    Input { data: String },
    /// Liveness probe; answered with [`TaskEvent::Pong`].
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = TaskEvent::Output {
            data: "hello".to_string(),
            timestamp_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"output""#), "got: {json}");

        let ev = TaskEvent::Progress {
            stage: ProgressStage::WaitingForSocket,
            message: ProgressStage::WaitingForSocket.message().to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""stage":"waiting_for_socket""#), "got: {json}");
    }

    #[test]
    fn status_omits_null_exit_code() {
        let ev = TaskEvent::Status {
            status: TaskStatus::Running,
            exit_code: None,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("exit_code"), "got: {json}");
    }

    #[test]
    fn client_messages_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"input","data":"ls"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Input { data } if data == "ls"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shutdown"}"#).is_err());
    }
}
