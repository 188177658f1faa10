//! Host↔guest wire protocol.
//!
//! One Unix-stream connection per task, fronted by the hypervisor's vsock
//! multiplexer (`CONNECT <port>\n` → `OK <host_port>\n`), then JSON-lines:
//! exactly one JSON object per line, tagged by `type`. Unknown tags are a
//! protocol error on both sides.

use serde::{Deserialize, Serialize};

/// Guest port the agent supervisor listens on behind the multiplexer.
pub const AGENT_PORT: u32 = 5000;

/// A file the guest materializes in the task working directory before the
/// agent starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitFile {
    pub name: String,
    pub content: String,
}

/// Host → guest messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// One-shot session setup, written immediately after the handshake.
    Init {
        api_key: String,
        prompt: String,
        files: Option<Vec<InitFile>>,
    },
    /// A line of input for the agent.
    Input { data: String },
    /// Liveness probe; the guest drops it.
    Heartbeat,
}

/// Guest → host messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestMessage {
    /// One frame of agent output. The payload is opaque to the host — it is
    /// buffered and fanned out, never interpreted.
    Output { data: String },
    /// The agent finished; the relay shuts the task down with this code.
    Exit { code: i32 },
    /// Liveness probe; the host drops it.
    Heartbeat,
}

#[cfg(test)]
mod tests {
    use super::*;

    // The exact lines the guest supervisor emits. If one of these stops
    // parsing, host and guest are out of sync.
    #[test]
    fn guest_lines_parse() {
        let msg: GuestMessage =
            serde_json::from_str(r#"{"type":"output","data":"$ cargo test\n"}"#).unwrap();
        assert!(matches!(msg, GuestMessage::Output { data } if data == "$ cargo test\n"));

        let msg: GuestMessage = serde_json::from_str(r#"{"type":"exit","code":0}"#).unwrap();
        assert!(matches!(msg, GuestMessage::Exit { code: 0 }));

        let msg: GuestMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(msg, GuestMessage::Heartbeat));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(serde_json::from_str::<GuestMessage>(r#"{"type":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<HostMessage>(r#"{"type":"exec","data":"x"}"#).is_err());
    }

    #[test]
    fn init_frame_shape() {
        let init = HostMessage::Init {
            api_key: "key".to_string(),
            prompt: "fix the bug".to_string(),
            files: Some(vec![InitFile {
                name: "notes.md".to_string(),
                content: "context".to_string(),
            }]),
        };
        let json = serde_json::to_string(&init).unwrap();
        assert!(json.starts_with(r#"{"type":"init""#), "got: {json}");
        assert!(!json.contains('\n'), "init frame must be a single line");

        // files may be null
        let init: HostMessage = serde_json::from_str(
            r#"{"type":"init","api_key":"k","prompt":"p","files":null}"#,
        )
        .unwrap();
        assert!(matches!(init, HostMessage::Init { files: None, .. }));
    }

    #[test]
    fn input_frames_round_trip() {
        let msg = HostMessage::Input {
            data: "run the tests".to_string(),
        };
        let line = serde_json::to_string(&msg).unwrap();
        let back: HostMessage = serde_json::from_str(&line).unwrap();
        assert!(matches!(back, HostMessage::Input { data } if data == "run the tests"));
    }
}
