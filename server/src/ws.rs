//! WebSocket streaming endpoint.
//!
//! Upgrade, drain the hub's replay buffer, then multiplex: hub events flow
//! out, client input flows into the hub (and from there to the relay
//! writer). A subscriber that falls behind the per-subscriber queue bound is
//! cut off with an error rather than allowed to stall the hub, and a socket
//! that leaves a ping unanswered for a full interval is closed.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use schema::{ClientMessage, TaskEvent};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::api::AppState;
use crate::error::ApiError;
use crate::vmm::VmmBackend;

/// Policy close code for "task not found".
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// An unanswered ping after this long closes the socket.
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub async fn stream_task<B: VmmBackend>(
    State(state): State<AppState<B>>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    let exists = match state.store.get(id).await {
        Ok(task) => task.is_some(),
        Err(e) => return ApiError::from(e).into_response(),
    };

    if !exists {
        return ws.on_upgrade(reject_unknown_task);
    }
    ws.on_upgrade(move |socket| handle_socket(state, id, socket))
}

/// The upgrade has to complete before we can speak, so unknown tasks get a
/// policy-violation close frame as the first and only message.
async fn reject_unknown_task(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: "task not found".into(),
        })))
        .await;
}

async fn handle_socket<B: VmmBackend>(state: AppState<B>, task_id: Uuid, socket: WebSocket) {
    let hub = state.hubs.get_or_create(task_id);
    let (replay, mut events) = hub.subscribe();
    let (mut sink, mut stream) = socket.split();

    // History first; live events queue up in the receiver meanwhile.
    for event in replay {
        if send_event(&mut sink, &event).await.is_err() {
            state.hubs.remove_if_done(task_id);
            return;
        }
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await; // the first tick fires immediately
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let terminal = matches!(event, TaskEvent::Error { .. });
                    if send_event(&mut sink, &event).await.is_err() || terminal {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(task_id = %task_id, skipped = skipped, "Dropping slow subscriber");
                    let _ = send_event(&mut sink, &TaskEvent::Error {
                        message: "slow consumer".to_string(),
                    })
                    .await;
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            message = stream.next() => {
                if !handle_client_message(&hub, &mut sink, &mut awaiting_pong, message).await {
                    break;
                }
            }

            _ = ping_interval.tick() => {
                if awaiting_pong {
                    debug!(task_id = %task_id, "Ping unanswered, closing socket");
                    break;
                }
                awaiting_pong = true;
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(events);
    state.hubs.remove_if_done(task_id);
}

/// Returns false when the socket should close.
async fn handle_client_message(
    hub: &crate::hub::TaskHub,
    sink: &mut SplitSink<WebSocket, Message>,
    awaiting_pong: &mut bool,
    message: Option<Result<Message, axum::Error>>,
) -> bool {
    match message {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Input { data }) => {
                hub.send_input(data).await;
                true
            }
            Ok(ClientMessage::Ping) => send_event(sink, &TaskEvent::Pong).await.is_ok(),
            Err(e) => {
                // A malformed client frame is answered, not fatal.
                let _ = send_event(
                    sink,
                    &TaskEvent::Error {
                        message: format!("unrecognized message: {e}"),
                    },
                )
                .await;
                true
            }
        },
        Some(Ok(Message::Pong(_))) => {
            *awaiting_pong = false;
            true
        }
        Some(Ok(Message::Ping(_))) => true, // axum answers protocol pings itself
        Some(Ok(Message::Binary(_))) => true,
        Some(Ok(Message::Close(_))) | None => false,
        Some(Err(_)) => false,
    }
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &TaskEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event)
        .map_err(|e| axum::Error::new(std::io::Error::other(e.to_string())))?;
    sink.send(Message::Text(json.into())).await
}
