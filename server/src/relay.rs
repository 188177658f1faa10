//! Vsock relay: the per-task pipe between this process and the in-guest
//! agent supervisor.
//!
//! The hypervisor fronts the guest's vsock listener with a unix-stream
//! multiplexer speaking a one-line text handshake (`CONNECT <port>\n` →
//! `OK <host_port>\n`). After the handshake the channel is JSON lines, one
//! object per line. The relay never interprets guest output — it publishes
//! frames to the hub and forwards hub input back as `input` frames.
//!
//! Everything here is generic over the stream so the loops run against an
//! in-memory duplex in tests.

use std::path::Path;
use std::time::Duration;

use schema::wire::{GuestMessage, HostMessage};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufStream,
};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use schema::wire::AGENT_PORT;

/// Connect policy: the guest listener comes up as the VM boots, so the
/// handshake is retried on a fixed backoff before the task is failed.
pub const CONNECT_ATTEMPTS: usize = 100;
pub const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum RelayError {
    /// Multiplexer connect or CONNECT/OK exchange failed
    Handshake(String),
    /// The peer spoke something that is not our protocol
    Protocol(String),
    Io(std::io::Error),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Handshake(msg) => write!(f, "handshake failed: {msg}"),
            RelayError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            RelayError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(err)
    }
}

/// Why the relay stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The guest sent `exit` with this code — a normal completion.
    Exit(i32),
    /// The guest side of the stream closed.
    Eof,
    /// The hub dropped the input sender.
    InputClosed,
    /// External cancellation.
    Cancelled,
}

// ─── Handshake ─────────────────────────────────────────────────────────────

/// Multiplexer handshake on an already-connected stream: write
/// `CONNECT <port>\n`, expect a reply starting with `OK `.
pub async fn handshake<S>(stream: &mut S, port: u32) -> Result<(), RelayError>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    stream
        .write_all(format!("CONNECT {port}\n").as_bytes())
        .await?;
    stream.flush().await?;

    let mut reply = String::new();
    let read = stream.read_line(&mut reply).await?;
    if read == 0 {
        return Err(RelayError::Handshake(
            "multiplexer closed before replying".to_string(),
        ));
    }
    if !reply.starts_with("OK ") {
        return Err(RelayError::Handshake(format!(
            "unexpected multiplexer reply: {}",
            reply.trim_end()
        )));
    }
    Ok(())
}

/// Connect to the multiplexer socket and perform the handshake, retrying on
/// the standard backoff (≈10 s budget).
pub async fn connect(path: &Path, port: u32) -> Result<BufStream<UnixStream>, RelayError> {
    connect_with(path, port, CONNECT_ATTEMPTS, CONNECT_BACKOFF).await
}

pub async fn connect_with(
    path: &Path,
    port: u32,
    attempts: usize,
    backoff: Duration,
) -> Result<BufStream<UnixStream>, RelayError> {
    let mut last_error = String::from("no attempt made");
    for attempt in 1..=attempts {
        match UnixStream::connect(path).await {
            Ok(stream) => {
                let mut stream = BufStream::new(stream);
                match handshake(&mut stream, port).await {
                    Ok(()) => return Ok(stream),
                    Err(e) => last_error = e.to_string(),
                }
            }
            Err(e) => last_error = e.to_string(),
        }
        if attempt < attempts {
            sleep(backoff).await;
        }
    }
    Err(RelayError::Handshake(format!(
        "gave up after {attempts} attempts: {last_error}"
    )))
}

/// Write the one-shot session-setup frame. No reply is expected.
pub async fn send_init<W>(writer: &mut W, init: &HostMessage) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, init).await
}

async fn write_frame<W>(writer: &mut W, message: &HostMessage) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(message)
        .map_err(|e| RelayError::Protocol(format!("cannot serialize frame: {e}")))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

// ─── Steady state ──────────────────────────────────────────────────────────

/// Drive both directions until the guest exits, the stream closes, or the
/// token fires. The writer runs as its own task and observes cancellation
/// only between frames, so a cancelled relay never leaves a torn line on the
/// wire.
pub async fn run<S>(
    stream: S,
    hub: std::sync::Arc<crate::hub::TaskHub>,
    input_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> Result<RelayOutcome, RelayError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let writer_cancel = cancel.child_token();
    let mut writer = tokio::spawn(write_loop(write_half, input_rx, writer_cancel.clone()));

    let reader = BufReader::new(read_half);
    let outcome = tokio::select! {
        out = read_loop(reader, &hub, &cancel) => out,
        res = &mut writer => {
            // Writer finished first: input channel closed or a write failed.
            return match res {
                Ok(out) => out,
                Err(e) => Err(RelayError::Protocol(format!("writer task died: {e}"))),
            };
        }
    };

    writer_cancel.cancel();
    let _ = writer.await;
    outcome
}

async fn read_loop<R>(
    reader: R,
    hub: &crate::hub::TaskHub,
    cancel: &CancellationToken,
) -> Result<RelayOutcome, RelayError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut saw_frame = false;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(RelayOutcome::Cancelled),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(RelayOutcome::Eof);
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<GuestMessage>(&line) {
            Ok(GuestMessage::Output { data }) => {
                saw_frame = true;
                hub.publish_output(data);
            }
            Ok(GuestMessage::Exit { code }) => return Ok(RelayOutcome::Exit(code)),
            Ok(GuestMessage::Heartbeat) => {
                saw_frame = true;
            }
            Err(e) if saw_frame => {
                // Mid-stream garbage means the guest is wedged; treat as a
                // closed channel rather than killing the server-side loop.
                warn!(error = %e, "Unparseable guest frame after valid traffic, closing relay");
                return Ok(RelayOutcome::Eof);
            }
            Err(e) => {
                return Err(RelayError::Protocol(format!(
                    "first guest frame unparseable: {e}"
                )));
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut input_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> Result<RelayOutcome, RelayError>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(RelayOutcome::Cancelled),
            msg = input_rx.recv() => msg,
        };
        let Some(data) = message else {
            return Ok(RelayOutcome::InputClosed);
        };
        // write_all inside the arm body — never raced against cancellation.
        write_frame(&mut writer, &HostMessage::Input { data }).await?;
    }
}
