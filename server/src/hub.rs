//! Per-task subscription hub: fan-out plus bounded replay.
//!
//! Each task gets one broadcast channel and one replay ring. The relay
//! publishes into the hub; WebSocket subscribers drain it, and a subscriber
//! joining mid-stream receives the buffered history first. Snapshot and
//! publish share one lock, so the snapshot plus the live receiver is a
//! gap-free, duplicate-free suffix of the event sequence.
//!
//! The hub also carries the input path back toward the guest: it holds a
//! sender into the relay's writer channel (set while a relay is live), and
//! the relay holds nothing of the hub but a publish handle — no cycle.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use schema::{ProgressStage, TaskEvent, TaskStatus};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Replay ring capacity in events.
pub const REPLAY_EVENT_CAPACITY: usize = 1024;
/// Replay ring capacity in buffered output bytes, whichever trips first.
pub const REPLAY_BYTE_CAPACITY: usize = 1024 * 1024;
/// Per-subscriber queue bound; a receiver this far behind is lagged out.
pub const SUBSCRIBER_QUEUE: usize = 256;

struct Replay {
    events: VecDeque<TaskEvent>,
    output_bytes: usize,
}

impl Replay {
    fn push(&mut self, event: TaskEvent) {
        self.output_bytes += event_bytes(&event);
        self.events.push_back(event);
        while self.events.len() > REPLAY_EVENT_CAPACITY || self.output_bytes > REPLAY_BYTE_CAPACITY
        {
            if let Some(evicted) = self.events.pop_front() {
                self.output_bytes -= event_bytes(&evicted);
            } else {
                break;
            }
        }
    }
}

fn event_bytes(event: &TaskEvent) -> usize {
    match event {
        TaskEvent::Output { data, .. } => data.len(),
        _ => 0,
    }
}

pub struct TaskHub {
    sender: broadcast::Sender<TaskEvent>,
    replay: Mutex<Replay>,
    input: Mutex<Option<mpsc::Sender<String>>>,
    last_activity: Mutex<Instant>,
    terminal: AtomicBool,
}

impl TaskHub {
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(SUBSCRIBER_QUEUE);
        Arc::new(Self {
            sender,
            replay: Mutex::new(Replay {
                events: VecDeque::new(),
                output_bytes: 0,
            }),
            input: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            terminal: AtomicBool::new(false),
        })
    }

    /// Atomic snapshot of the replay ring plus a live receiver positioned at
    /// the next event after it — no duplicates, no gaps.
    pub fn subscribe(&self) -> (Vec<TaskEvent>, broadcast::Receiver<TaskEvent>) {
        let replay = self.replay.lock().unwrap();
        let receiver = self.sender.subscribe();
        (replay.events.iter().cloned().collect(), receiver)
    }

    /// The replay ring as of now, for `GET /tasks/{id}/output`.
    pub fn snapshot(&self) -> Vec<TaskEvent> {
        self.replay.lock().unwrap().events.iter().cloned().collect()
    }

    pub fn publish(&self, event: TaskEvent) {
        let mut replay = self.replay.lock().unwrap();
        if !matches!(event, TaskEvent::Pong) {
            replay.push(event.clone());
        }
        // Send under the replay lock so subscribe() can't slot between the
        // ring write and the broadcast.
        let _ = self.sender.send(event);
    }

    pub fn publish_output(&self, data: String) {
        self.touch();
        self.publish(TaskEvent::Output {
            data,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        });
    }

    pub fn publish_status(&self, status: TaskStatus, exit_code: Option<i64>) {
        if status.is_terminal() {
            self.terminal.store(true, Ordering::Relaxed);
        }
        self.publish(TaskEvent::Status { status, exit_code });
    }

    pub fn publish_progress(&self, stage: ProgressStage) {
        self.publish(TaskEvent::Progress {
            stage,
            message: stage.message().to_string(),
        });
    }

    pub fn publish_error(&self, message: String) {
        self.publish(TaskEvent::Error { message });
    }

    // ─── Input path (toward the relay writer) ──────────────────────────

    pub fn register_input(&self, sender: mpsc::Sender<String>) {
        *self.input.lock().unwrap() = Some(sender);
    }

    pub fn clear_input(&self) {
        *self.input.lock().unwrap() = None;
    }

    /// Forward subscriber input to the relay writer. Returns false when no
    /// relay is attached (task not running). Always counts as activity.
    pub async fn send_input(&self, data: String) -> bool {
        self.touch();
        let sender = self.input.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(data).await.is_ok(),
            None => false,
        }
    }

    // ─── Idle tracking ─────────────────────────────────────────────────

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Relaxed)
    }
}

// ─── Registry ──────────────────────────────────────────────────────────────

/// All live hubs, keyed by task id. Values are reference-counted so a hub
/// outlives its map entry while late subscribers drain.
#[derive(Default)]
pub struct HubRegistry {
    hubs: RwLock<HashMap<Uuid, Arc<TaskHub>>>,
}

impl HubRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get_or_create(&self, task_id: Uuid) -> Arc<TaskHub> {
        if let Some(hub) = self.hubs.read().unwrap().get(&task_id) {
            return Arc::clone(hub);
        }
        let mut hubs = self.hubs.write().unwrap();
        Arc::clone(hubs.entry(task_id).or_insert_with(TaskHub::new))
    }

    pub fn get(&self, task_id: Uuid) -> Option<Arc<TaskHub>> {
        self.hubs.read().unwrap().get(&task_id).cloned()
    }

    /// Drop the hub once the task is terminal and the last subscriber has
    /// disconnected — whichever happens later.
    pub fn remove_if_done(&self, task_id: Uuid) {
        let mut hubs = self.hubs.write().unwrap();
        if let Some(hub) = hubs.get(&task_id) {
            if hub.is_terminal() && hub.subscriber_count() == 0 {
                hubs.remove(&task_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(n: usize) -> TaskEvent {
        TaskEvent::Output {
            data: format!("line {n}"),
            timestamp_ms: n as i64,
        }
    }

    fn data_of(event: &TaskEvent) -> &str {
        match event {
            TaskEvent::Output { data, .. } => data,
            _ => panic!("expected output event"),
        }
    }

    #[tokio::test]
    async fn replay_then_live_is_gap_free() {
        let hub = TaskHub::new();
        for n in 0..3 {
            hub.publish(output(n));
        }

        let (snapshot, mut rx) = hub.subscribe();
        assert_eq!(snapshot.len(), 3);

        for n in 3..6 {
            hub.publish(output(n));
        }

        let mut seen: Vec<String> = snapshot.iter().map(|e| data_of(e).to_string()).collect();
        for _ in 0..3 {
            seen.push(data_of(&rx.recv().await.unwrap()).to_string());
        }
        let expected: Vec<String> = (0..6).map(|n| format!("line {n}")).collect();
        assert_eq!(seen, expected, "snapshot + live = suffix, no dups, no gaps");
    }

    #[tokio::test]
    async fn replay_ring_evicts_oldest() {
        let hub = TaskHub::new();
        for n in 0..REPLAY_EVENT_CAPACITY + 100 {
            hub.publish(output(n));
        }
        let snapshot = hub.snapshot();
        assert_eq!(snapshot.len(), REPLAY_EVENT_CAPACITY);
        assert_eq!(data_of(&snapshot[0]), "line 100");
    }

    #[tokio::test]
    async fn replay_ring_bounds_bytes() {
        let hub = TaskHub::new();
        let chunk = "x".repeat(300 * 1024);
        for _ in 0..5 {
            hub.publish_output(chunk.clone());
        }
        let snapshot = hub.snapshot();
        assert!(snapshot.len() < 5, "1 MiB cap should evict early");
        let total: usize = snapshot.iter().map(event_bytes).sum();
        assert!(total <= REPLAY_BYTE_CAPACITY);
    }

    #[tokio::test]
    async fn pong_is_never_buffered() {
        let hub = TaskHub::new();
        hub.publish(TaskEvent::Pong);
        hub.publish(output(1));
        let snapshot = hub.snapshot();
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_out() {
        let hub = TaskHub::new();
        let (_snapshot, mut rx) = hub.subscribe();
        for n in 0..SUBSCRIBER_QUEUE + 50 {
            hub.publish(output(n));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                assert!(skipped >= 50, "skipped {skipped}");
            }
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn input_reaches_registered_relay() {
        let hub = TaskHub::new();
        assert!(!hub.send_input("dropped".to_string()).await, "no relay yet");

        let (tx, mut rx) = mpsc::channel(8);
        hub.register_input(tx);
        assert!(hub.send_input("hello".to_string()).await);
        assert_eq!(rx.recv().await.unwrap(), "hello");

        hub.clear_input();
        assert!(!hub.send_input("late".to_string()).await);
    }

    #[tokio::test]
    async fn input_counts_as_activity() {
        let hub = TaskHub::new();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(hub.idle_for() >= Duration::from_millis(10));
        hub.send_input("poke".to_string()).await;
        assert!(hub.idle_for() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn registry_drops_hub_only_when_terminal_and_empty() {
        let registry = HubRegistry::new();
        let id = Uuid::new_v4();
        let hub = registry.get_or_create(id);

        let (_snapshot, rx) = hub.subscribe();
        registry.remove_if_done(id);
        assert!(registry.get(id).is_some(), "not terminal yet");

        hub.publish_status(TaskStatus::Terminated, Some(0));
        registry.remove_if_done(id);
        assert!(registry.get(id).is_some(), "a subscriber is still attached");

        drop(rx);
        registry.remove_if_done(id);
        assert!(registry.get(id).is_none());
    }
}
