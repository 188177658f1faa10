//! Shared data contracts for the VM-API server and its clients.
//!
//! Everything that crosses a process boundary lives here: REST request and
//! response bodies, the WebSocket event stream, the host↔guest wire protocol,
//! and the task status machine. The server and any front-end consume the same
//! types, so a schema change is a compile-time event on both sides.

pub mod events;
pub mod requests;
pub mod responses;
pub mod status;
pub mod wire;

pub use events::{ClientMessage, ProgressStage, TaskEvent};
pub use requests::{CreateTaskRequest, ListTasksQuery, TaskConfig, TaskFile};
pub use responses::{ErrorBody, TaskListResponse, TaskResponse};
pub use status::{TaskSource, TaskStatus};
pub use wire::{GuestMessage, HostMessage, InitFile};
