pub mod paths;

use serde::{Deserialize, Serialize};

/// Opaque server-assigned identifier of one research run.
pub type TaskId = String;

/// Body of `POST /api/research`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartResearchRequest {
    pub query: String,
}

/// Success body of `POST /api/research`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartResearchResponse {
    pub task_id: TaskId,
}

/// Error body returned by the HTTP API on non-2xx responses.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ApiErrorBody {
    pub error: String,
}

/// Status of a task as the server tracks it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    #[default]
    Initialized,
    Running,
    Completed,
    Error,
    #[serde(other)]
    Unknown,
}

/// Body of `GET /api/status/{task_id}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskStatusSnapshot {
    pub task_id: TaskId,
    #[serde(default)]
    pub status: RemoteStatus,
    #[serde(default)]
    pub thoughts: Vec<String>,
    #[serde(default)]
    pub report: String,
    #[serde(default)]
    pub progress: f64,
}

/// Events pushed by the server over the task event channel.
///
/// Every variant carries the id of the task it belongs to; subscribers drop
/// events for any other task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Thought { task_id: TaskId, thought: String },
    Progress { task_id: TaskId, progress: f64 },
    ReportComplete { task_id: TaskId, report: String },
    Error { task_id: TaskId, error: String },
}

impl ServerEvent {
    pub fn task_id(&self) -> &str {
        match self {
            ServerEvent::Thought { task_id, .. }
            | ServerEvent::Progress { task_id, .. }
            | ServerEvent::ReportComplete { task_id, .. }
            | ServerEvent::Error { task_id, .. } => task_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Thought { .. } => "thought",
            ServerEvent::Progress { .. } => "progress",
            ServerEvent::ReportComplete { .. } => "report_complete",
            ServerEvent::Error { .. } => "error",
        }
    }
}

/// Messages sent by the client over the task event channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Scope subsequent pushes on this connection to `task_id`.
    JoinTask { task_id: TaskId },
    LeaveTask { task_id: TaskId },
}
