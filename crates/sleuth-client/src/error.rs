use sleuth_protocol::TaskId;
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The backend answered the start request with a non-success status.
    #[error("Failed to start research")]
    StartRejected { status: u16 },
    /// The request never produced a response. The message is surfaced verbatim.
    #[error("{message}")]
    Transport { message: String },
    #[error("protocol error: {message}")]
    Protocol { message: String },
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("report not available for task {0}")]
    ReportUnavailable(TaskId),
    #[error("channel error: {message}")]
    Channel { message: String },
    #[error("export error: {message}")]
    Export { message: String },
    #[error("config error: {message}")]
    Config { message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Errors worth another connection attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Channel { .. })
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Protocol {
                message: format!("failed to decode response: {err}"),
            }
        } else {
            ClientError::Transport {
                message: err.to_string(),
            }
        }
    }
}

/// Why `TaskController::submit` declined or failed to start a task.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("query is empty")]
    EmptyQuery,
    #[error("task {0} is still active")]
    TaskActive(TaskId),
    #[error(transparent)]
    Request(#[from] ClientError),
}
