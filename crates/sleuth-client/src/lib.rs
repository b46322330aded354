//! Client for the research backend: starts a task over HTTP, follows its
//! events over a websocket, and exports the finished report.

pub mod api;
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod export;
pub mod reconnect;

pub use api::{HttpResearchApi, ResearchApi};
pub use channel::{ChannelEvent, EventChannel, WsChannel};
pub use config::ClientConfig;
pub use controller::{TaskController, TaskState, TaskStatus, TaskUpdate};
pub use error::{ClientError, ClientResult, SubmitError};
pub use export::{export_report, report_file_name};
pub use reconnect::ReconnectPolicy;
pub use sleuth_protocol::{ServerEvent, TaskId};

/// Controller wired to the real HTTP API and websocket channel.
pub type HttpTaskController = TaskController<HttpResearchApi, WsChannel>;

/// Build a controller from resolved config.
pub fn connect_controller(config: &ClientConfig) -> ClientResult<HttpTaskController> {
    let api = HttpResearchApi::new(&config.backend_url, config.request_timeout)?;
    let channel = WsChannel::new(config.events_url());
    Ok(TaskController::new(api, channel).with_reconnect_policy(config.reconnect.clone()))
}
