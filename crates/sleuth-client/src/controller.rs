//! Task lifecycle controller.
//!
//! Owns the research API client and the event channel, and drives one task
//! at a time through `Idle -> Starting -> Running -> {Completed | Error}`.
//! All mutation goes through `&mut self`, so event handlers never interleave.

use std::collections::VecDeque;

use sleuth_protocol::{RemoteStatus, ServerEvent, TaskId, TaskStatusSnapshot};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::ResearchApi;
use crate::channel::{ChannelEvent, EventChannel};
use crate::error::{ClientError, SubmitError};
use crate::reconnect::ReconnectPolicy;

/// Prefix the server puts on the thought it logs when a task fails.
const ERROR_THOUGHT_PREFIX: &str = "Error occurred: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Completed,
    Error,
}

impl TaskStatus {
    /// Starting or Running: a new submit is refused.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Starting | TaskStatus::Running)
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Idle => "Ready",
            TaskStatus::Starting => "Initializing...",
            TaskStatus::Running => "Researching...",
            TaskStatus::Completed => "Research Complete",
            TaskStatus::Error => "Error Occurred",
        }
    }
}

/// Accumulated state of the current task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskState {
    pub task_id: Option<TaskId>,
    pub status: TaskStatus,
    /// Last reported progress, 0-100 as sent by the server. Not validated.
    pub progress: f64,
    /// Append-only, in arrival order.
    pub thoughts: Vec<String>,
    /// Markdown report; empty until completion.
    pub report: String,
    /// Empty unless `status == Error`.
    pub error: String,
}

/// Change notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    Status(TaskStatus),
    Thought(String),
    Progress(f64),
    Report(String),
    Failed(String),
    Reset,
}

pub struct TaskController<A, C> {
    api: A,
    channel: C,
    policy: ReconnectPolicy,
    state: TaskState,
    /// Thoughts merged from a resync snapshot that the new connection may
    /// deliver again.
    resynced: VecDeque<String>,
    subscribers: Vec<mpsc::UnboundedSender<TaskUpdate>>,
}

impl<A, C> TaskController<A, C>
where
    A: ResearchApi,
    C: EventChannel,
{
    pub fn new(api: A, channel: C) -> Self {
        Self {
            api,
            channel,
            policy: ReconnectPolicy::default(),
            state: TaskState::default(),
            resynced: VecDeque::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TaskUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Start a research task for `query`.
    ///
    /// Refused without any state change when the trimmed query is empty or a
    /// task is already active. A failed start request moves the task to
    /// `Error` with the failure message and opens no channel.
    pub async fn submit(&mut self, query: &str) -> Result<TaskId, SubmitError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SubmitError::EmptyQuery);
        }
        if self.state.status.is_active() {
            return Err(SubmitError::TaskActive(
                self.state.task_id.clone().unwrap_or_default(),
            ));
        }

        self.channel.disconnect().await;
        self.state = TaskState::default();
        self.resynced.clear();
        self.set_status(TaskStatus::Starting);

        let task_id = match self.api.start_research(query).await {
            Ok(task_id) => task_id,
            Err(err) => {
                self.fail(err.to_string()).await;
                return Err(err.into());
            }
        };

        info!(task_id = %task_id, "research task started");
        self.state.task_id = Some(task_id.clone());
        self.set_status(TaskStatus::Running);

        if let Err(err) = self.channel.connect(&task_id).await {
            warn!(task_id = %task_id, "initial channel connect failed: {err}");
            if !self.recover(err.to_string()).await {
                return Err(SubmitError::Request(ClientError::Channel {
                    message: self.state.error.clone(),
                }));
            }
        }
        Ok(task_id)
    }

    /// Apply one event. Returns false when it was ignored because it does
    /// not belong to the running task.
    pub async fn handle_event(&mut self, event: ServerEvent) -> bool {
        if self.state.status != TaskStatus::Running {
            debug!(kind = event.kind(), "ignoring event with no running task");
            return false;
        }
        if self.state.task_id.as_deref() != Some(event.task_id()) {
            debug!(
                kind = event.kind(),
                received = event.task_id(),
                "ignoring event for a superseded task"
            );
            return false;
        }

        match event {
            ServerEvent::Thought { thought, .. } => {
                if !self.already_resynced(&thought) {
                    self.on_thought(thought);
                }
            }
            ServerEvent::Progress { progress, .. } => self.on_progress(progress),
            ServerEvent::ReportComplete { report, .. } => self.on_report_complete(report).await,
            ServerEvent::Error { error, .. } => self.fail(error).await,
        }
        true
    }

    /// Wait for the next channel item and apply it. Returns whether the task
    /// is still running afterwards.
    pub async fn pump(&mut self) -> bool {
        if self.state.status != TaskStatus::Running {
            return false;
        }
        match self.channel.next_event().await {
            Some(ChannelEvent::Event(event)) => {
                self.handle_event(event).await;
            }
            Some(ChannelEvent::Lost(reason)) => {
                self.recover(reason).await;
            }
            None => {
                self.recover("event channel closed".to_string()).await;
            }
        }
        self.state.status == TaskStatus::Running
    }

    /// Pump until the task reaches a terminal state.
    pub async fn run_to_completion(&mut self) -> &TaskState {
        while self.pump().await {}
        &self.state
    }

    /// Tear down the channel and clear everything back to `Idle`.
    pub async fn reset(&mut self) {
        self.channel.disconnect().await;
        self.state = TaskState::default();
        self.resynced.clear();
        info!("task state reset");
        self.notify(TaskUpdate::Reset);
    }

    fn on_thought(&mut self, thought: String) {
        self.state.thoughts.push(thought.clone());
        self.notify(TaskUpdate::Thought(thought));
    }

    /// True when `thought` was already applied from a resync snapshot. The
    /// connection replays what the server sent after the join, which is a
    /// suffix of the merged thoughts, so everything up to the match is
    /// consumed. Any other thought ends the overlap.
    fn already_resynced(&mut self, thought: &str) -> bool {
        if self.resynced.is_empty() {
            return false;
        }
        match self.resynced.iter().position(|t| t == thought) {
            Some(pos) => {
                self.resynced.drain(..=pos);
                debug!("dropping thought already merged from snapshot");
                true
            }
            None => {
                self.resynced.clear();
                false
            }
        }
    }

    fn on_progress(&mut self, progress: f64) {
        self.state.progress = progress;
        self.notify(TaskUpdate::Progress(progress));
    }

    async fn on_report_complete(&mut self, report: String) {
        self.state.report = report.clone();
        self.notify(TaskUpdate::Report(report));
        self.set_status(TaskStatus::Completed);
        self.channel.disconnect().await;
    }

    async fn fail(&mut self, message: String) {
        warn!(task_id = ?self.state.task_id, "research task failed: {message}");
        self.state.error = message.clone();
        self.notify(TaskUpdate::Failed(message));
        self.set_status(TaskStatus::Error);
        self.channel.disconnect().await;
    }

    /// Reconnect per policy after the channel dropped. On success the task is
    /// resynced from the server snapshot; otherwise it fails.
    async fn recover(&mut self, reason: String) -> bool {
        let Some(task_id) = self.state.task_id.clone() else {
            return false;
        };
        warn!(task_id = %task_id, "event channel lost: {reason}");
        self.channel.disconnect().await;

        let mut last_error = reason;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if !self.policy.allows(attempt) {
                break;
            }
            tokio::time::sleep(self.policy.backoff_delay(attempt)).await;
            match self.channel.connect(&task_id).await {
                Ok(()) => {
                    info!(task_id = %task_id, attempt, "event channel reconnected");
                    self.resync(&task_id).await;
                    return true;
                }
                Err(err) => {
                    warn!(task_id = %task_id, attempt, "reconnect failed: {err}");
                    last_error = err.to_string();
                    if !err.is_transient() {
                        break;
                    }
                }
            }
        }

        self.fail(format!("event channel lost: {last_error}")).await;
        false
    }

    async fn resync(&mut self, task_id: &str) {
        match self.api.task_status(task_id).await {
            Ok(snapshot) => self.apply_snapshot(snapshot).await,
            Err(err) => warn!(task_id, "resync after reconnect failed: {err}"),
        }
    }

    async fn apply_snapshot(&mut self, snapshot: TaskStatusSnapshot) {
        if self.state.status != TaskStatus::Running
            || self.state.task_id.as_deref() != Some(snapshot.task_id.as_str())
        {
            return;
        }

        self.resynced.clear();
        let known = self.state.thoughts.len();
        if snapshot.thoughts.len() > known && snapshot.thoughts.starts_with(&self.state.thoughts)
        {
            for thought in snapshot.thoughts.into_iter().skip(known) {
                self.resynced.push_back(thought.clone());
                self.on_thought(thought);
            }
        } else if !snapshot.thoughts.starts_with(&self.state.thoughts) {
            debug!("server thought log diverges from local log; keeping local");
        }

        if snapshot.progress != self.state.progress {
            self.on_progress(snapshot.progress);
        }

        match snapshot.status {
            RemoteStatus::Completed => self.on_report_complete(snapshot.report).await,
            RemoteStatus::Error => {
                let message = self
                    .state
                    .thoughts
                    .last()
                    .map(|t| t.strip_prefix(ERROR_THOUGHT_PREFIX).unwrap_or(t).to_string())
                    .unwrap_or_else(|| "research failed".to_string());
                self.fail(message).await;
            }
            RemoteStatus::Initialized | RemoteStatus::Running | RemoteStatus::Unknown => {}
        }
    }

    fn set_status(&mut self, status: TaskStatus) {
        if self.state.status == status {
            return;
        }
        debug!(from = ?self.state.status, to = ?status, "task status change");
        self.state.status = status;
        self.notify(TaskUpdate::Status(status));
    }

    fn notify(&mut self, update: TaskUpdate) {
        self.subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }
}
