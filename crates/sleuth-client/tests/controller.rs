use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use sleuth_client::{
    ChannelEvent, ClientError, ClientResult, EventChannel, ReconnectPolicy, ResearchApi,
    ServerEvent, SubmitError, TaskController, TaskState, TaskStatus, TaskUpdate,
};
use sleuth_protocol::{RemoteStatus, TaskId, TaskStatusSnapshot};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Default)]
struct FakeApi {
    start: Mutex<VecDeque<ClientResult<TaskId>>>,
    snapshots: Mutex<VecDeque<TaskStatusSnapshot>>,
    queries: Mutex<Vec<String>>,
    status_calls: Mutex<Vec<String>>,
}

impl FakeApi {
    fn starting(ids: &[&str]) -> Self {
        let api = Self::default();
        for id in ids {
            api.start.lock().unwrap().push_back(Ok(id.to_string()));
        }
        api
    }

    fn failing(err: ClientError) -> Self {
        let api = Self::default();
        api.start.lock().unwrap().push_back(Err(err));
        api
    }

    fn with_snapshot(self, snapshot: TaskStatusSnapshot) -> Self {
        self.snapshots.lock().unwrap().push_back(snapshot);
        self
    }

    fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl ResearchApi for FakeApi {
    async fn start_research(&self, query: &str) -> ClientResult<TaskId> {
        self.queries.lock().unwrap().push(query.to_string());
        self.start
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ClientError::StartRejected { status: 500 }))
    }

    async fn task_status(&self, task_id: &str) -> ClientResult<TaskStatusSnapshot> {
        self.status_calls.lock().unwrap().push(task_id.to_string());
        self.snapshots
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ClientError::TaskNotFound(task_id.to_string()))
    }

    async fn download_report(&self, task_id: &str) -> ClientResult<String> {
        Err(ClientError::ReportUnavailable(task_id.to_string()))
    }
}

/// One scripted connection: refused, broken beyond retrying, or a queue of
/// items to deliver.
enum Session {
    Refuse(String),
    Broken(String),
    Deliver(VecDeque<ChannelEvent>),
}

#[derive(Default)]
struct FakeChannel {
    sessions: VecDeque<Session>,
    current: Option<(TaskId, VecDeque<ChannelEvent>)>,
    log: Vec<String>,
}

impl FakeChannel {
    fn session(mut self, items: Vec<ChannelEvent>) -> Self {
        self.sessions.push_back(Session::Deliver(items.into()));
        self
    }

    fn refused(mut self, reason: &str) -> Self {
        self.sessions.push_back(Session::Refuse(reason.to_string()));
        self
    }

    fn broken(mut self, reason: &str) -> Self {
        self.sessions.push_back(Session::Broken(reason.to_string()));
        self
    }

    fn connects(&self) -> usize {
        self.log.iter().filter(|l| l.starts_with("join:")).count()
    }
}

impl EventChannel for FakeChannel {
    async fn connect(&mut self, task_id: &str) -> ClientResult<()> {
        self.disconnect().await;
        match self.sessions.pop_front() {
            Some(Session::Deliver(items)) => {
                self.log.push(format!("join:{task_id}"));
                self.current = Some((task_id.to_string(), items));
                Ok(())
            }
            Some(Session::Refuse(reason)) => {
                self.log.push(format!("refused:{task_id}"));
                Err(ClientError::Channel { message: reason })
            }
            Some(Session::Broken(reason)) => {
                self.log.push(format!("refused:{task_id}"));
                Err(ClientError::Protocol { message: reason })
            }
            None => {
                self.log.push(format!("refused:{task_id}"));
                Err(ClientError::Channel {
                    message: "no session scripted".to_string(),
                })
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some((task_id, _)) = self.current.take() {
            self.log.push(format!("leave:{task_id}"));
        }
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        let (_, items) = self.current.as_mut()?;
        items.pop_front()
    }

    fn is_connected(&self) -> bool {
        self.current.is_some()
    }
}

fn thought(task_id: &str, text: &str) -> ChannelEvent {
    ChannelEvent::Event(ServerEvent::Thought {
        task_id: task_id.to_string(),
        thought: text.to_string(),
    })
}

fn progress(task_id: &str, value: f64) -> ChannelEvent {
    ChannelEvent::Event(ServerEvent::Progress {
        task_id: task_id.to_string(),
        progress: value,
    })
}

fn complete(task_id: &str, report: &str) -> ChannelEvent {
    ChannelEvent::Event(ServerEvent::ReportComplete {
        task_id: task_id.to_string(),
        report: report.to_string(),
    })
}

fn quick_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

fn drain(rx: &mut UnboundedReceiver<TaskUpdate>) -> Vec<TaskUpdate> {
    let mut out = Vec::new();
    while let Ok(update) = rx.try_recv() {
        out.push(update);
    }
    out
}

#[tokio::test]
async fn completes_market_trends_task() -> Result<()> {
    let channel = FakeChannel::default().session(vec![
        thought("abc123", "Searching sources"),
        progress("abc123", 25.0),
        thought("abc123", "Reading results"),
        progress("abc123", 60.0),
        thought("abc123", "Drafting report"),
        complete("abc123", "# Market trends\n\nGrowth is up."),
    ]);
    let mut controller = TaskController::new(FakeApi::starting(&["abc123"]), channel);
    let mut updates = controller.subscribe();

    let task_id = controller.submit("market trends").await?;
    assert_eq!(task_id, "abc123");
    assert_eq!(controller.api().queries(), vec!["market trends"]);
    assert_eq!(controller.state().status, TaskStatus::Running);
    assert!(controller.channel().is_connected());

    let state = controller.run_to_completion().await.clone();
    assert_eq!(state.status, TaskStatus::Completed);
    assert_eq!(state.task_id.as_deref(), Some("abc123"));
    assert_eq!(
        state.thoughts,
        vec!["Searching sources", "Reading results", "Drafting report"]
    );
    assert_eq!(state.progress, 60.0);
    assert_eq!(state.report, "# Market trends\n\nGrowth is up.");
    assert!(state.error.is_empty());

    assert!(!controller.channel().is_connected());
    assert_eq!(controller.channel().log, vec!["join:abc123", "leave:abc123"]);

    assert_eq!(
        drain(&mut updates),
        vec![
            TaskUpdate::Status(TaskStatus::Starting),
            TaskUpdate::Status(TaskStatus::Running),
            TaskUpdate::Thought("Searching sources".into()),
            TaskUpdate::Progress(25.0),
            TaskUpdate::Thought("Reading results".into()),
            TaskUpdate::Progress(60.0),
            TaskUpdate::Thought("Drafting report".into()),
            TaskUpdate::Report("# Market trends\n\nGrowth is up.".into()),
            TaskUpdate::Status(TaskStatus::Completed),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn rejected_start_fails_without_connecting() -> Result<()> {
    let api = FakeApi::failing(ClientError::StartRejected { status: 500 });
    let mut controller = TaskController::new(api, FakeChannel::default());

    let err = controller.submit("market trends").await.unwrap_err();
    assert!(matches!(
        err,
        SubmitError::Request(ClientError::StartRejected { status: 500 })
    ));
    assert_eq!(controller.state().status, TaskStatus::Error);
    assert_eq!(controller.state().error, "Failed to start research");
    assert!(controller.state().task_id.is_none());
    assert!(controller.channel().log.is_empty());
    Ok(())
}

#[tokio::test]
async fn transport_failure_message_is_kept_verbatim() -> Result<()> {
    let api = FakeApi::failing(ClientError::Transport {
        message: "connection refused".to_string(),
    });
    let mut controller = TaskController::new(api, FakeChannel::default());

    assert!(controller.submit("market trends").await.is_err());
    assert_eq!(controller.state().status, TaskStatus::Error);
    assert_eq!(controller.state().error, "connection refused");
    Ok(())
}

#[tokio::test]
async fn empty_query_is_refused_without_side_effects() -> Result<()> {
    let mut controller = TaskController::new(FakeApi::starting(&["abc123"]), FakeChannel::default());
    let mut updates = controller.subscribe();

    let err = controller.submit("   ").await.unwrap_err();
    assert!(matches!(err, SubmitError::EmptyQuery));
    assert_eq!(controller.state().status, TaskStatus::Idle);
    assert!(controller.api().queries().is_empty());
    assert!(drain(&mut updates).is_empty());
    Ok(())
}

#[tokio::test]
async fn submit_while_running_is_refused() -> Result<()> {
    let channel = FakeChannel::default().session(vec![thought("abc123", "working")]);
    let mut controller = TaskController::new(FakeApi::starting(&["abc123", "def456"]), channel);
    controller.submit("market trends").await?;

    let err = controller.submit("something else").await.unwrap_err();
    assert!(matches!(err, SubmitError::TaskActive(ref id) if id == "abc123"));
    assert_eq!(controller.state().task_id.as_deref(), Some("abc123"));
    assert_eq!(controller.api().queries(), vec!["market trends"]);
    Ok(())
}

#[tokio::test]
async fn events_for_other_tasks_are_ignored() -> Result<()> {
    let channel = FakeChannel::default().session(Vec::new());
    let mut controller = TaskController::new(FakeApi::starting(&["abc123"]), channel);
    controller.submit("market trends").await?;
    let before = controller.state().clone();

    let applied = controller
        .handle_event(ServerEvent::Thought {
            task_id: "xyz999".into(),
            thought: "not ours".into(),
        })
        .await;
    assert!(!applied);
    let applied = controller
        .handle_event(ServerEvent::ReportComplete {
            task_id: "xyz999".into(),
            report: "wrong report".into(),
        })
        .await;
    assert!(!applied);
    assert_eq!(controller.state(), &before);
    Ok(())
}

#[tokio::test]
async fn error_event_fails_task_and_disconnects() -> Result<()> {
    let channel = FakeChannel::default().session(vec![
        thought("abc123", "Searching sources"),
        ChannelEvent::Event(ServerEvent::Error {
            task_id: "abc123".into(),
            error: "model quota exceeded".into(),
        }),
    ]);
    let mut controller = TaskController::new(FakeApi::starting(&["abc123"]), channel);
    controller.submit("market trends").await?;

    let state = controller.run_to_completion().await.clone();
    assert_eq!(state.status, TaskStatus::Error);
    assert_eq!(state.error, "model quota exceeded");
    assert_eq!(state.thoughts, vec!["Searching sources"]);
    assert!(!controller.channel().is_connected());
    Ok(())
}

#[tokio::test]
async fn events_after_terminal_state_are_ignored() -> Result<()> {
    let channel = FakeChannel::default().session(vec![complete("abc123", "done")]);
    let mut controller = TaskController::new(FakeApi::starting(&["abc123"]), channel);
    controller.submit("market trends").await?;
    controller.run_to_completion().await;

    let applied = controller
        .handle_event(ServerEvent::Thought {
            task_id: "abc123".into(),
            thought: "late".into(),
        })
        .await;
    assert!(!applied);
    assert!(controller.state().thoughts.is_empty());
    assert_eq!(controller.state().status, TaskStatus::Completed);
    assert!(!controller.pump().await);
    Ok(())
}

#[tokio::test]
async fn reset_returns_to_idle_from_any_state() -> Result<()> {
    // Idle.
    let mut controller = TaskController::new(
        FakeApi::starting(&["abc123", "def456"]),
        FakeChannel::default()
            .session(vec![thought("abc123", "working")])
            .session(vec![complete("def456", "done")]),
    );
    controller.reset().await;
    assert_eq!(controller.state().status, TaskStatus::Idle);

    // Running.
    controller.submit("market trends").await?;
    controller.pump().await;
    let mut updates = controller.subscribe();
    controller.reset().await;
    assert_eq!(controller.state(), &TaskState::default());
    assert!(!controller.channel().is_connected());
    assert_eq!(drain(&mut updates), vec![TaskUpdate::Reset]);

    // Completed.
    controller.submit("another query").await?;
    controller.run_to_completion().await;
    assert_eq!(controller.state().status, TaskStatus::Completed);
    controller.reset().await;
    assert_eq!(controller.state(), &TaskState::default());

    // Error.
    controller.submit("third query").await.unwrap_err();
    assert_eq!(controller.state().status, TaskStatus::Error);
    controller.reset().await;
    assert_eq!(controller.state(), &TaskState::default());

    assert_eq!(
        controller.channel().log,
        vec!["join:abc123", "leave:abc123", "join:def456", "leave:def456"]
    );
    Ok(())
}

#[tokio::test]
async fn resubmit_after_completion_starts_fresh() -> Result<()> {
    let channel = FakeChannel::default()
        .session(vec![thought("abc123", "first"), complete("abc123", "one")])
        .session(vec![thought("def456", "second")]);
    let mut controller = TaskController::new(FakeApi::starting(&["abc123", "def456"]), channel);
    controller.submit("market trends").await?;
    controller.run_to_completion().await;

    controller.submit("follow up").await?;
    let state = controller.state();
    assert_eq!(state.task_id.as_deref(), Some("def456"));
    assert_eq!(state.status, TaskStatus::Running);
    assert!(state.thoughts.is_empty());
    assert!(state.report.is_empty());
    assert_eq!(state.progress, 0.0);
    Ok(())
}

#[tokio::test]
async fn lost_channel_reconnects_and_resyncs() -> Result<()> {
    let api = FakeApi::starting(&["abc123"]).with_snapshot(TaskStatusSnapshot {
        task_id: "abc123".into(),
        status: RemoteStatus::Running,
        thoughts: vec!["Searching sources".into(), "Missed while offline".into()],
        report: String::new(),
        progress: 60.0,
    });
    let channel = FakeChannel::default()
        .session(vec![
            thought("abc123", "Searching sources"),
            ChannelEvent::Lost("connection reset".into()),
        ])
        .refused("still down")
        .session(vec![complete("abc123", "final")]);
    let mut controller =
        TaskController::new(api, channel).with_reconnect_policy(quick_policy(3));
    controller.submit("market trends").await?;

    let state = controller.run_to_completion().await.clone();
    assert_eq!(state.status, TaskStatus::Completed);
    assert_eq!(
        state.thoughts,
        vec!["Searching sources", "Missed while offline"]
    );
    assert_eq!(state.progress, 60.0);
    assert_eq!(state.report, "final");
    assert_eq!(controller.channel().connects(), 2);
    assert_eq!(
        controller.channel().log,
        vec![
            "join:abc123",
            "leave:abc123",
            "refused:abc123",
            "join:abc123",
            "leave:abc123"
        ]
    );
    Ok(())
}

#[tokio::test]
async fn resync_applies_completion_missed_while_offline() -> Result<()> {
    let api = FakeApi::starting(&["abc123"]).with_snapshot(TaskStatusSnapshot {
        task_id: "abc123".into(),
        status: RemoteStatus::Completed,
        thoughts: vec!["done".into()],
        report: "# Report".into(),
        progress: 100.0,
    });
    let channel = FakeChannel::default()
        .session(vec![ChannelEvent::Lost("timeout".into())])
        .session(Vec::new());
    let mut controller =
        TaskController::new(api, channel).with_reconnect_policy(quick_policy(1));
    controller.submit("market trends").await?;

    let state = controller.run_to_completion().await.clone();
    assert_eq!(state.status, TaskStatus::Completed);
    assert_eq!(state.report, "# Report");
    assert_eq!(state.thoughts, vec!["done"]);
    assert!(!controller.channel().is_connected());
    Ok(())
}

#[tokio::test]
async fn exhausted_reconnects_fail_the_task() -> Result<()> {
    let channel = FakeChannel::default()
        .session(vec![ChannelEvent::Lost("connection reset".into())])
        .refused("refused once")
        .refused("refused twice");
    let mut controller = TaskController::new(FakeApi::starting(&["abc123"]), channel)
        .with_reconnect_policy(quick_policy(2));
    controller.submit("market trends").await?;

    let state = controller.run_to_completion().await.clone();
    assert_eq!(state.status, TaskStatus::Error);
    assert_eq!(
        state.error,
        "event channel lost: channel error: refused twice"
    );
    assert!(!controller.channel().is_connected());
    Ok(())
}

#[tokio::test]
async fn disabled_reconnect_fails_on_first_loss() -> Result<()> {
    let channel = FakeChannel::default()
        .session(vec![ChannelEvent::Lost("connection reset".into())])
        .session(Vec::new());
    let mut controller = TaskController::new(FakeApi::starting(&["abc123"]), channel)
        .with_reconnect_policy(ReconnectPolicy::disabled());
    controller.submit("market trends").await?;

    let state = controller.run_to_completion().await.clone();
    assert_eq!(state.status, TaskStatus::Error);
    assert_eq!(state.error, "event channel lost: connection reset");
    assert_eq!(controller.channel().connects(), 1);
    Ok(())
}

#[tokio::test]
async fn initial_connect_failure_is_retried() -> Result<()> {
    let api = FakeApi::starting(&["abc123"]).with_snapshot(TaskStatusSnapshot {
        task_id: "abc123".into(),
        status: RemoteStatus::Running,
        thoughts: Vec::new(),
        report: String::new(),
        progress: 0.0,
    });
    let channel = FakeChannel::default()
        .refused("server starting")
        .session(vec![complete("abc123", "ok")]);
    let mut controller =
        TaskController::new(api, channel).with_reconnect_policy(quick_policy(2));

    let task_id = controller.submit("market trends").await?;
    assert_eq!(task_id, "abc123");
    assert_eq!(controller.run_to_completion().await.status, TaskStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn initial_connect_failure_without_reconnect_fails_submit() -> Result<()> {
    let channel = FakeChannel::default().refused("server down");
    let mut controller = TaskController::new(FakeApi::starting(&["abc123"]), channel)
        .with_reconnect_policy(ReconnectPolicy::disabled());

    let err = controller.submit("market trends").await.unwrap_err();
    assert!(matches!(err, SubmitError::Request(ClientError::Channel { .. })));
    assert_eq!(controller.state().status, TaskStatus::Error);
    assert_eq!(
        controller.state().error,
        "event channel lost: channel error: server down"
    );
    Ok(())
}

#[tokio::test]
async fn progress_is_stored_as_reported() -> Result<()> {
    let channel = FakeChannel::default().session(vec![
        progress("abc123", 60.0),
        progress("abc123", 25.0),
        thought("abc123", "still going"),
    ]);
    let mut controller = TaskController::new(FakeApi::starting(&["abc123"]), channel);
    controller.submit("market trends").await?;
    let mut updates = controller.subscribe();

    controller.pump().await;
    controller.pump().await;
    assert_eq!(controller.state().progress, 25.0);
    assert_eq!(
        drain(&mut updates),
        vec![TaskUpdate::Progress(60.0), TaskUpdate::Progress(25.0)]
    );
    Ok(())
}

#[tokio::test]
async fn resync_does_not_repeat_thoughts_replayed_after_rejoin() -> Result<()> {
    let api = FakeApi::starting(&["abc123"]).with_snapshot(TaskStatusSnapshot {
        task_id: "abc123".into(),
        status: RemoteStatus::Running,
        thoughts: vec!["A".into(), "B".into()],
        report: String::new(),
        progress: 50.0,
    });
    let channel = FakeChannel::default()
        .session(vec![thought("abc123", "A"), ChannelEvent::Lost("reset".into())])
        .session(vec![thought("abc123", "B"), complete("abc123", "done")]);
    let mut controller =
        TaskController::new(api, channel).with_reconnect_policy(quick_policy(1));
    let mut updates = controller.subscribe();
    controller.submit("market trends").await?;

    let state = controller.run_to_completion().await.clone();
    assert_eq!(state.status, TaskStatus::Completed);
    assert_eq!(state.thoughts, vec!["A", "B"]);
    let thought_updates = drain(&mut updates)
        .into_iter()
        .filter(|u| matches!(u, TaskUpdate::Thought(_)))
        .count();
    assert_eq!(thought_updates, 2);
    Ok(())
}

#[tokio::test]
async fn resync_overlap_only_skips_replayed_suffix() -> Result<()> {
    let api = FakeApi::starting(&["abc123"]).with_snapshot(TaskStatusSnapshot {
        task_id: "abc123".into(),
        status: RemoteStatus::Running,
        thoughts: vec!["A".into(), "B".into(), "C".into()],
        report: String::new(),
        progress: 50.0,
    });
    let channel = FakeChannel::default()
        .session(vec![thought("abc123", "A"), ChannelEvent::Lost("reset".into())])
        .session(vec![
            thought("abc123", "C"),
            thought("abc123", "D"),
            thought("abc123", "B"),
            complete("abc123", "done"),
        ]);
    let mut controller =
        TaskController::new(api, channel).with_reconnect_policy(quick_policy(1));
    controller.submit("market trends").await?;

    let state = controller.run_to_completion().await.clone();
    assert_eq!(state.thoughts, vec!["A", "B", "C", "D", "B"]);
    Ok(())
}

#[tokio::test]
async fn non_transient_connect_error_stops_reconnecting() -> Result<()> {
    let channel = FakeChannel::default()
        .session(vec![ChannelEvent::Lost("connection reset".into())])
        .broken("bad join frame")
        .session(vec![complete("abc123", "never delivered")]);
    let mut controller = TaskController::new(FakeApi::starting(&["abc123"]), channel)
        .with_reconnect_policy(quick_policy(3));
    controller.submit("market trends").await?;

    let state = controller.run_to_completion().await.clone();
    assert_eq!(state.status, TaskStatus::Error);
    assert_eq!(
        state.error,
        "event channel lost: protocol error: bad join frame"
    );
    assert_eq!(
        controller.channel().log,
        vec!["join:abc123", "leave:abc123", "refused:abc123"]
    );
    Ok(())
}

#[tokio::test]
async fn resynced_error_uses_bare_server_message() -> Result<()> {
    let api = FakeApi::starting(&["abc123"]).with_snapshot(TaskStatusSnapshot {
        task_id: "abc123".into(),
        status: RemoteStatus::Error,
        thoughts: vec!["Searching sources".into(), "Error occurred: quota".into()],
        report: String::new(),
        progress: 20.0,
    });
    let channel = FakeChannel::default()
        .session(vec![ChannelEvent::Lost("reset".into())])
        .session(Vec::new());
    let mut controller =
        TaskController::new(api, channel).with_reconnect_policy(quick_policy(1));
    controller.submit("market trends").await?;

    let state = controller.run_to_completion().await.clone();
    assert_eq!(state.status, TaskStatus::Error);
    assert_eq!(state.error, "quota");
    Ok(())
}
