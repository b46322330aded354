//! Task event channel.
//!
//! One channel instance holds at most one live connection, scoped to a single
//! task by the join message sent right after the handshake. Events for any
//! other task are dropped before they reach the consumer.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sleuth_protocol::{ClientMessage, ServerEvent, TaskId};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::error::{ClientError, ClientResult};

const EVENT_BUFFER: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One item delivered by an [`EventChannel`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// An event for the joined task.
    Event(ServerEvent),
    /// The transport ended or failed; carries a human-readable reason.
    Lost(String),
}

/// Server-push connection scoped to one task.
#[allow(async_fn_in_trait)]
pub trait EventChannel {
    /// Open a new connection and join `task_id`. Any open connection is
    /// torn down first; connections are never reused.
    async fn connect(&mut self, task_id: &str) -> ClientResult<()>;

    /// Tear down the open connection. No-op when nothing is connected.
    /// Nothing from the old connection is delivered after this returns.
    async fn disconnect(&mut self);

    /// Next event for the joined task. `None` when not connected or once a
    /// lost connection has been reported.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    fn is_connected(&self) -> bool;
}

/// Passes `event` through only if it belongs to `task_id`.
pub fn accept_for(task_id: &str, event: ServerEvent) -> Option<ServerEvent> {
    if event.task_id() == task_id {
        Some(event)
    } else {
        debug!(
            joined = task_id,
            received = event.task_id(),
            kind = event.kind(),
            "dropping event for another task"
        );
        None
    }
}

/// Maps an http(s) backend URL onto the matching ws(s) URL.
pub fn http_to_ws_url(http_url: &str) -> String {
    if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if http_url.starts_with("ws://") || http_url.starts_with("wss://") {
        http_url.to_string()
    } else {
        format!("ws://{http_url}")
    }
}

struct Connection {
    task_id: TaskId,
    sink: SplitSink<WsStream, Message>,
    events: mpsc::Receiver<ChannelEvent>,
    reader: JoinHandle<()>,
}

/// [`EventChannel`] over a websocket carrying JSON text frames.
pub struct WsChannel {
    url: String,
    connection: Option<Connection>,
}

impl WsChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn joined_task(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.task_id.as_str())
    }
}

impl EventChannel for WsChannel {
    async fn connect(&mut self, task_id: &str) -> ClientResult<()> {
        if self.connection.is_some() {
            self.disconnect().await;
        }

        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| ClientError::Channel {
                message: format!("failed to connect {}: {err}", self.url),
            })?;
        let (mut sink, source) = stream.split();

        let join = encode(&ClientMessage::JoinTask {
            task_id: task_id.to_string(),
        })?;
        sink.send(Message::text(join))
            .await
            .map_err(|err| ClientError::Channel {
                message: format!("failed to send join: {err}"),
            })?;

        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let reader = tokio::spawn(read_loop(source, task_id.to_string(), tx));

        info!(task_id, url = %self.url, "event channel joined");
        self.connection = Some(Connection {
            task_id: task_id.to_string(),
            sink,
            events,
            reader,
        });
        Ok(())
    }

    async fn disconnect(&mut self) {
        let Some(mut conn) = self.connection.take() else {
            return;
        };
        conn.reader.abort();

        let leave = encode(&ClientMessage::LeaveTask {
            task_id: conn.task_id.clone(),
        });
        let teardown = async {
            if let Ok(text) = leave {
                let _ = conn.sink.send(Message::text(text)).await;
            }
            let _ = conn.sink.close().await;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, teardown).await.is_err() {
            debug!(task_id = %conn.task_id, "close handshake timed out");
        }
        debug!(task_id = %conn.task_id, "event channel disconnected");
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        let conn = self.connection.as_mut()?;
        conn.events.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Some(conn) = &self.connection {
            conn.reader.abort();
        }
    }
}

async fn read_loop(
    mut source: SplitStream<WsStream>,
    task_id: TaskId,
    tx: mpsc::Sender<ChannelEvent>,
) {
    let reason = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(event) => {
                    if let Some(event) = accept_for(&task_id, event) {
                        if tx.send(ChannelEvent::Event(event)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => warn!(task_id = %task_id, "undecodable channel frame: {err}"),
            },
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "server closed the channel".to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => break err.to_string(),
            None => break "server closed the channel".to_string(),
        }
    };
    let _ = tx.send(ChannelEvent::Lost(reason)).await;
}

fn encode(msg: &ClientMessage) -> ClientResult<String> {
    serde_json::to_string(msg).map_err(|err| ClientError::Protocol {
        message: format!("failed to encode channel message: {err}"),
    })
}
