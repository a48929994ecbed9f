//! Long-lived push-channel listener.
//!
//! [`PushChannelListener::spawn`] starts a task that connects to the
//! ComfyUI WebSocket, folds raw messages into [`PushEvent`]s and hands
//! them to the consumer over a bounded `mpsc` channel. The listener never
//! touches task state itself.
//!
//! Connection drops are not errors: the listener flags itself
//! disconnected, emits [`PushEvent::Disconnected`] and reconnects with
//! backoff, reusing its client id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use stylize_core::backoff::BackoffConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection, ComfyUIClientError, WsStream};
use crate::events::PushEvent;
use crate::messages::{parse_message, ComfyUIMessage};
use crate::reconnect::reconnect_loop;

/// Capacity of the listener -> consumer handoff channel.
pub const PUSH_CHANNEL_CAPACITY: usize = 256;

/// How long a close handshake may take during shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long [`PushChannelListener::shutdown`] waits for the task to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a running listener task.
pub struct PushChannelListener {
    client_id: String,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    task_handle: JoinHandle<()>,
}

impl PushChannelListener {
    /// Spawn the listener. It runs until `cancel` fires or the receiving
    /// side of `events` is dropped.
    pub fn spawn(
        client: ComfyUIClient,
        backoff: BackoffConfig,
        events: mpsc::Sender<PushEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let client_id = client.client_id().to_string();
        let connected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&connected);
        let task_cancel = cancel.clone();

        let task_handle = tokio::spawn(async move {
            tracing::info!(client_id = %client.client_id(), "Starting push listener");
            run_listener(&client, &backoff, &events, &flag, &task_cancel).await;
            flag.store(false, Ordering::Release);
            tracing::info!(client_id = %client.client_id(), "Push listener exited");
        });

        Self {
            client_id,
            connected,
            cancel,
            task_handle,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Cancel the listener and wait up to 5 seconds for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.task_handle).await.is_err() {
            tracing::warn!(client_id = %self.client_id, "Push listener did not stop in time");
        }
    }
}

/// Why a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Socket closed or errored; reconnect.
    Dropped,
    Cancelled,
    /// Nobody consumes events any more; stop for good.
    ReceiverClosed,
}

/// Connect -> process -> reconnect, until cancelled.
async fn run_listener(
    client: &ComfyUIClient,
    backoff: &BackoffConfig,
    events: &mpsc::Sender<PushEvent>,
    connected: &AtomicBool,
    cancel: &CancellationToken,
) {
    let mut tracker = PromptTracker::default();

    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        result = client.connect() => result,
    };
    let mut pending: Option<ComfyUIConnection> = match first {
        Ok(conn) => Some(conn),
        Err(e) => {
            tracing::warn!(error = %e, "Connection failed, entering reconnect loop");
            None
        }
    };

    loop {
        let conn = match pending.take() {
            Some(conn) => conn,
            None => match reconnect_loop(client, backoff, cancel).await {
                Some(conn) => conn,
                None => return,
            },
        };
        let mut ws_stream = conn.ws_stream;

        connected.store(true, Ordering::Release);
        let connected_event = PushEvent::Connected {
            client_id: conn.client_id,
        };
        let end = match forward(events, connected_event, cancel).await {
            Some(end) => end,
            None => process_messages(&mut ws_stream, &mut tracker, events, cancel).await,
        };
        connected.store(false, Ordering::Release);
        tracker.clear();

        match end {
            SessionEnd::Cancelled | SessionEnd::ReceiverClosed => {
                close_quietly(&mut ws_stream).await;
                return;
            }
            SessionEnd::Dropped => {
                if forward(events, PushEvent::Disconnected, cancel).await.is_some() {
                    return;
                }
                tracing::info!(client_id = %client.client_id(), "Connection lost, entering reconnect loop");
            }
        }
    }
}

/// Read frames until the socket drops or `cancel` fires.
async fn process_messages(
    ws_stream: &mut WsStream,
    tracker: &mut PromptTracker,
    events: &mpsc::Sender<PushEvent>,
    cancel: &CancellationToken,
) -> SessionEnd {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            next = ws_stream.next() => next,
        };

        let event = match next {
            None => {
                tracing::info!("ComfyUI WebSocket stream ended");
                return SessionEnd::Dropped;
            }
            Some(Ok(Message::Text(text))) => tracker.handle_text(&text),
            Some(Ok(Message::Binary(_))) => {
                // Preview images.
                tracing::trace!("Ignoring binary message");
                None
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => None,
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                return SessionEnd::Dropped;
            }
            Some(Err(e)) => {
                let e = ComfyUIClientError::Protocol(e.to_string());
                tracing::warn!(error = %e, "WebSocket receive error");
                return SessionEnd::Dropped;
            }
        };

        if let Some(event) = event {
            if let Some(end) = forward(events, event, cancel).await {
                return end;
            }
        }
    }
}

/// Hand one event to the consumer. A full channel applies backpressure,
/// but cancellation still wins. Returns `Some` when the session must end.
async fn forward(
    events: &mpsc::Sender<PushEvent>,
    event: PushEvent,
    cancel: &CancellationToken,
) -> Option<SessionEnd> {
    tokio::select! {
        _ = cancel.cancelled() => Some(SessionEnd::Cancelled),
        sent = events.send(event) => match sent {
            Ok(()) => None,
            Err(_) => {
                tracing::warn!("Push event receiver dropped, stopping listener");
                Some(SessionEnd::ReceiverClosed)
            }
        },
    }
}

async fn close_quietly(ws_stream: &mut WsStream) {
    if let Ok(Err(e)) = tokio::time::timeout(CLOSE_TIMEOUT, ws_stream.close(None)).await {
        tracing::debug!(error = %e, "WebSocket close failed");
    }
}

// ---------------------------------------------------------------------------
// Message folding
// ---------------------------------------------------------------------------

/// Folds the raw message stream into [`PushEvent`]s.
///
/// `executed` outputs are buffered per prompt and released as one
/// `Completed` event when the prompt finishes. A prompt that finishes
/// with nothing buffered produces no event; the poller picks it up.
#[derive(Debug, Default)]
pub struct PromptTracker {
    outputs: HashMap<String, serde_json::Map<String, Value>>,
}

impl PromptTracker {
    /// Parse and fold one text frame. Malformed frames are logged and dropped.
    pub fn handle_text(&mut self, text: &str) -> Option<PushEvent> {
        match parse_message(text) {
            Ok(msg) => self.observe(msg),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    raw_message = %text,
                    "Failed to parse ComfyUI message",
                );
                None
            }
        }
    }

    pub fn observe(&mut self, msg: ComfyUIMessage) -> Option<PushEvent> {
        match msg {
            ComfyUIMessage::Progress(data) => {
                let Some(prompt_id) = data.prompt_id else {
                    tracing::debug!(value = data.value, max = data.max, "Progress without prompt id");
                    return None;
                };
                Some(PushEvent::Progress {
                    prompt_id,
                    node: data.node,
                    value: data.value,
                    max: data.max,
                })
            }
            ComfyUIMessage::ExecutionStart(data) => {
                tracing::debug!(prompt_id = %data.prompt_id, "Execution started");
                self.outputs.insert(data.prompt_id, serde_json::Map::new());
                None
            }
            ComfyUIMessage::Executed(data) => {
                tracing::debug!(prompt_id = %data.prompt_id, node = %data.node, "Node produced output");
                self.outputs
                    .entry(data.prompt_id)
                    .or_default()
                    .insert(data.node, data.output);
                None
            }
            ComfyUIMessage::Executing(data) => match (data.node, data.prompt_id) {
                (None, Some(prompt_id)) => self.finish(prompt_id),
                (Some(node), prompt_id) => {
                    tracing::trace!(?prompt_id, node = %node, "Executing node");
                    None
                }
                (None, None) => None,
            },
            ComfyUIMessage::ExecutionSuccess(data) => self.finish(data.prompt_id),
            ComfyUIMessage::ExecutionError(data) => {
                self.outputs.remove(&data.prompt_id);
                let reason = data.reason();
                Some(PushEvent::Failed {
                    prompt_id: data.prompt_id,
                    reason,
                })
            }
            ComfyUIMessage::ExecutionInterrupted(data) => {
                self.outputs.remove(&data.prompt_id);
                Some(PushEvent::Failed {
                    prompt_id: data.prompt_id,
                    reason: "execution interrupted".to_string(),
                })
            }
            ComfyUIMessage::ExecutionCached(data) => {
                tracing::debug!(prompt_id = %data.prompt_id, cached = data.nodes.len(), "Execution used cache");
                None
            }
            ComfyUIMessage::Status(data) => {
                tracing::debug!(
                    queue_remaining = data.status.exec_info.queue_remaining,
                    "ComfyUI queue status",
                );
                None
            }
        }
    }

    /// Drop everything buffered; partial outputs do not survive a reconnect.
    pub fn clear(&mut self) {
        self.outputs.clear();
    }

    fn finish(&mut self, prompt_id: String) -> Option<PushEvent> {
        match self.outputs.remove(&prompt_id) {
            Some(outputs) if !outputs.is_empty() => Some(PushEvent::Completed {
                prompt_id,
                outputs: Value::Object(outputs),
            }),
            _ => {
                tracing::debug!(prompt_id = %prompt_id, "Prompt finished without buffered outputs");
                None
            }
        }
    }
}
