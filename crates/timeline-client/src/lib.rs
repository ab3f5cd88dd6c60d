//! Async harness that keeps a [`TimelineReplica`] in sync with a timeline
//! server over a WebSocket.
//!
//! Server envelopes are applied to the replica with the server origin before
//! they are handed to the caller, so by the time [`TimelineClient::next_envelope`]
//! returns, the replica already reflects that envelope. Local edits go through
//! the replica first and whatever requests it queues are flushed to the socket.

use std::{sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use timeline_core::{
    ClientEnvelope, EventDraft, EventId, EventPatch, ItemKey, ProjectId, ReplicaError,
    ServerEnvelope, TimelineReplica,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection refused with http status {0}")]
    Rejected(u16),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for a server envelope")]
    TimedOut,
}

/// Builds the per-project endpoint URL with the bearer credential as a query
/// parameter.
pub fn project_url(base: &str, project: ProjectId, token: &str) -> String {
    format!(
        "{}/projects/{}?token={}",
        base.trim_end_matches('/'),
        project,
        token
    )
}

pub struct TimelineClient {
    replica: Arc<Mutex<TimelineReplica>>,
    outbound: mpsc::UnboundedSender<Message>,
    inbound: mpsc::UnboundedReceiver<ServerEnvelope>,
    close_code: Arc<Mutex<Option<u16>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TimelineClient {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (stream, _) = match connect_async(url).await {
            Ok(pair) => pair,
            Err(tungstenite::Error::Http(response)) => {
                return Err(ClientError::Rejected(response.status().as_u16()));
            }
            Err(err) => return Err(err.into()),
        };
        let (mut sink, mut source) = stream.split();

        let replica = Arc::new(Mutex::new(TimelineReplica::new()));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let close_code = Arc::new(Mutex::new(None));
        let reader_close_code = Arc::clone(&close_code);
        let reader_replica = Arc::clone(&replica);
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(frame)) => {
                        *reader_close_code.lock() = frame.map(|frame| u16::from(frame.code));
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(error = %err, "timeline socket read failed");
                        break;
                    }
                };
                match serde_json::from_str::<ServerEnvelope>(text.as_str()) {
                    Ok(envelope) => {
                        reader_replica.lock().apply_server(&envelope);
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "ignoring undecodable server frame"),
                }
            }
        });

        Ok(Self {
            replica,
            outbound,
            inbound,
            close_code,
            reader,
            writer,
        })
    }

    /// Adds an event optimistically and sends the `add` request.
    pub fn add(&self, draft: EventDraft) -> Result<ItemKey, ClientError> {
        let key = self.replica.lock().add_local(draft)?;
        self.flush()?;
        Ok(key)
    }

    pub fn update(&self, id: EventId, patch: EventPatch) -> Result<(), ClientError> {
        self.replica.lock().update_local(id, patch)?;
        self.flush()
    }

    pub fn delete(&self, id: EventId) -> Result<(), ClientError> {
        self.replica.lock().remove_local(id)?;
        self.flush()
    }

    /// Sends a request without touching the replica.
    pub fn send(&self, request: &ClientEnvelope) -> Result<(), ClientError> {
        let json = serde_json::to_string(request)?;
        self.send_text(json)
    }

    /// Sends an arbitrary text frame.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.outbound
            .send(Message::text(text.into()))
            .map_err(|_| ClientError::Closed)
    }

    /// Sends a request as a binary frame.
    pub fn send_binary(&self, request: &ClientEnvelope) -> Result<(), ClientError> {
        let bytes = serde_json::to_vec(request)?;
        self.send_raw(bytes)
    }

    /// Sends arbitrary bytes as a binary frame.
    pub fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        self.outbound
            .send(Message::binary(bytes))
            .map_err(|_| ClientError::Closed)
    }

    /// Close code the server sent, once its close frame has been read.
    pub fn close_code(&self) -> Option<u16> {
        *self.close_code.lock()
    }

    pub async fn next_envelope(&mut self) -> Result<ServerEnvelope, ClientError> {
        self.inbound.recv().await.ok_or(ClientError::Closed)
    }

    /// Waits up to `within` for the next envelope.
    pub async fn expect_envelope(&mut self, within: Duration) -> Result<ServerEnvelope, ClientError> {
        match tokio::time::timeout(within, self.inbound.recv()).await {
            Ok(Some(envelope)) => Ok(envelope),
            Ok(None) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::TimedOut),
        }
    }

    /// Returns whatever arrives within `window`, or `None` if the server stays
    /// quiet.
    pub async fn poll_quiet(&mut self, window: Duration) -> Option<ServerEnvelope> {
        tokio::time::timeout(window, self.inbound.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn with_replica<R>(&self, f: impl FnOnce(&mut TimelineReplica) -> R) -> R {
        f(&mut self.replica.lock())
    }

    /// Sends a close frame and waits briefly for the writer to drain.
    pub async fn close(mut self) {
        let _ = self.outbound.send(Message::Close(None));
        if tokio::time::timeout(Duration::from_secs(2), &mut self.writer)
            .await
            .is_err()
        {
            self.writer.abort();
        }
        self.reader.abort();
    }

    fn flush(&self) -> Result<(), ClientError> {
        let requests = self.replica.lock().take_outbox();
        for request in &requests {
            self.send(request)?;
        }
        Ok(())
    }
}

impl Drop for TimelineClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn project_url_appends_token_query() {
        assert_eq!(
            project_url("ws://127.0.0.1:9000/", ProjectId(42), "abc"),
            "ws://127.0.0.1:9000/projects/42?token=abc"
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn connect_reports_unreachable_server() {
        let result = TimelineClient::connect("ws://127.0.0.1:1/projects/1?token=x").await;
        assert!(matches!(result, Err(ClientError::WebSocket(_))));
    }
}
