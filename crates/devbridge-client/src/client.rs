//! Agent connection to the bridge.
//!
//! One background task owns the socket. Requests register a oneshot under
//! their `requestId` before the frame is written; the task completes it when
//! the correlated reply arrives. Frames nobody is waiting for (`log-event`,
//! `channel-event`) go to the event channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use devbridge_core::{ConnectionId, Envelope, LogEntry, LogFilter, RequestId, SubscriptionId};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::ClientError;

/// How long `connect` waits for the socket and the greeting.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra wait on top of the bridge's request timeout, so the bridge's own
/// `timeout` reply wins the race when the browser is silent.
pub const REPLY_GRACE: Duration = Duration::from_secs(2);

const EVENT_QUEUE: usize = 1024;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Envelope>>>>;

/// A connected agent.
#[derive(Debug)]
pub struct AgentClient {
    url: String,
    connection_id: Option<ConnectionId>,
    out_tx: mpsc::Sender<String>,
    pending: PendingMap,
    events: Option<mpsc::Receiver<Envelope>>,
    task: JoinHandle<()>,
}

impl AgentClient {
    /// Open a socket to `url` and wait for `connection-established`.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let connect_err = |reason: String| ClientError::Connect {
            url: url.to_owned(),
            reason,
        };
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| connect_err("timed out".into()))?
            .map_err(|e| connect_err(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let greeting = tokio::time::timeout(CONNECT_TIMEOUT, next_envelope(&mut ws_rx))
            .await
            .map_err(|_| connect_err("no greeting from bridge".into()))??;
        let connection_id = greeting
            .data()
            .and_then(|d| d.get("connectionId"))
            .and_then(Value::as_str)
            .map(ConnectionId::from);

        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let (event_tx, event_rx) = mpsc::channel::<Envelope>(EVENT_QUEUE);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let loop_pending = Arc::clone(&pending);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    text = out_rx.recv() => {
                        let Some(text) = text else {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            break;
                        };
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    envelope = next_envelope(&mut ws_rx) => {
                        let Ok(envelope) = envelope else { break };
                        dispatch(&loop_pending, &event_tx, envelope);
                    }
                }
            }
            // Dropping the senders wakes every waiter with `Closed`.
            loop_pending.lock().clear();
        });

        debug!(url, connection_id = ?connection_id, "agent connected");
        Ok(Self {
            url: url.to_owned(),
            connection_id,
            out_tx,
            pending,
            events: Some(event_rx),
            task,
        })
    }

    /// Bridge URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Id the bridge assigned to this socket.
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection_id.as_ref()
    }

    /// Send `envelope` and wait up to `wait` for the reply with its
    /// `requestId` (one is generated when absent). The reply is returned
    /// whatever its `success` flag.
    pub async fn request(
        &self,
        mut envelope: Envelope,
        wait: Duration,
    ) -> Result<Envelope, ClientError> {
        let request_id = match envelope.request_id() {
            Some(id) => id.to_owned(),
            None => {
                let id = RequestId::new().into_inner();
                envelope.set_request_id(&id);
                id
            }
        };

        let (tx, rx) = oneshot::channel();
        let _ = self.pending.lock().insert(request_id.clone(), tx);
        if self.out_tx.send(envelope.to_json()).await.is_err() {
            let _ = self.pending.lock().remove(&request_id);
            return Err(ClientError::Closed);
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                let _ = self.pending.lock().remove(&request_id);
                Err(ClientError::Timeout { waited: wait })
            }
        }
    }

    /// Like [`AgentClient::request`], but `success:false` becomes
    /// [`ClientError::Remote`].
    pub async fn call(&self, envelope: Envelope, wait: Duration) -> Result<Envelope, ClientError> {
        let reply = self.request(envelope, wait).await?;
        if reply.is_success() {
            Ok(reply)
        } else {
            Err(ClientError::Remote {
                kind: reply.kind().to_owned(),
                error: reply.error().unwrap_or("unknown error").to_owned(),
            })
        }
    }

    /// Take the stream of uncorrelated frames. Only the first call gets it.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<Envelope>> {
        self.events.take()
    }

    /// Subscribe to console logs matching `filters`.
    pub async fn follow_logs(
        &mut self,
        filters: LogFilter,
        wait: Duration,
    ) -> Result<LogFollow, ClientError> {
        let events = self.take_events().ok_or(ClientError::Closed)?;
        let subscription_id = SubscriptionId::new();
        let envelope = Envelope::new("log-subscribe")
            .with("subscriptionId", json!(subscription_id))
            .with("filters", serde_json::to_value(&filters).unwrap_or_default());
        let _ = self.call(envelope, wait).await?;
        Ok(LogFollow {
            subscription_id,
            events,
        })
    }

    /// Close the socket.
    pub async fn close(self) {
        drop(self.out_tx);
        let abort = self.task.abort_handle();
        if tokio::time::timeout(Duration::from_secs(1), self.task).await.is_err() {
            abort.abort();
        }
    }
}

/// Live log subscription.
#[derive(Debug)]
pub struct LogFollow {
    subscription_id: SubscriptionId,
    events: mpsc::Receiver<Envelope>,
}

impl LogFollow {
    /// Subscription key registered with the bridge.
    pub fn subscription_id(&self) -> &SubscriptionId {
        &self.subscription_id
    }

    /// Next matching entry, or `None` once the connection closes.
    pub async fn next(&mut self) -> Option<LogEntry> {
        while let Some(envelope) = self.events.recv().await {
            if envelope.kind() != "log-event"
                || envelope.str_field("subscriptionId") != Some(self.subscription_id.as_str())
            {
                continue;
            }
            match envelope.data().cloned().map(serde_json::from_value::<LogEntry>) {
                Some(Ok(entry)) => return Some(entry),
                _ => warn!("log-event without a decodable entry"),
            }
        }
        None
    }
}

fn dispatch(pending: &PendingMap, events: &mpsc::Sender<Envelope>, envelope: Envelope) {
    let waiter = envelope
        .request_id()
        .and_then(|id| pending.lock().remove(id));
    match waiter {
        Some(tx) => {
            let _ = tx.send(envelope);
        }
        None => {
            if events.try_send(envelope).is_err() {
                debug!("event queue full or unread, frame dropped");
            }
        }
    }
}

async fn next_envelope<S>(ws_rx: &mut S) -> Result<Envelope, ClientError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws_rx.next().await {
            None => return Err(ClientError::Closed),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Message::Text(text))) => match Envelope::parse(text.as_str()) {
                Ok(envelope) => return Ok(envelope),
                Err(e) => warn!(error = %e, "undecodable frame from bridge"),
            },
            Some(Ok(Message::Close(_))) => return Err(ClientError::Closed),
            Some(Ok(_)) => {}
        }
    }
}
