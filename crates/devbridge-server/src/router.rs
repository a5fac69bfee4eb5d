//! Envelope router.
//!
//! Owns the connection registry, the pending-request table, and the
//! subscription registry behind a single lock, so a disconnect sweep is one
//! critical section. Every outbound frame is a non-blocking queue push, which
//! lets replies go out while the lock is held. The lock is never held across
//! an `.await`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use devbridge_core::commands::{
    ChannelRequest, Hello, HmrScreenshot, LogSubscribe, LogUnsubscribe, Publish, SavePayload,
};
use devbridge_core::constants::{BROWSER_REPLACED, HMR_CHANNEL, LIFECYCLE_CHANNEL, VERSION};
use devbridge_core::envelope::fields;
use devbridge_core::{
    BridgeError, CommandKind, ConnectionId, Envelope, LogEntry, RequestId, Role, SaveKind,
    SubscriptionId,
};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::connection::BridgeConnection;
use crate::pending::{NewPending, PendingTable};
use crate::persistence::ArtifactStore;
use crate::registry::ConnectionRegistry;
use crate::subscriptions::SubscriptionRegistry;

/// Point-in-time counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    /// Live sockets.
    pub connections: usize,
    /// Whether a browser holds the slot.
    pub browser_connected: bool,
    /// Requests awaiting a reply.
    pub pending_requests: usize,
    /// Log-stream subscriptions.
    pub log_subscriptions: usize,
    /// Channel memberships.
    pub channel_subscriptions: usize,
}

struct RouterState {
    connections: ConnectionRegistry,
    pending: PendingTable,
    subscriptions: SubscriptionRegistry,
    closed: bool,
}

impl RouterState {
    fn stats(&self) -> RouterStats {
        RouterStats {
            connections: self.connections.len(),
            browser_connected: self.connections.browser().is_some(),
            pending_requests: self.pending.len(),
            log_subscriptions: self.subscriptions.log_count(),
            channel_subscriptions: self.subscriptions.channel_count(),
        }
    }

    fn record_pending(&self) {
        gauge!("bridge_pending_requests").set(self.pending.len() as f64);
    }

    /// Relay `reply` to the origin of `request_id`. When `from` is given the
    /// entry must have been forwarded to that connection.
    fn resolve(&mut self, from: Option<&ConnectionId>, request_id: &str, reply: &Envelope) -> bool {
        if let Some(from) = from {
            if self.pending.target_of(request_id) != Some(from) {
                return false;
            }
        }
        let Some(entry) = self.pending.resolve(request_id) else {
            return false;
        };
        self.record_pending();
        match self.connections.get(&entry.origin) {
            Some(origin) => {
                if !origin.send_envelope(reply) {
                    debug!(
                        conn_id = %origin.id,
                        request_id,
                        "reply dropped, origin queue unavailable"
                    );
                }
            }
            None => debug!(request_id, "origin gone before reply"),
        }
        true
    }

    /// Fail every request forwarded to `target` with `browser-disconnected`.
    fn fail_targeting(&mut self, target: &ConnectionId) -> usize {
        let failed = self.pending.drain_target(target);
        for entry in &failed {
            if let Some(origin) = self.connections.get(&entry.origin) {
                let _ = origin.send_envelope(&Envelope::failure(
                    entry.failure_type.clone(),
                    Some(entry.request_id.as_str()),
                    BridgeError::BrowserDisconnected.to_string(),
                ));
            }
        }
        if !failed.is_empty() {
            self.record_pending();
        }
        failed.len()
    }

    fn publish_lifecycle(&self, event: &str, conn_id: &ConnectionId, extra: Option<(&str, Value)>) {
        let mut data = json!({"event": event, "connectionId": conn_id});
        if let (Some((key, value)), Some(map)) = (extra, data.as_object_mut()) {
            let _ = map.insert(key.to_owned(), value);
        }
        let _ = self
            .subscriptions
            .publish_channel(LIFECYCLE_CHANNEL, &data, &self.connections);
    }
}

struct Inner {
    state: Mutex<RouterState>,
    request_timeout: Duration,
    store: Arc<dyn ArtifactStore>,
}

impl Inner {
    fn expire(&self, request_id: &str, token: u64) {
        let mut state = self.state.lock();
        let Some(entry) = state.pending.expire(request_id, token) else {
            return;
        };
        state.record_pending();
        counter!("bridge_request_timeouts_total").increment(1);
        warn!(request_id, origin = %entry.origin, "request timed out");
        if let Some(origin) = state.connections.get(&entry.origin) {
            let _ = origin.send_envelope(&Envelope::failure(
                entry.failure_type,
                Some(request_id),
                BridgeError::Timeout.to_string(),
            ));
        }
    }
}

/// Dispatches envelopes between agents and the browser.
///
/// Cheap to clone; clones share state. Independent instances share nothing.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    /// New router. Forwarded requests expire after `request_timeout`.
    pub fn new(request_timeout: Duration, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RouterState {
                    connections: ConnectionRegistry::new(),
                    pending: PendingTable::new(),
                    subscriptions: SubscriptionRegistry::new(),
                    closed: false,
                }),
                request_timeout,
                store,
            }),
        }
    }

    /// Register a freshly accepted socket as an agent and greet it.
    pub fn attach(&self, conn: Arc<BridgeConnection>) -> Result<(), BridgeError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(BridgeError::Closed);
        }
        let _ = state.connections.register(Arc::clone(&conn), Role::Agent);
        let greeting = Envelope::success(
            "connection-established",
            None,
            json!({"connectionId": conn.id}),
        );
        let _ = conn.send_envelope(&greeting);
        Ok(())
    }

    /// Handle one inbound text frame.
    pub async fn handle(&self, conn: &Arc<BridgeConnection>, text: &str) {
        match Envelope::parse(text) {
            Ok(envelope) => self.handle_envelope(conn, envelope).await,
            Err(err) => {
                warn!(conn_id = %conn.id, error = %err, "malformed envelope");
                let request_id = serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|v| v.get(fields::REQUEST_ID)?.as_str().map(str::to_owned));
                send(
                    conn,
                    &Envelope::failure("error", request_id.as_deref(), err.to_string()),
                );
            }
        }
    }

    /// Handle one decoded envelope.
    pub async fn handle_envelope(&self, conn: &Arc<BridgeConnection>, envelope: Envelope) {
        debug!(
            conn_id = %conn.id,
            role = %conn.role(),
            envelope_type = envelope.kind(),
            request_id = ?envelope.request_id(),
            "envelope received"
        );

        if self.inner.state.lock().closed {
            send(
                conn,
                &Envelope::failure("error", envelope.request_id(), BridgeError::Closed.to_string()),
            );
            return;
        }

        let Some(command) = CommandKind::classify(envelope.kind()) else {
            warn!(conn_id = %conn.id, envelope_type = envelope.kind(), "unknown command");
            let err = BridgeError::UnknownCommand {
                kind: envelope.kind().to_owned(),
            };
            send(
                conn,
                &Envelope::failure("error", envelope.request_id(), err.to_string()),
            );
            return;
        };

        match command {
            CommandKind::Hello => self.on_hello(conn, &envelope),
            CommandKind::Ping => send(
                conn,
                &Envelope::success("pong", envelope.request_id(), json!({})),
            ),
            CommandKind::Status => self.on_status(conn, &envelope),
            CommandKind::ListSubscriptions => {
                let listing = self.inner.state.lock().subscriptions.list(&conn.id);
                let data = serde_json::to_value(listing).unwrap_or_default();
                send(
                    conn,
                    &Envelope::success("list-subscriptions-response", envelope.request_id(), data),
                );
            }
            CommandKind::Request(kind) => {
                if conn.is_browser() {
                    send(
                        conn,
                        &Envelope::failure(
                            kind.response_type(),
                            envelope.request_id(),
                            BridgeError::BrowserCannotRequest.to_string(),
                        ),
                    );
                } else {
                    self.forward(conn, envelope, kind.response_type().to_owned());
                }
            }
            CommandKind::Save(kind) => {
                if conn.is_browser() {
                    self.persist(conn, kind, &envelope).await;
                } else {
                    self.forward(conn, envelope, kind.error_type());
                }
            }
            CommandKind::LogSubscribe => self.on_log_subscribe(conn, &envelope),
            CommandKind::LogUnsubscribe => self.on_log_unsubscribe(conn, &envelope),
            CommandKind::Subscribe => self.on_subscribe(conn, &envelope),
            CommandKind::Unsubscribe => self.on_unsubscribe(conn, &envelope),
            CommandKind::ConsoleLog => self.on_console_log(conn, &envelope),
            CommandKind::HmrScreenshot => self.on_hmr_screenshot(conn, &envelope),
            CommandKind::Publish => self.on_publish(conn, &envelope),
            CommandKind::Reply => self.on_reply(conn, &envelope),
        }
    }

    /// Relay `reply` to whoever issued `request_id`.
    ///
    /// Returns `false` (and does nothing) for resolved, expired, or unknown
    /// ids.
    pub fn resolve(&self, request_id: &str, reply: &Envelope) -> bool {
        self.inner.state.lock().resolve(None, request_id, reply)
    }

    /// Remove a connection and everything that references it. Idempotent.
    pub fn disconnect(&self, id: &ConnectionId) {
        let mut state = self.inner.state.lock();
        let Some(removed) = state.connections.unregister(id) else {
            return;
        };

        let orphaned = state.pending.drain_origin(id).len();
        let failed = state.fail_targeting(id);
        let subscriptions = state.subscriptions.cleanup(id);
        state.record_pending();

        if removed.was_browser {
            info!(conn_id = %id, failed, "browser disconnected");
            state.publish_lifecycle("browser-disconnected", id, None);
        }
        debug!(
            conn_id = %id,
            role = %removed.connection.role(),
            orphaned,
            subscriptions,
            "connection swept"
        );
    }

    /// Abort every timer, close every connection, and clear all tables.
    ///
    /// Requests still in flight are answered with `bridge-closed`.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;

        for entry in state.pending.drain_all() {
            if let Some(origin) = state.connections.get(&entry.origin) {
                let _ = origin.send_envelope(&Envelope::failure(
                    entry.failure_type,
                    Some(entry.request_id.as_str()),
                    BridgeError::Closed.to_string(),
                ));
            }
        }
        for conn in state.connections.drain() {
            conn.close();
        }
        state.subscriptions.clear();
        state.record_pending();
        info!("router closed");
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Current counters.
    pub fn stats(&self) -> RouterStats {
        self.inner.state.lock().stats()
    }

    /// Live sockets.
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Whether a browser holds the slot.
    pub fn browser_connected(&self) -> bool {
        self.inner.state.lock().connections.browser().is_some()
    }

    /// Requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    // ── Handlers ────────────────────────────────────────────────────────────

    fn on_hello(&self, conn: &Arc<BridgeConnection>, envelope: &Envelope) {
        let hello: Hello = match envelope.decode() {
            Ok(hello) => hello,
            Err(err) => {
                send(
                    conn,
                    &Envelope::failure("hello-response", envelope.request_id(), err.to_string()),
                );
                return;
            }
        };

        let mut state = self.inner.state.lock();
        if state.connections.get(&conn.id).is_none() {
            return;
        }
        let was_browser = conn.is_browser();
        if let Some(lost) = state.connections.register(Arc::clone(conn), hello.role) {
            let failed = state.fail_targeting(&lost.id);
            state.publish_lifecycle("browser-disconnected", &lost.id, None);
            if lost.id != conn.id {
                info!(old = %lost.id, new = %conn.id, failed, "browser replaced");
                send(
                    &lost,
                    &Envelope::new(BROWSER_REPLACED).with("data", json!({"by": conn.id})),
                );
                lost.close();
            }
        }

        send(
            conn,
            &Envelope::success(
                "hello-response",
                envelope.request_id(),
                json!({"connectionId": conn.id, "role": hello.role}),
            ),
        );

        if hello.role == Role::Browser && !was_browser {
            info!(conn_id = %conn.id, url = ?hello.url, "browser connected");
            let url = hello.url.map(|u| ("url", Value::String(u)));
            state.publish_lifecycle("browser-connected", &conn.id, url);
        }
    }

    fn on_status(&self, conn: &Arc<BridgeConnection>, envelope: &Envelope) {
        let stats = self.stats();
        let mut data = serde_json::to_value(stats).unwrap_or_default();
        if let Some(map) = data.as_object_mut() {
            let _ = map.insert("version".into(), json!(VERSION));
            let _ = map.insert("connectionId".into(), json!(conn.id));
            let _ = map.insert("role".into(), json!(conn.role()));
        }
        send(
            conn,
            &Envelope::success("status-response", envelope.request_id(), data),
        );
    }

    /// Store a pending entry and forward `envelope` verbatim to the browser.
    fn forward(&self, conn: &Arc<BridgeConnection>, mut envelope: Envelope, failure_type: String) {
        let request_id = if let Some(id) = envelope.request_id() {
            id.to_owned()
        } else {
            let id = RequestId::new().into_inner();
            envelope.set_request_id(&id);
            id
        };

        let mut state = self.inner.state.lock();
        let Some(browser) = state.connections.browser().cloned() else {
            debug!(conn_id = %conn.id, request_id = %request_id, "no browser connected");
            send(
                conn,
                &Envelope::failure(
                    failure_type,
                    Some(request_id.as_str()),
                    BridgeError::NoBrowserConnected.to_string(),
                ),
            );
            return;
        };

        let timeout = self.inner.request_timeout;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timer_id = request_id.clone();
        let created = state.pending.create(
            NewPending {
                request_id: request_id.clone(),
                origin: conn.id.clone(),
                target: browser.id.clone(),
                failure_type: failure_type.clone(),
                timeout,
            },
            move |token| {
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(&timer_id, token);
                    }
                })
                .abort_handle()
            },
        );
        if let Err(err) = created {
            warn!(conn_id = %conn.id, request_id = %request_id, "duplicate request id");
            send(
                conn,
                &Envelope::failure(failure_type, Some(request_id.as_str()), err.to_string()),
            );
            return;
        }
        state.record_pending();

        if browser.send_envelope(&envelope) {
            debug!(
                conn_id = %conn.id,
                browser = %browser.id,
                request_id = %request_id,
                envelope_type = envelope.kind(),
                "request forwarded"
            );
        } else {
            let _ = state.pending.cancel(&request_id);
            state.record_pending();
            warn!(browser = %browser.id, request_id = %request_id, "browser queue unavailable");
            send(
                conn,
                &Envelope::failure(
                    failure_type,
                    Some(request_id.as_str()),
                    BridgeError::SendFailed.to_string(),
                ),
            );
        }
    }

    /// Second leg of a save: the browser hands over the payload.
    async fn persist(&self, conn: &Arc<BridgeConnection>, kind: SaveKind, envelope: &Envelope) {
        let request_id = envelope.request_id();
        let reply = match envelope.decode::<SavePayload>() {
            Err(err) => Envelope::failure(kind.error_type(), request_id, err.to_string()),
            Ok(payload) => match self.inner.store.save(kind, &payload.data).await {
                Ok(path) => Envelope::success(
                    kind.saved_type(),
                    request_id,
                    json!({"path": path.display().to_string()}),
                ),
                Err(err) => {
                    warn!(kind = kind.as_str(), error = %err, "artifact save failed");
                    Envelope::failure(
                        kind.error_type(),
                        request_id,
                        BridgeError::Persistence(err.to_string()).to_string(),
                    )
                }
            },
        };

        send(conn, &reply);
        if let Some(id) = request_id {
            let _ = self.inner.state.lock().resolve(Some(&conn.id), id, &reply);
        }
    }

    fn on_reply(&self, conn: &Arc<BridgeConnection>, envelope: &Envelope) {
        if !conn.is_browser() {
            reject(conn, envelope, &BridgeError::ReplyFromNonBrowser);
            return;
        }
        let Some(request_id) = envelope.request_id() else {
            debug!(envelope_type = envelope.kind(), "reply without requestId ignored");
            return;
        };
        if !self
            .inner
            .state
            .lock()
            .resolve(Some(&conn.id), request_id, envelope)
        {
            debug!(request_id, "late or unknown reply dropped");
        }
    }

    fn on_log_subscribe(&self, conn: &Arc<BridgeConnection>, envelope: &Envelope) {
        let result = envelope.decode::<LogSubscribe>().and_then(|req| {
            let id = SubscriptionId::from(req.subscription_id);
            self.inner
                .state
                .lock()
                .subscriptions
                .subscribe_log(&conn.id, id.clone(), req.filters)?;
            Ok(json!({"subscriptionId": id}))
        });
        respond(conn, "log-subscribe-response", envelope, result);
    }

    fn on_log_unsubscribe(&self, conn: &Arc<BridgeConnection>, envelope: &Envelope) {
        let result = envelope.decode::<LogUnsubscribe>().and_then(|req| {
            let id = SubscriptionId::from(req.subscription_id);
            self.inner
                .state
                .lock()
                .subscriptions
                .unsubscribe_log(&conn.id, &id)?;
            Ok(json!({"subscriptionId": id}))
        });
        respond(conn, "log-unsubscribe-response", envelope, result);
    }

    fn on_subscribe(&self, conn: &Arc<BridgeConnection>, envelope: &Envelope) {
        let result = envelope.decode::<ChannelRequest>().map(|req| {
            let added = self
                .inner
                .state
                .lock()
                .subscriptions
                .subscribe_channel(&conn.id, &req.channel);
            json!({"channel": req.channel, "added": added})
        });
        respond(conn, "subscribe-response", envelope, result);
    }

    fn on_unsubscribe(&self, conn: &Arc<BridgeConnection>, envelope: &Envelope) {
        let result = envelope.decode::<ChannelRequest>().and_then(|req| {
            let removed = self
                .inner
                .state
                .lock()
                .subscriptions
                .unsubscribe_channel(&conn.id, &req.channel);
            if removed {
                Ok(json!({"channel": req.channel}))
            } else {
                Err(BridgeError::SubscriptionNotFound)
            }
        });
        respond(conn, "unsubscribe-response", envelope, result);
    }

    fn on_console_log(&self, conn: &Arc<BridgeConnection>, envelope: &Envelope) {
        match envelope.decode::<LogEntry>() {
            Ok(entry) => {
                let state = self.inner.state.lock();
                let delivered = state.subscriptions.publish_log(&entry, &state.connections);
                debug!(level = %entry.level, delivered, "console log fanned out");
            }
            Err(err) => reject(conn, envelope, &err),
        }
    }

    fn on_hmr_screenshot(&self, conn: &Arc<BridgeConnection>, envelope: &Envelope) {
        match envelope.decode::<HmrScreenshot>() {
            Ok(capture) => {
                let data = json!({"sequence": capture.sequence, "data": capture.data});
                let state = self.inner.state.lock();
                let delivered = state
                    .subscriptions
                    .publish_channel(HMR_CHANNEL, &data, &state.connections);
                debug!(sequence = capture.sequence, delivered, "hmr capture fanned out");
            }
            Err(err) => reject(conn, envelope, &err),
        }
    }

    fn on_publish(&self, conn: &Arc<BridgeConnection>, envelope: &Envelope) {
        match envelope.decode::<Publish>() {
            Ok(publish) => {
                let state = self.inner.state.lock();
                let delivered =
                    state
                        .subscriptions
                        .publish_channel(&publish.channel, &publish.data, &state.connections);
                debug!(channel = %publish.channel, delivered, "channel event fanned out");
            }
            Err(err) => reject(conn, envelope, &err),
        }
    }
}

fn send(conn: &BridgeConnection, envelope: &Envelope) {
    if !conn.send_envelope(envelope) {
        debug!(conn_id = %conn.id, envelope_type = envelope.kind(), "outbound frame dropped");
    }
}

fn respond(
    conn: &BridgeConnection,
    kind: &str,
    request: &Envelope,
    result: Result<Value, BridgeError>,
) {
    let reply = Envelope::response(kind, request.request_id(), result.map_err(|e| e.to_string()));
    send(conn, &reply);
}

fn reject(conn: &BridgeConnection, envelope: &Envelope, err: &BridgeError) {
    warn!(
        conn_id = %conn.id,
        envelope_type = envelope.kind(),
        error = %err,
        "envelope rejected"
    );
    send(
        conn,
        &Envelope::failure("error", envelope.request_id(), err.to_string()),
    );
}
