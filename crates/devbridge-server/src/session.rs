//! WebSocket session lifecycle: one accepted socket from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use devbridge_core::ConnectionId;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::connection::BridgeConnection;
use crate::router::Router;

/// How long the writer may take to flush after the session ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Run a session for an upgraded socket.
///
/// 1. Registers the connection with the router, which greets it with
///    `connection-established`
/// 2. Hands every inbound text frame to the router, in arrival order
/// 3. Drains the outbound queue and sends periodic Ping frames, dropping the
///    socket after prolonged silence
/// 4. Sweeps the router on exit
#[instrument(skip_all, fields(conn_id = %conn_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    conn_id: ConnectionId,
    router: Router,
    config: Arc<ServerConfig>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(config.send_queue.max(1));
    let connection = Arc::new(BridgeConnection::new(conn_id, send_tx));

    if router.attach(Arc::clone(&connection)).is_err() {
        debug!("router closed, refusing connection");
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }

    info!("client connected");
    counter!("bridge_connections_total").increment(1);
    gauge!("bridge_connections_active").increment(1.0);

    let ping_every = config.heartbeat_interval();
    let silence_limit = config.heartbeat_timeout();
    let outbound_conn = Arc::clone(&connection);
    let outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(ping_every);
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if !outbound_conn.check_alive()
                        && outbound_conn.last_seen_elapsed() > silence_limit
                    {
                        warn!(?silence_limit, "client unresponsive, disconnecting");
                        outbound_conn.close();
                        break;
                    }
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                () = outbound_conn.closed() => {
                    // Flush whatever was queued before the close request.
                    while let Ok(text) = send_rx.try_recv() {
                        if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = connection.closed() => break,
        };
        let Some(Ok(msg)) = msg else { break };
        connection.mark_alive();

        let text = match msg {
            Message::Text(ref t) => t.as_str().to_owned(),
            Message::Binary(ref data) => match std::str::from_utf8(data) {
                Ok(s) => s.to_owned(),
                Err(_) => {
                    debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        router.handle(&connection, &text).await;
    }

    router.disconnect(&connection.id);
    connection.close();
    let abort = outbound.abort_handle();
    if tokio::time::timeout(FLUSH_TIMEOUT, outbound).await.is_err() {
        abort.abort();
    }

    info!(dropped = connection.drop_count(), "client disconnected");
    gauge!("bridge_connections_active").decrement(1.0);
    histogram!("bridge_connection_duration_seconds").record(connection.age().as_secs_f64());
}
