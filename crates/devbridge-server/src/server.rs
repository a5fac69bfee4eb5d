//! `BridgeServer`: Axum HTTP + WebSocket listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use devbridge_core::ConnectionId;
use devbridge_core::constants::WS_PATH;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::persistence::{ArtifactStore, FsArtifactStore};
use crate::router::Router;
use crate::session::run_ws_session;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Envelope router.
    pub router: Router,
    /// Listener configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
}

/// The bridge server.
pub struct BridgeServer {
    config: Arc<ServerConfig>,
    router: Router,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl BridgeServer {
    /// Server persisting artifacts under `config.output_dir`.
    pub fn new(config: ServerConfig) -> Self {
        let store = Arc::new(FsArtifactStore::new(config.output_dir.clone()));
        Self::with_store(config, store)
    }

    /// Server with a custom artifact store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn ArtifactStore>) -> Self {
        let router = Router::new(config.request_timeout(), store);
        Self {
            config: Arc::new(config),
            router,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn app(&self) -> axum::Router {
        let state = AppState {
            router: self.router.clone(),
            config: Arc::clone(&self.config),
            start_time: self.start_time,
        };

        axum::Router::new()
            .route(WS_PATH, get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// The envelope router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind and start serving in the background.
    pub async fn listen(self) -> Result<ServerHandle, std::io::Error> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let app = self.app();

        let token = self.shutdown.token();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "listener stopped with error");
            }
        });

        info!(addr = %local_addr, "bridge listening");
        Ok(ServerHandle {
            addr: local_addr,
            router: self.router,
            shutdown: self.shutdown,
            task,
        })
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    addr: SocketAddr,
    router: Router,
    shutdown: Arc<ShutdownCoordinator>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `ws://` URL of the socket endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}{WS_PATH}", self.addr)
    }

    /// The envelope router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Close every connection and stop the listener.
    pub async fn shutdown(self) {
        self.router.close();
        self.shutdown
            .graceful_shutdown(vec![self.task], Some(Duration::from_secs(5)))
            .await;
        info!("bridge stopped");
    }

    /// Wait until the listener exits (after the coordinator fires).
    pub async fn wait(self) {
        let _ = self.task.await;
    }

    /// The shutdown coordinator.
    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.router.is_closed() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if state.router.connection_count() >= state.config.max_connections {
        warn!(max = state.config.max_connections, "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }

    let conn_id = ConnectionId::new();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, conn_id, state.router, state.config))
        .into_response()
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, &state.router.stats()))
}
