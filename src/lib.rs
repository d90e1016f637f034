//! Rendezvous signaling & relay server.
//!
//! Two endpoints collaborate over a short rendezvous room code: peers
//! connect to [`ws::ws_handler`] to exchange WebRTC handshake payloads over
//! a persistent signaling channel; if a direct peer-to-peer path can't be
//! established, either side can upload a file through the [`relay`] store
//! and hand the other a short-lived download URL.
//!
//! # Example
//!
//! ```rust,no_run
//! use rendezvous_relay::{config::Config, RendezvousServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = RendezvousServer::new(Config::from_env());
//!     server.run().await.unwrap();
//! }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod room;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use config::Config;
use registry::RoomRegistry;
use relay::RelayStore;

/// Shared state handed to every handler: the room registry, the relay
/// store, and the process start time (for `GET /api/stats`'s
/// `uptimeSeconds`). Cheap to clone — every field is an `Arc` or `Copy`.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub relay: Arc<RelayStore>,
    pub started_at: Instant,
}

/// The signaling + relay server: owns [`AppState`] and the two long-lived
/// janitor tasks (§5) for the lifetime of [`RendezvousServer::run`].
pub struct RendezvousServer {
    config: Config,
    state: AppState,
}

impl RendezvousServer {
    pub fn new(config: Config) -> Self {
        let state = AppState {
            registry: Arc::new(RoomRegistry::new()),
            relay: Arc::new(RelayStore::new(config.upload_dir.clone())),
            started_at: Instant::now(),
        };
        Self { config, state }
    }

    /// A handle to the shared state, useful for embedding the server inside
    /// a larger application or inspecting it from tests.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    fn router(&self) -> Router {
        Router::new()
            .merge(http::router())
            .merge(relay::relay_router())
            .route("/ws/{code}", get(ws::ws_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until a fatal I/O error, or
    /// forever otherwise. Spawns the room and relay janitors alongside the
    /// listener and aborts both on exit.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.state.relay.ensure_upload_dir().await?;

        let room_janitor = registry::spawn_janitor(self.state.registry.clone());
        let relay_janitor = relay::spawn_janitor(self.state.relay.clone());

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "rendezvous server listening");

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(listener, app).await;

        room_janitor.abort();
        relay_janitor.abort();
        result.map_err(Into::into)
    }
}
