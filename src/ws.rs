//! The signaling WebSocket endpoint: admission, the steady-state message
//! loop, and per-connection cleanup.
//!
//! Each connection gets a dedicated writer task draining an
//! [`OutboundReceiver`] so a slow reader never blocks fan-out to other peers
//! (see [`crate::room`]). The receive loop races against the peer's
//! [`CancellationToken`] so an overflow-triggered cancellation tears the
//! connection down exactly like a client-initiated disconnect.

use std::net::SocketAddr;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::close_code;
use crate::protocol::{InboundMessage, RoomCode, ServerMessage};
use crate::registry::{generate_peer_id, RegistryError};
use crate::room::{OutboundFrame, OutboundReceiver, Peer, OUTBOUND_QUEUE_DEPTH};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default, rename = "peerId")]
    peer_id: Option<String>,
    #[serde(default, rename = "isHost")]
    is_host: bool,
}

/// Admission step 1 (§4.F): the per-address connection limit is enforced
/// *before* the WebSocket upgrade completes, by rejecting with a plain HTTP
/// response instead of upgrading at all — there is no handshake yet to send
/// a close frame over.
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(code_raw): Path<String>,
    Query(params): Query<WsParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.registry.check_ip_limit(addr.ip()) {
        warn!(addr = %addr, "rejected connection: per-address connection limit");
        return (StatusCode::TOO_MANY_REQUESTS, "too many connections").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, code_raw, params, addr))
        .into_response()
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    code_raw: String,
    params: WsParams,
    addr: SocketAddr,
) {
    let Some(code) = RoomCode::parse(&code_raw) else {
        warn!(addr = %addr, code = %code_raw, "rejected connection: malformed room code");
        reject(&mut socket, "Room not found", close_code::ROOM_NOT_FOUND).await;
        return;
    };

    let is_host = params.is_host;
    let peer_id = params.peer_id.unwrap_or_else(generate_peer_id);
    let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let cancel = CancellationToken::new();
    let peer = Peer::new(peer_id.clone(), is_host, addr.ip(), sender.clone(), cancel.clone());

    let existing_peers = match state.registry.add_peer(&code, is_host, peer) {
        Ok(existing) => existing,
        Err(RegistryError::NotFound) => {
            debug!(room = %code, "rejected connection: room does not exist");
            reject(&mut socket, "Room not found", close_code::ROOM_NOT_FOUND).await;
            return;
        }
        Err(RegistryError::Full) => {
            debug!(room = %code, "rejected connection: room is full");
            reject(&mut socket, "Room is full", close_code::ROOM_FULL).await;
            return;
        }
        Err(RegistryError::Capacity) => {
            warn!("rejected connection: registry at room capacity");
            reject(&mut socket, "Server at capacity", close_code::NORMAL).await;
            return;
        }
    };

    let peer_count = existing_peers.len() + 1;
    let room_joined = OutboundFrame::Server(ServerMessage::RoomJoined {
        room_code: code.clone(),
        peer_id: peer_id.clone(),
        is_host,
        peer_count,
        peers: existing_peers,
    });
    let _ = sender.try_send(room_joined);
    info!(room = %code, peer = %peer_id, is_host, "peer joined room");

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(run_writer(ws_tx, receiver, cancel.clone()));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(room = %code, peer = %peer_id, "connection torn down (cancelled)");
                break;
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&state, &code, &peer_id, &sender, text.as_bytes());
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        handle_inbound(&state, &code, &peer_id, &sender, &bytes);
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(room = %code, peer = %peer_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = writer.await;
    state.registry.remove_peer(&code, &peer_id);
    info!(room = %code, peer = %peer_id, "peer disconnected");
}

/// Rate-limit, parse and relay one inbound frame. Violations and malformed
/// payloads get an in-band `error` frame rather than a disconnect.
fn handle_inbound(
    state: &AppState,
    code: &RoomCode,
    peer_id: &str,
    sender: &crate::room::OutboundSender,
    raw: &[u8],
) {
    if !state.registry.check_rate_limit(code, peer_id) {
        let _ = sender.try_send(OutboundFrame::Server(ServerMessage::Error {
            message: "rate limited".into(),
        }));
        return;
    }

    match InboundMessage::parse(raw) {
        Ok(inbound) => state.registry.relay(code, peer_id, inbound),
        Err(e) => {
            warn!(peer = %peer_id, error = %e, "malformed inbound message");
            let _ = sender.try_send(OutboundFrame::Server(ServerMessage::Error {
                message: format!("malformed message: {e}"),
            }));
        }
    }
}

/// Drain outbound frames onto the socket until the channel closes or the
/// peer is cancelled, then close the sink.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut receiver: OutboundReceiver,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = receiver.recv() => {
                match frame {
                    Some(frame) => {
                        let value = frame.into_json();
                        let text = match serde_json::to_string(&value) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize outbound frame");
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    let _ = ws_tx.close().await;
}

/// Admission rejection (§4.F steps 4-5): an in-band `error` frame followed
/// by a close frame carrying the dedicated close code. The frame goes out
/// first so a client sees the human-readable reason even if it ignores the
/// close code.
async fn reject(socket: &mut WebSocket, message: &str, code: u16) {
    if let Ok(text) = serde_json::to_string(&ServerMessage::Error {
        message: message.to_string(),
    }) {
        let _ = socket.send(Message::Text(text.into())).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: message.to_string().into(),
        })))
        .await;
}
