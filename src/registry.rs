//! The room registry: the single shared mutable structure in the signaling
//! path (§5). Guards `rooms`, the per-address connection counter and the
//! rolling counters/latency window behind one coarse [`std::sync::Mutex`].
//!
//! A coarse lock is deliberate, not a shortcut: every operation here is O(1)
//! (map lookup/insert/remove, a handful of non-blocking channel sends) and
//! the room count is bounded at [`MAX_ROOMS`], so contention never
//! accumulates the way it would around a blocking operation. Holding the
//! lock across a multi-step mutation (e.g. insert peer + notify existing
//! members) is what keeps add/remove peer atomic per §7 ("never partially
//! applies a multi-step mutation").

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::protocol::{InboundMessage, PeerId, RoomCode, ServerMessage, ROOM_CODE_ALPHABET, ROOM_CODE_LENGTH};
use crate::room::{OutboundFrame, Peer, Room};

/// Hard cap on the number of simultaneously active rooms.
pub const MAX_ROOMS: usize = 10_000;

/// Hard cap on simultaneous connections sharing a source address.
pub const MAX_CONNECTIONS_PER_IP: usize = 10;

/// Inbound message budget per peer.
pub const MAX_MESSAGES_PER_SECOND: u64 = 100;

/// Minimum inter-message interval implied by [`MAX_MESSAGES_PER_SECOND`].
pub const MIN_MESSAGE_INTERVAL: Duration = Duration::from_millis(1000 / MAX_MESSAGES_PER_SECOND);

/// Idle-room janitor cadence.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

const LATENCY_WINDOW_CAP: usize = 1000;
const LATENCY_WINDOW_TRIM_TO: usize = 500;

/// Errors from registry operations; each maps to a REST status or a
/// WebSocket close code at the call site (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    Capacity,
    NotFound,
    Full,
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Capacity => AppError::Capacity,
            RegistryError::NotFound => AppError::NotFound,
            RegistryError::Full => AppError::Full,
        }
    }
}

/// A point-in-time summary of a room, for the REST surface.
pub struct RoomSummary {
    pub code: RoomCode,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub peer_count: usize,
    pub has_host: bool,
}

/// Aggregate counters for `GET /api/stats`.
pub struct Stats {
    pub active_rooms: usize,
    pub total_connections: u64,
    pub total_messages: u64,
    pub avg_latency_ms: f64,
}

struct RegistryState {
    rooms: HashMap<RoomCode, Room>,
    ip_connections: HashMap<IpAddr, usize>,
    total_connections: u64,
    total_messages: u64,
    latency_samples_ms: Vec<u64>,
}

impl RegistryState {
    fn record_latency(&mut self, ms: u64) {
        self.latency_samples_ms.push(ms);
        if self.latency_samples_ms.len() > LATENCY_WINDOW_CAP {
            let start = self.latency_samples_ms.len() - LATENCY_WINDOW_TRIM_TO;
            self.latency_samples_ms.drain(0..start);
        }
    }
}

/// Draw [`ROOM_CODE_LENGTH`] symbols from [`ROOM_CODE_ALPHABET`] using a
/// cryptographically strong source.
fn draw_code() -> String {
    let mut rng = rand::rng();
    (0..ROOM_CODE_LENGTH)
        .map(|_| ROOM_CODE_ALPHABET[rng.random_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Generate an 8-byte URL-safe token for a peer that didn't supply its own id.
pub fn generate_peer_id() -> PeerId {
    let mut bytes = [0u8; 8];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// The room registry: map code -> room, plus the admission-control counters
/// that share its coarse lock.
pub struct RoomRegistry {
    state: Mutex<RegistryState>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                rooms: HashMap::new(),
                ip_connections: HashMap::new(),
                total_connections: 0,
                total_messages: 0,
                latency_samples_ms: Vec::new(),
            }),
        }
    }

    /// Create a room with a freshly generated code, re-drawing on collision
    /// against the live registry. Used by `POST /api/rooms`.
    pub fn create(&self) -> Result<RoomCode, RegistryError> {
        let mut state = self.state.lock().unwrap();
        if state.rooms.len() >= MAX_ROOMS {
            return Err(RegistryError::Capacity);
        }
        let code = loop {
            let candidate = RoomCode::from_valid(draw_code());
            if !state.rooms.contains_key(&candidate) {
                break candidate;
            }
        };
        state.rooms.insert(code.clone(), Room::new(code.clone()));
        Ok(code)
    }

    /// Look up a room by code. Lazily reaps it first if expired, so a
    /// stale room never appears "found" to a caller.
    pub fn lookup_summary(&self, code: &RoomCode) -> Option<RoomSummary> {
        let mut state = self.state.lock().unwrap();
        reap_if_expired(&mut state, code);
        state.rooms.get(code).map(|room| RoomSummary {
            code: room.code.clone(),
            created_at: room.created_at,
            peer_count: room.peer_count(),
            has_host: room.has_host(),
        })
    }

    /// Close a room: remove it, decrement every member's per-address
    /// connection count, and notify each member's connection to tear down
    /// with `close_code::NORMAL`. Errors delivering to an individual peer
    /// are swallowed (the peer's own receive loop will clean it up).
    ///
    /// The room is gone from `state.rooms` by the time each peer's own
    /// `remove_peer` call runs (triggered by the cancellation below), so
    /// `ip_connections` must be decremented here — `remove_peer` finding no
    /// room for `code` returns early and never touches the counter.
    pub fn close(&self, code: &RoomCode) {
        let mut state = self.state.lock().unwrap();
        if let Some(room) = state.rooms.remove(code) {
            for peer in room.peers() {
                decrement_ip_connection(&mut state.ip_connections, peer.source_address);
                peer.cancel_for_shutdown();
            }
            debug!(room = %code, "room closed");
        }
    }

    /// Admit a peer into a room.
    ///
    /// If the room doesn't exist and `create_as_host` is true, a room is
    /// created under the requested code directly (§9's adopted redesign —
    /// no mint-then-rename dance). Otherwise an absent room is
    /// [`RegistryError::NotFound`].
    pub fn add_peer(
        &self,
        code: &RoomCode,
        create_as_host: bool,
        peer: Peer,
    ) -> Result<Vec<PeerId>, RegistryError> {
        let mut state = self.state.lock().unwrap();
        reap_if_expired(&mut state, code);

        if !state.rooms.contains_key(code) {
            if !create_as_host {
                return Err(RegistryError::NotFound);
            }
            if state.rooms.len() >= MAX_ROOMS {
                return Err(RegistryError::Capacity);
            }
            state.rooms.insert(code.clone(), Room::new(code.clone()));
        }

        let room = state.rooms.get_mut(code).expect("just ensured present");
        if room.is_full() {
            return Err(RegistryError::Full);
        }

        let existing: Vec<PeerId> = room.peers().map(|p| p.peer_id.clone()).collect();

        let join_msg = OutboundFrame::Server(ServerMessage::PeerJoined {
            peer_id: peer.peer_id.clone(),
            is_host: peer.is_host,
            peer_count: room.peer_count() + 1,
        });
        for existing_peer in room.peers() {
            existing_peer.enqueue(join_msg.clone());
        }

        let addr = peer.source_address;
        room.insert(peer);
        room.touch();

        *state.ip_connections.entry(addr).or_insert(0) += 1;
        state.total_connections += 1;

        info!(room = %code, peers = room.peer_count(), "peer added to room");
        Ok(existing)
    }

    /// Remove a peer from its room, notifying survivors. Closes the room if
    /// it becomes empty.
    pub fn remove_peer(&self, code: &RoomCode, peer_id: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(room) = state.rooms.get_mut(code) else {
            return;
        };
        let Some(removed) = room.remove(peer_id) else {
            return;
        };

        decrement_ip_connection(&mut state.ip_connections, removed.source_address);

        let room = state.rooms.get_mut(code).expect("still present");
        let leave_msg = OutboundFrame::Server(ServerMessage::PeerLeft {
            peer_id: peer_id.to_string(),
            peer_count: room.peer_count(),
        });
        for remaining in room.peers() {
            remaining.enqueue(leave_msg.clone());
        }

        let now_empty = room.is_empty();
        info!(room = %code, peer = %peer_id, "peer removed from room");
        if now_empty {
            state.rooms.remove(code);
            debug!(room = %code, "room closed (empty)");
        }
    }

    /// §4.D `CheckIpLimit`.
    pub fn check_ip_limit(&self, addr: IpAddr) -> bool {
        let state = self.state.lock().unwrap();
        state.ip_connections.get(&addr).copied().unwrap_or(0) < MAX_CONNECTIONS_PER_IP
    }

    /// §4.D `CheckRateLimit`: succeeds iff enough time has passed since the
    /// peer's last accepted message, and records the new `lastMessageAt` /
    /// `messagesSent` on success.
    pub fn check_rate_limit(&self, code: &RoomCode, peer_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(room) = state.rooms.get_mut(code) else {
            return false;
        };
        let Some(peer) = room.peer_mut(peer_id) else {
            return false;
        };
        if peer.last_message_at.elapsed() < MIN_MESSAGE_INTERVAL {
            return false;
        }
        peer.last_message_at = Instant::now();
        peer.messages_sent += 1;
        true
    }

    /// §4.E the message relay: update activity/counters, stamp `senderId`,
    /// fan out (respecting an optional `targetId`), and sample latency.
    pub fn relay(&self, code: &RoomCode, sender_id: &str, message: InboundMessage) {
        let start = Instant::now();
        let mut state = self.state.lock().unwrap();
        let Some(room) = state.rooms.get_mut(code) else {
            warn!(room = %code, "relay attempted against a vanished room");
            return;
        };

        room.touch();
        room.message_count += 1;
        state.total_messages += 1;

        let target = message.target_id().map(str::to_string);
        let stamped = message.stamped(sender_id);

        for peer in room.peers_except(sender_id) {
            if let Some(target) = &target {
                if peer.peer_id != *target {
                    continue;
                }
            }
            peer.enqueue(OutboundFrame::Relayed(stamped.clone()));
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        state.record_latency(elapsed_ms);
    }

    /// `GET /api/stats`.
    pub fn stats(&self) -> Stats {
        let state = self.state.lock().unwrap();
        let avg_latency_ms = if state.latency_samples_ms.is_empty() {
            0.0
        } else {
            state.latency_samples_ms.iter().sum::<u64>() as f64
                / state.latency_samples_ms.len() as f64
        };
        Stats {
            active_rooms: state.rooms.len(),
            total_connections: state.total_connections,
            total_messages: state.total_messages,
            avg_latency_ms,
        }
    }

    /// Sweep and close every expired room. Run on [`JANITOR_INTERVAL`].
    fn sweep_expired(&self) -> usize {
        let expired: Vec<RoomCode> = {
            let state = self.state.lock().unwrap();
            state
                .rooms
                .values()
                .filter(|room| room.is_expired())
                .map(|room| room.code.clone())
                .collect()
        };
        for code in &expired {
            self.close(code);
        }
        expired.len()
    }
}

/// Remove `count` by one for `addr`, saturating at zero and dropping the
/// entry entirely once it reaches zero (mirrors `check_ip_limit`'s
/// `unwrap_or(0)` read for an absent address).
fn decrement_ip_connection(ip_connections: &mut HashMap<IpAddr, usize>, addr: IpAddr) {
    if let Some(count) = ip_connections.get_mut(&addr) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            ip_connections.remove(&addr);
        }
    }
}

/// Remove `code` from the map in place if its room is expired (lazy reap).
///
/// Also decrements `ip_connections` for every evicted peer — without this,
/// a reaped-but-never-removed peer's address would stay counted forever,
/// since its own `remove_peer` call (triggered by the cancellation below)
/// finds no room left to remove it from and returns early.
fn reap_if_expired(state: &mut RegistryState, code: &RoomCode) {
    if let Some(room) = state.rooms.get(code) {
        if room.is_expired() {
            if let Some(room) = state.rooms.remove(code) {
                for peer in room.peers() {
                    decrement_ip_connection(&mut state.ip_connections, peer.source_address);
                    peer.cancel_for_shutdown();
                }
            }
        }
    }
}

/// Spawn the idle-room janitor. Returns a handle whose abort cancels it
/// promptly (it never finishes its current sleep before exiting, since
/// aborting a task interrupts the `sleep` it's suspended in).
pub fn spawn_janitor(registry: std::sync::Arc<RoomRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(JANITOR_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let reaped = registry.sweep_expired();
            if reaped > 0 {
                info!(reaped, "room janitor swept expired rooms");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{OutboundReceiver, OutboundSender};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn channel() -> (OutboundSender, OutboundReceiver) {
        mpsc::channel(crate::room::OUTBOUND_QUEUE_DEPTH)
    }

    fn addr(n: u8) -> IpAddr {
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, n))
    }

    fn peer(id: &str, is_host: bool, address: IpAddr, sender: OutboundSender) -> Peer {
        Peer::new(id.into(), is_host, address, sender, CancellationToken::new())
    }

    #[test]
    fn create_never_returns_duplicate_active_codes() {
        let registry = RoomRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let code = registry.create().unwrap();
            assert!(seen.insert(code));
        }
    }

    #[test]
    fn add_peer_creates_room_for_host_and_rejects_guest_on_absent_room() {
        let registry = RoomRegistry::new();
        let code = RoomCode::parse("AB23CD").unwrap();
        let (tx, _rx) = channel();

        let err = registry
            .add_peer(&code, false, peer("guest", false, addr(1), tx))
            .unwrap_err();
        assert_eq!(err, RegistryError::NotFound);

        let (tx2, _rx2) = channel();
        let existing = registry
            .add_peer(&code, true, peer("host", true, addr(1), tx2))
            .unwrap();
        assert!(existing.is_empty());
        assert_eq!(registry.lookup_summary(&code).unwrap().peer_count, 1);
    }

    #[test]
    fn add_peer_notifies_existing_members_and_reports_full_room() {
        let registry = RoomRegistry::new();
        let code = RoomCode::parse("AB23CD").unwrap();

        let (host_tx, mut host_rx) = channel();
        registry
            .add_peer(&code, true, peer("host", true, addr(1), host_tx))
            .unwrap();

        let (guest_tx, _guest_rx) = channel();
        let existing = registry
            .add_peer(&code, false, peer("guest", false, addr(2), guest_tx))
            .unwrap();
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0], "host");

        match host_rx.try_recv().unwrap() {
            OutboundFrame::Server(ServerMessage::PeerJoined { peer_id, .. }) => {
                assert_eq!(peer_id, "guest");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let (third_tx, _third_rx) = channel();
        let err = registry
            .add_peer(&code, false, peer("third", false, addr(3), third_tx))
            .unwrap_err();
        assert_eq!(err, RegistryError::Full);
    }

    #[test]
    fn remove_peer_notifies_survivor_and_closes_empty_room() {
        let registry = RoomRegistry::new();
        let code = RoomCode::parse("AB23CD").unwrap();

        let (host_tx, _host_rx) = channel();
        registry
            .add_peer(&code, true, peer("host", true, addr(1), host_tx))
            .unwrap();
        let (guest_tx, mut guest_rx) = channel();
        registry
            .add_peer(&code, false, peer("guest", false, addr(2), guest_tx))
            .unwrap();
        let _ = guest_rx.try_recv(); // drain PeerJoined echo, if any

        registry.remove_peer(&code, "host");
        match guest_rx.try_recv().unwrap() {
            OutboundFrame::Server(ServerMessage::PeerLeft { peer_id, peer_count }) => {
                assert_eq!(peer_id, "host");
                assert_eq!(peer_count, 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        registry.remove_peer(&code, "guest");
        assert!(registry.lookup_summary(&code).is_none());
    }

    #[test]
    fn ip_connection_count_tracks_add_and_remove() {
        let registry = RoomRegistry::new();
        let code = RoomCode::parse("AB23CD").unwrap();
        let (tx, _rx) = channel();
        let a = addr(9);

        assert!(registry.check_ip_limit(a));
        registry
            .add_peer(&code, true, peer("host", true, a, tx))
            .unwrap();

        registry.remove_peer(&code, "host");
        assert!(registry.check_ip_limit(a));
    }

    #[test]
    fn rate_limit_rejects_bursts_then_recovers() {
        let registry = RoomRegistry::new();
        let code = RoomCode::parse("AB23CD").unwrap();
        let (tx, _rx) = channel();
        registry
            .add_peer(&code, true, peer("host", true, addr(1), tx))
            .unwrap();

        assert!(registry.check_rate_limit(&code, "host"));
        assert!(!registry.check_rate_limit(&code, "host"));
        std::thread::sleep(MIN_MESSAGE_INTERVAL + Duration::from_millis(2));
        assert!(registry.check_rate_limit(&code, "host"));
    }

    #[test]
    fn relay_respects_target_id_and_stamps_sender() {
        let registry = RoomRegistry::new();
        let code = RoomCode::parse("AB23CD").unwrap();

        let (host_tx, mut host_rx) = channel();
        registry
            .add_peer(&code, true, peer("host", true, addr(1), host_tx))
            .unwrap();
        let (guest_tx, _guest_rx) = channel();
        registry
            .add_peer(&code, false, peer("guest", false, addr(2), guest_tx))
            .unwrap();
        let _ = host_rx.try_recv(); // drain PeerJoined

        let inbound =
            InboundMessage::parse(br#"{"type":"offer","targetId":"host","sdp":"x"}"#).unwrap();
        registry.relay(&code, "guest", inbound);

        match host_rx.try_recv().unwrap() {
            OutboundFrame::Relayed(value) => {
                assert_eq!(value["senderId"], "guest");
                assert_eq!(value["sdp"], "x");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn stats_reports_active_rooms_and_average_latency() {
        let registry = RoomRegistry::new();
        let code = RoomCode::parse("AB23CD").unwrap();
        let (tx, _rx) = channel();
        registry
            .add_peer(&code, true, peer("host", true, addr(1), tx))
            .unwrap();

        let (guest_tx, _guest_rx) = channel();
        registry
            .add_peer(&code, false, peer("guest", false, addr(2), guest_tx))
            .unwrap();
        registry.relay(
            &code,
            "guest",
            InboundMessage::parse(br#"{"type":"ping"}"#).unwrap(),
        );

        let stats = registry.stats();
        assert_eq!(stats.active_rooms, 1);
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.total_messages, 1);
    }

    #[test]
    fn close_decrements_ip_connections_for_every_evicted_peer() {
        let registry = RoomRegistry::new();
        let code = RoomCode::parse("AB23CD").unwrap();
        let a1 = addr(1);
        let a2 = addr(2);

        let (tx1, _rx1) = channel();
        registry
            .add_peer(&code, true, peer("host", true, a1, tx1))
            .unwrap();
        let (tx2, _rx2) = channel();
        registry
            .add_peer(&code, false, peer("guest", false, a2, tx2))
            .unwrap();

        registry.close(&code);

        let state = registry.state.lock().unwrap();
        assert!(
            state.ip_connections.is_empty(),
            "ip_connections must be fully drained once every peer's room is closed"
        );
    }

    #[test]
    fn lazy_reap_of_expired_room_decrements_ip_connections() {
        let registry = RoomRegistry::new();
        let code = RoomCode::parse("AB23CD").unwrap();
        let a = addr(3);
        let (tx, _rx) = channel();
        registry
            .add_peer(&code, true, peer("host", true, a, tx))
            .unwrap();

        {
            let mut state = registry.state.lock().unwrap();
            let room = state.rooms.get_mut(&code).unwrap();
            room.last_activity = Instant::now() - crate::room::ROOM_TIMEOUT - Duration::from_secs(1);
        }

        assert!(registry.lookup_summary(&code).is_none());
        let state = registry.state.lock().unwrap();
        assert!(state.ip_connections.is_empty());
    }

    #[test]
    fn janitor_sweep_reaps_expired_rooms_and_drains_ip_connections() {
        let registry = RoomRegistry::new();
        let code = RoomCode::parse("AB23CD").unwrap();
        let a = addr(4);
        let (tx, _rx) = channel();
        registry
            .add_peer(&code, true, peer("host", true, a, tx))
            .unwrap();

        {
            let mut state = registry.state.lock().unwrap();
            let room = state.rooms.get_mut(&code).unwrap();
            room.last_activity = Instant::now() - crate::room::ROOM_TIMEOUT - Duration::from_secs(1);
        }

        let reaped = registry.sweep_expired();
        assert_eq!(reaped, 1);
        assert!(registry.lookup_summary(&code).is_none());

        let state = registry.state.lock().unwrap();
        assert!(state.ip_connections.is_empty());
    }
}
