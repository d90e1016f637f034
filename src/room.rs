//! Room and peer state.
//!
//! A [`Room`] is a bounded set of at most [`MAX_PEERS_PER_ROOM`] peers plus an
//! activity clock. This module only models the data and its invariants;
//! membership changes, notification fan-out and the shared `rooms` map live
//! in [`crate::registry`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{PeerId, RoomCode, ServerMessage};

/// A room holds at most this many peers (one host, one guest).
pub const MAX_PEERS_PER_ROOM: usize = 2;

/// A room with no activity for longer than this is expired.
pub const ROOM_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Depth of a peer's outbound queue before it's considered stalled.
///
/// Fan-out to a peer whose queue is full does not block delivery to other
/// peers (see [`crate::registry::RoomRegistry`]); the overflowing send
/// instead reports [`SendOutcome::QueueFull`], and the caller cancels that
/// peer's [`CancellationToken`] so its connection tears itself down rather
/// than growing an unbounded backlog.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// A frame queued for delivery to a peer's WebSocket writer task: either a
/// server-originated notification or a relayed signaling payload stamped
/// with the sender's id.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Server(ServerMessage),
    Relayed(Value),
}

impl OutboundFrame {
    pub fn into_json(self) -> Value {
        match self {
            OutboundFrame::Server(msg) => {
                serde_json::to_value(msg).expect("ServerMessage always serializes")
            }
            OutboundFrame::Relayed(value) => value,
        }
    }
}

/// The sending half of a peer's outbound queue.
pub type OutboundSender = mpsc::Sender<OutboundFrame>;

/// The receiving half, held by that peer's dedicated writer task.
pub type OutboundReceiver = mpsc::Receiver<OutboundFrame>;

/// Result of attempting to enqueue a message to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The peer's outbound queue is full; it is considered stalled.
    QueueFull,
    /// The peer's writer task is gone; the connection is already dead.
    Closed,
}

/// Per-connection state for one peer.
///
/// A `Peer` exists only while its outbound channel is open and it is
/// present in exactly one [`Room`]'s membership map — that invariant is
/// maintained by [`crate::registry::RoomRegistry`], not by this type.
#[derive(Debug)]
pub struct Peer {
    pub peer_id: PeerId,
    pub is_host: bool,
    pub source_address: IpAddr,
    pub connected_at: Instant,
    pub messages_sent: u64,
    pub last_message_at: Instant,
    sender: OutboundSender,
    /// Cancelled when this peer's connection should tear itself down (e.g.
    /// its outbound queue overflowed). The connection's own receive loop
    /// observes this and runs the normal disconnect cleanup.
    cancel: CancellationToken,
}

impl Peer {
    pub fn new(
        peer_id: PeerId,
        is_host: bool,
        source_address: IpAddr,
        sender: OutboundSender,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            is_host,
            source_address,
            connected_at: now,
            messages_sent: 0,
            last_message_at: now,
            sender,
            cancel,
        }
    }

    /// Enqueue a frame for this peer's writer task.
    ///
    /// Never blocks: a full queue and a closed queue are both reported to
    /// the caller rather than awaited, so that fan-out to other peers is
    /// never held up by one stalled peer. A full queue also cancels the
    /// peer's connection.
    pub fn enqueue(&self, frame: OutboundFrame) -> SendOutcome {
        match self.sender.try_send(frame) {
            Ok(()) => SendOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.cancel.cancel();
                SendOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Cancel this peer's connection directly (room closed, expired, etc.),
    /// as opposed to [`Peer::enqueue`] cancelling it as a side effect of an
    /// overflowing queue.
    pub fn cancel_for_shutdown(&self) {
        self.cancel.cancel();
    }
}

/// A rendezvous room: up to [`MAX_PEERS_PER_ROOM`] peers plus an activity
/// clock.
///
/// Invariants: `peers.len() <= MAX_PEERS_PER_ROOM`; at most one peer has
/// `is_host == true`. Both are maintained by the registry, which is the only
/// writer of a room's peer map.
#[derive(Debug)]
pub struct Room {
    pub code: RoomCode,
    peers: HashMap<PeerId, Peer>,
    /// Wall-clock creation time, surfaced to REST clients (`GET
    /// /api/rooms/{code}`); internal expiry logic uses `last_activity`
    /// (an [`Instant`]) instead, to stay immune to clock adjustments.
    pub created_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub message_count: u64,
}

impl Room {
    pub fn new(code: RoomCode) -> Self {
        Self {
            code,
            peers: HashMap::with_capacity(MAX_PEERS_PER_ROOM),
            created_at: Utc::now(),
            last_activity: Instant::now(),
            message_count: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_expired(&self) -> bool {
        self.last_activity.elapsed() > ROOM_TIMEOUT
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= MAX_PEERS_PER_ROOM
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn has_host(&self) -> bool {
        self.peers.values().any(|p| p.is_host)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn peer_mut(&mut self, peer_id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Peers other than `peer_id`, for fan-out.
    pub fn peers_except<'a>(&'a self, peer_id: &'a str) -> impl Iterator<Item = &'a Peer> {
        self.peers.values().filter(move |p| p.peer_id != peer_id)
    }

    /// Insert a peer. Caller must have already checked [`Room::is_full`].
    pub fn insert(&mut self, peer: Peer) {
        self.peers.insert(peer.peer_id.clone(), peer);
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<Peer> {
        self.peers.remove(peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sender() -> (OutboundSender, OutboundReceiver) {
        mpsc::channel(OUTBOUND_QUEUE_DEPTH)
    }

    fn addr() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn peer(id: &str, is_host: bool, sender: OutboundSender) -> Peer {
        Peer::new(id.into(), is_host, addr(), sender, CancellationToken::new())
    }

    #[test]
    fn room_starts_empty_and_not_full() {
        let room = Room::new(RoomCode::parse("AB23CD").unwrap());
        assert!(room.is_empty());
        assert!(!room.is_full());
        assert!(!room.has_host());
    }

    #[test]
    fn room_becomes_full_at_max_peers() {
        let mut room = Room::new(RoomCode::parse("AB23CD").unwrap());
        let (tx1, _rx1) = make_sender();
        let (tx2, _rx2) = make_sender();
        room.insert(peer("p1", true, tx1));
        assert!(!room.is_full());
        room.insert(peer("p2", false, tx2));
        assert!(room.is_full());
        assert_eq!(room.peer_count(), MAX_PEERS_PER_ROOM);
    }

    #[test]
    fn has_host_reflects_membership() {
        let mut room = Room::new(RoomCode::parse("AB23CD").unwrap());
        let (tx, _rx) = make_sender();
        assert!(!room.has_host());
        room.insert(peer("guest", false, tx));
        assert!(!room.has_host());
    }

    #[test]
    fn peers_except_excludes_sender() {
        let mut room = Room::new(RoomCode::parse("AB23CD").unwrap());
        let (tx1, _rx1) = make_sender();
        let (tx2, _rx2) = make_sender();
        room.insert(peer("p1", true, tx1));
        room.insert(peer("p2", false, tx2));

        let others: Vec<_> = room.peers_except("p1").map(|p| p.peer_id.clone()).collect();
        assert_eq!(others, vec!["p2".to_string()]);
    }

    #[test]
    fn enqueue_reports_queue_full_and_cancels_peer() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let p = Peer::new("p1".into(), true, addr(), tx, cancel.clone());

        assert_eq!(
            p.enqueue(OutboundFrame::Server(ServerMessage::Error {
                message: "1".into()
            })),
            SendOutcome::Delivered
        );
        assert!(!cancel.is_cancelled());
        assert_eq!(
            p.enqueue(OutboundFrame::Server(ServerMessage::Error {
                message: "2".into()
            })),
            SendOutcome::QueueFull
        );
        assert!(cancel.is_cancelled());

        rx.close();
        let _ = rx.try_recv();
        assert_eq!(
            p.enqueue(OutboundFrame::Server(ServerMessage::Error {
                message: "3".into()
            })),
            SendOutcome::Closed
        );
    }

    #[test]
    fn is_expired_false_for_fresh_room() {
        let room = Room::new(RoomCode::parse("AB23CD").unwrap());
        assert!(!room.is_expired());
    }

    #[test]
    fn is_expired_true_once_timeout_has_elapsed() {
        let mut room = Room::new(RoomCode::parse("AB23CD").unwrap());
        room.last_activity = Instant::now() - ROOM_TIMEOUT - Duration::from_secs(1);
        assert!(room.is_expired());
    }
}
