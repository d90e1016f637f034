//! Wire types for the rendezvous WebSocket protocol.
//!
//! Server -> peer frames are a closed set ([`ServerMessage`]); peer -> server
//! frames are opaque JSON objects the server never fully parses beyond the
//! optional `targetId` field used for targeted delivery (see
//! [`InboundMessage`]). The server stamps `senderId` on the way out and
//! otherwise never looks at the payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A room code: uppercase, fixed length, drawn from a restricted alphabet.
///
/// Case-insensitive on input; canonical form is uppercase. Validation keeps
/// invalid codes from ever reaching the [`crate::registry::RoomRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RoomCode(String);

/// Symbols allowed in a room code: uppercase letters and digits, excluding
/// characters that are easy to confuse with each other (0/O, 1/I/L).
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Fixed length of a generated room code.
pub const ROOM_CODE_LENGTH: usize = 6;

impl RoomCode {
    /// Canonicalize and validate a client-supplied room code.
    ///
    /// Accepts any case on input; rejects anything that isn't exactly
    /// [`ROOM_CODE_LENGTH`] symbols from [`ROOM_CODE_ALPHABET`] once
    /// uppercased.
    pub fn parse(raw: &str) -> Option<Self> {
        let upper = raw.to_ascii_uppercase();
        if upper.len() != ROOM_CODE_LENGTH {
            return None;
        }
        if !upper.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b)) {
            return None;
        }
        Some(Self(upper))
    }

    /// Build a `RoomCode` from symbols already known to be valid (the code
    /// generator draws only from [`ROOM_CODE_ALPHABET`]).
    pub(crate) fn from_valid(s: String) -> Self {
        debug_assert!(Self::parse(&s).is_some());
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Public, client-facing peer id within a room.
pub type PeerId = String;

/// A peer->server frame.
///
/// Deliberately not a closed enum: the server relays the object verbatim to
/// its target(s) and only interprets `targetId`. Kept as a JSON object
/// (rather than `serde_json::Value`) so relaying can mutate it in place to
/// stamp `senderId` without re-serializing the rest of the payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct InboundMessage(Map<String, Value>);

impl InboundMessage {
    /// Parse a raw WebSocket frame body (text or binary, both UTF-8 JSON).
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// The optional `targetId` field used for targeted delivery.
    pub fn target_id(&self) -> Option<&str> {
        self.0.get("targetId").and_then(Value::as_str)
    }

    /// Stamp `senderId` (overwriting any client-supplied value) and return
    /// the outbound JSON object.
    pub fn stamped(mut self, sender_id: &str) -> Value {
        self.0
            .insert("senderId".to_string(), Value::String(sender_id.to_string()));
        Value::Object(self.0)
    }
}

/// Server -> peer frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Sent to a peer immediately after it successfully joins a room.
    ///
    /// `peers` is the bare set of prior member ids (§4.D: "a room-joined
    /// acknowledgement to the new peer carrying the full set of prior
    /// member ids"), not a richer per-peer summary.
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_code: RoomCode,
        peer_id: PeerId,
        is_host: bool,
        peer_count: usize,
        peers: Vec<PeerId>,
    },
    /// Broadcast to existing members when a new peer joins.
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        peer_id: PeerId,
        is_host: bool,
        peer_count: usize,
    },
    /// Broadcast to surviving members when a peer leaves.
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId, peer_count: usize },
    /// An in-band error; the connection is not necessarily closed.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_code_parse_canonicalizes_case() {
        let code = RoomCode::parse("ab23cd").unwrap();
        assert_eq!(code.as_str(), "AB23CD");
    }

    #[test]
    fn room_code_parse_rejects_bad_length() {
        assert!(RoomCode::parse("AB23C").is_none());
        assert!(RoomCode::parse("AB23CDE").is_none());
    }

    #[test]
    fn room_code_parse_rejects_excluded_symbols() {
        // '0', '1', 'I', 'O' are not in the alphabet.
        assert!(RoomCode::parse("AB01CD").is_none());
        assert!(RoomCode::parse("ABOICD").is_none());
    }

    #[test]
    fn inbound_message_round_trips_target_id() {
        let msg =
            InboundMessage::parse(br#"{"type":"offer","targetId":"p1","sdp":"..."}"#).unwrap();
        assert_eq!(msg.target_id(), Some("p1"));

        let stamped = msg.stamped("p2");
        assert_eq!(stamped["senderId"], "p2");
        assert_eq!(stamped["targetId"], "p1");
        assert_eq!(stamped["sdp"], "...");
    }

    #[test]
    fn inbound_message_stamp_overwrites_client_supplied_sender_id() {
        let msg = InboundMessage::parse(br#"{"senderId":"forged"}"#).unwrap();
        let stamped = msg.stamped("real-sender");
        assert_eq!(stamped["senderId"], "real-sender");
    }

    #[test]
    fn server_message_serializes_kebab_case_tag() {
        let msg = ServerMessage::PeerLeft {
            peer_id: "abc".into(),
            peer_count: 1,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"peer-left""#));
        assert!(json.contains(r#""peerId":"abc""#));
    }
}
