//! Wire Protocol
//!
//! Defines the framed event format exchanged between client and server.
//! Events are length-prefixed JSON; call signaling payloads are opaque to
//! the server beyond their routing metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Signaling frames are small JSON documents; cap them well below anything
/// a misbehaving client could use to exhaust memory.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Events sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinSession {
        session_id: String,
        username: String,
        /// Stable identity from a previous join, carried across reconnects.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
    },
    LeaveSession,
    SendMessage {
        session_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        #[serde(default)]
        is_private: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user: Option<String>,
    },
    TypingStart {
        session_id: String,
        username: String,
    },
    TypingStop {
        session_id: String,
        username: String,
    },
    CallSignal(CallSignal),
}

/// Events sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionJoined {
        success: bool,
        session_id: Option<String>,
        participant_id: Option<String>,
        error: Option<String>,
    },
    UsersList {
        session_id: String,
        users: Vec<ParticipantInfo>,
    },
    MessageHistory {
        session_id: String,
        messages: Vec<ChatMessage>,
    },
    UserJoined {
        session_id: String,
        username: String,
        participant_id: String,
    },
    UserLeft {
        session_id: String,
        username: String,
    },
    UserCountUpdate {
        session_id: String,
        count: usize,
    },
    ReceiveMessage(ChatMessage),
    UserTyping {
        session_id: String,
        username: String,
        is_typing: bool,
    },
    DeliveryFailed {
        message_id: String,
        target_user: String,
        reason: String,
    },
    CallSignal(CallSignal),
    SignalError {
        kind: SignalKind,
        reason: String,
    },
    Error {
        message: String,
    },
}

/// A chat message as stored in the session log and fanned out to clients.
///
/// The content blob is opaque to the server; clients may encode it however
/// they like. Only the `Sent` status is driven server-side, the rest is
/// client-local optimism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender_conn: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user: Option<String>,
}

impl ChatMessage {
    /// Visibility rule: a private message is readable only by its sender
    /// and its named target; everything else is readable by anyone in the
    /// session, including future joiners replaying history.
    pub fn visible_to(&self, username: &str) -> bool {
        if !self.is_private {
            return true;
        }
        self.sender_name == username || self.target_user.as_deref() == Some(username)
    }
}

/// Message delivery lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
}

/// Participant presence status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Away,
    Offline,
}

/// Information about a session participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub participant_id: String,
    pub username: String,
    pub presence: Presence,
    pub is_typing: bool,
}

/// Call signaling envelope, relayed without interpreting the payload.
///
/// Routing uses only `session_id`, `caller_name` and `target_user`; the
/// payload carries whatever the peers need (SDP, ICE candidates, media
/// flags) and never reaches core logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSignal {
    pub kind: SignalKind,
    pub session_id: String,
    pub caller_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Live connection id of the sender, stamped by the server on relay so
    /// follow-up envelopes can be addressed directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_conn: Option<String>,
}

/// Call signaling envelope kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    CallRequest,
    CallOffer,
    CallAnswer,
    IceCandidate,
    CallEnd,
    StreamState,
    CallStateRequest,
    CallStateResponse,
}

impl SignalKind {
    /// Kinds that must address a specific peer rather than the whole session.
    pub fn requires_target(self) -> bool {
        matches!(
            self,
            SignalKind::CallOffer
                | SignalKind::CallAnswer
                | SignalKind::CallStateRequest
                | SignalKind::CallStateResponse
        )
    }
}

/// Deterministic signaling room for an unordered pair of display names.
///
/// Both sides compute the identical id without coordination: the names are
/// sorted lexicographically and joined, so the pairing survives either
/// party refreshing its connection.
pub fn pair_room_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}-{}", lo, hi)
}

fn frame(data: Vec<u8>) -> Vec<u8> {
    let len = (data.len() as u32).to_be_bytes();
    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len);
    framed.extend_from_slice(&data);
    framed
}

impl ClientEvent {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Create a framed event with length prefix (4 bytes, big-endian)
    pub fn to_framed(&self) -> Result<Vec<u8>, serde_json::Error> {
        Ok(frame(self.to_bytes()?))
    }
}

impl ServerEvent {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Create a framed event with length prefix (4 bytes, big-endian)
    pub fn to_framed(&self) -> Result<Vec<u8>, serde_json::Error> {
        Ok(frame(self.to_bytes()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_round_trip() {
        let event = ClientEvent::JoinSession {
            session_id: "ABC12345".to_string(),
            username: "alice".to_string(),
            participant_id: None,
        };
        let bytes = event.to_bytes().unwrap();
        let parsed = ClientEvent::from_bytes(&bytes).unwrap();

        if let ClientEvent::JoinSession {
            session_id,
            username,
            ..
        } = parsed
        {
            assert_eq!(session_id, "ABC12345");
            assert_eq!(username, "alice");
        } else {
            panic!("Wrong event type");
        }
    }

    #[test]
    fn test_framed_event() {
        let event = ClientEvent::LeaveSession;
        let framed = event.to_framed().unwrap();

        // Check length prefix
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]);
        assert_eq!(len as usize, framed.len() - 4);
    }

    #[test]
    fn test_call_signal_tagging() {
        let event = ClientEvent::CallSignal(CallSignal {
            kind: SignalKind::CallOffer,
            session_id: "ABC12345".to_string(),
            caller_name: "alice".to_string(),
            target_user: Some("bob".to_string()),
            payload: serde_json::json!({"sdp": "v=0"}),
            sender_conn: None,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "call_signal");
        assert_eq!(value["kind"], "call_offer");
        assert_eq!(value["target_user"], "bob");
    }

    #[test]
    fn test_pair_room_id_order_independent() {
        assert_eq!(pair_room_id("alice", "bob"), "alice-bob");
        assert_eq!(pair_room_id("bob", "alice"), "alice-bob");
        assert_eq!(pair_room_id("alice", "bob"), pair_room_id("bob", "alice"));
    }

    #[test]
    fn test_pair_room_id_same_name() {
        // Degenerate but deterministic: two tabs of the same user.
        assert_eq!(pair_room_id("alice", "alice"), "alice-alice");
    }

    #[test]
    fn test_private_message_visibility() {
        let msg = ChatMessage {
            id: "m1".to_string(),
            sender_conn: "c1".to_string(),
            sender_name: "alice".to_string(),
            content: "aGVsbG8=".to_string(),
            timestamp: Utc::now(),
            status: DeliveryStatus::Sent,
            reply_to: None,
            is_private: true,
            target_user: Some("bob".to_string()),
        };
        assert!(msg.visible_to("alice"));
        assert!(msg.visible_to("bob"));
        assert!(!msg.visible_to("carol"));
    }
}
