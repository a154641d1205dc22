//! Wire protocol frame types
//!
//! JSON-shaped events exchanged with the message relay over the duplex
//! channel. Frames are tagged with a `type` field whose value is the event
//! name (`auth:response`, `heartbeat:ping`, `message:send`, ...), encoded as
//! websocket text messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::{CustomStatus, PresenceStatus, Visibility};
use crate::sync::SyncCheckpoint;

/// User id as known to the relay
pub type UserId = String;

/// Conversation room id
pub type RoomId = String;

/// Relay-assigned message id
pub type ServerMessageId = String;

/// A (user, timestamp) pair inside a diff entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecipientStamp {
    pub user_id: UserId,
    pub at: DateTime<Utc>,
}

/// One message's server-side truth inside an incremental diff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiffMessage {
    pub server_message_id: ServerMessageId,
    /// Present when the message originated from this client
    #[serde(default)]
    pub client_message_id: Option<Uuid>,
    pub room_id: RoomId,
    pub sender_id: UserId,
    /// Server-authoritative content; wins over any local unacknowledged copy
    #[serde(default)]
    pub content: Option<String>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_to: Vec<RecipientStamp>,
    #[serde(default)]
    pub read_by: Vec<RecipientStamp>,
}

/// One page of an incremental diff for a room
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncDiffBatch {
    pub room_id: RoomId,
    pub messages: Vec<DiffMessage>,
    /// More pages pending for this room beyond the batch bound
    pub has_more: bool,
}

/// Frames sent to the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    #[serde(rename = "auth:response")]
    AuthResponse { nonce: String, token: String },

    #[serde(rename = "heartbeat:ping")]
    HeartbeatPing { seq: u64, sent_at: DateTime<Utc> },

    #[serde(rename = "presence:update")]
    PresenceUpdate {
        user_id: UserId,
        status: PresenceStatus,
        #[serde(default)]
        custom_status: Option<CustomStatus>,
        visibility: Visibility,
    },

    #[serde(rename = "typing:start")]
    TypingStart { room_id: RoomId, user_id: UserId },

    #[serde(rename = "typing:stop")]
    TypingStop { room_id: RoomId, user_id: UserId },

    #[serde(rename = "message:send")]
    MessageSend {
        client_message_id: Uuid,
        room_id: RoomId,
        sender_id: UserId,
        content: String,
        recipients: Vec<UserId>,
    },

    /// Batched read acknowledgment for messages this client has viewed
    #[serde(rename = "message:read_by")]
    ReadAck {
        room_id: RoomId,
        reader_id: UserId,
        server_message_ids: Vec<ServerMessageId>,
        at: DateTime<Utc>,
    },

    #[serde(rename = "sync:request")]
    SyncRequest {
        checkpoint: SyncCheckpoint,
        /// Max messages per room per page
        limit: u32,
        /// Server ids the client still tracks below Read; the relay includes
        /// their current status even when older than the checkpoint
        #[serde(default)]
        unresolved: Vec<ServerMessageId>,
    },
}

/// Frames received from the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    #[serde(rename = "auth:challenge")]
    AuthChallenge { nonce: String },

    #[serde(rename = "auth:ok")]
    AuthOk { session_id: String },

    #[serde(rename = "auth:failed")]
    AuthFailed { message: String },

    #[serde(rename = "heartbeat:pong")]
    HeartbeatPong {
        seq: u64,
        /// Echo of the ping's timestamp, for RTT measurement
        sent_at: DateTime<Utc>,
    },

    #[serde(rename = "presence:changed")]
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
        #[serde(default)]
        custom_status: Option<CustomStatus>,
        last_seen_at: DateTime<Utc>,
        visibility: Visibility,
    },

    #[serde(rename = "typing:start")]
    TypingStart {
        room_id: RoomId,
        user_id: UserId,
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
    },

    #[serde(rename = "typing:stop")]
    TypingStop { room_id: RoomId, user_id: UserId },

    #[serde(rename = "message:sent_ack")]
    MessageSentAck {
        client_message_id: Uuid,
        server_message_id: ServerMessageId,
        at: DateTime<Utc>,
    },

    #[serde(rename = "message:delivered")]
    MessageDelivered {
        server_message_id: ServerMessageId,
        recipient_id: UserId,
        at: DateTime<Utc>,
    },

    #[serde(rename = "message:read_by")]
    MessageReadBy {
        server_message_id: ServerMessageId,
        recipient_id: UserId,
        at: DateTime<Utc>,
    },

    #[serde(rename = "message:failed")]
    MessageFailed {
        client_message_id: Uuid,
        error: String,
        retryable: bool,
    },

    #[serde(rename = "sync:diff")]
    SyncDiff { batch: SyncDiffBatch },

    /// End of the diff stream for the current sync request
    #[serde(rename = "sync:complete")]
    SyncComplete { at: DateTime<Utc> },
}

impl ClientFrame {
    /// Encode frame to a JSON string for a websocket text message
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerFrame {
    /// Decode a frame from a websocket text message
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_tagging() {
        let frame = ClientFrame::TypingStart {
            room_id: "room-1".to_string(),
            user_id: "alice".to_string(),
        };
        let json = frame.encode().unwrap();
        assert!(json.contains(r#""type":"typing:start""#));
        assert!(json.contains(r#""roomId":"room-1""#));
    }

    #[test]
    fn test_message_send_roundtrip() {
        let frame = ClientFrame::MessageSend {
            client_message_id: Uuid::new_v4(),
            room_id: "room-1".to_string(),
            sender_id: "alice".to_string(),
            content: "ping".to_string(),
            recipients: vec!["bob".to_string(), "carol".to_string()],
        };
        let json = frame.encode().unwrap();
        let back: ClientFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_server_frame_decode() {
        let json = r#"{
            "type": "message:sent_ack",
            "clientMessageId": "6f2b27a4-8d3e-4f0a-9a2b-1c5d6e7f8a9b",
            "serverMessageId": "srv-42",
            "at": "2026-08-01T12:00:00Z"
        }"#;
        let frame = ServerFrame::decode(json).unwrap();
        match frame {
            ServerFrame::MessageSentAck {
                server_message_id, ..
            } => assert_eq!(server_message_id, "srv-42"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        assert!(ServerFrame::decode("{\"type\":\"message:sent_ack\"}").is_err());
        assert!(ServerFrame::decode("not json").is_err());
        assert!(ServerFrame::decode("{\"type\":\"unknown:event\"}").is_err());
    }

    #[test]
    fn test_diff_batch_optional_fields_default() {
        let json = r#"{
            "type": "sync:diff",
            "batch": {
                "roomId": "room-1",
                "hasMore": false,
                "messages": [{
                    "serverMessageId": "srv-1",
                    "roomId": "room-1",
                    "senderId": "alice",
                    "sentAt": "2026-08-01T12:00:00Z"
                }]
            }
        }"#;
        let frame = ServerFrame::decode(json).unwrap();
        match frame {
            ServerFrame::SyncDiff { batch } => {
                assert_eq!(batch.messages.len(), 1);
                assert!(batch.messages[0].client_message_id.is_none());
                assert!(batch.messages[0].delivered_to.is_empty());
                assert!(!batch.has_more);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_read_ack_wire_name() {
        let frame = ClientFrame::ReadAck {
            room_id: "r".to_string(),
            reader_id: "alice".to_string(),
            server_message_ids: vec!["srv-1".to_string()],
            at: Utc::now(),
        };
        let json = frame.encode().unwrap();
        assert!(json.contains(r#""type":"message:read_by""#));
    }
}
