use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Attachment, AttachmentKind, Message, MessageId, RoomId, UserId};

// -- Event names on the realtime connection --

/// Client -> server: join a room's broadcast group.
pub const JOIN_ROOM: &str = "join_room";
/// Client -> server: leave a room's broadcast group.
pub const LEAVE_ROOM: &str = "leave_room";
/// Client -> server: text message, acknowledged.
pub const SEND_MESSAGE: &str = "send_message";
/// Client -> server: attachment metadata for already-uploaded media, acknowledged.
pub const SEND_ATTACHMENTS: &str = "send_attachments";
/// Emitted locally by the connection provider when the transport drops.
pub const DISCONNECT: &str = "disconnect";

/// Server -> client events that carry a room message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomEventKind {
    ChatMessage,
    ImageBroadcast,
    VideoBroadcast,
}

impl RoomEventKind {
    pub const ALL: [RoomEventKind; 3] = [
        RoomEventKind::ChatMessage,
        RoomEventKind::ImageBroadcast,
        RoomEventKind::VideoBroadcast,
    ];

    pub fn event_name(self) -> &'static str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::ImageBroadcast => "image_broadcast",
            Self::VideoBroadcast => "video_broadcast",
        }
    }

    /// Attachment kind assumed for a broadcast that does not state one.
    pub fn default_attachment_kind(self) -> Option<AttachmentKind> {
        match self {
            Self::ChatMessage => None,
            Self::ImageBroadcast => Some(AttachmentKind::Image),
            Self::VideoBroadcast => Some(AttachmentKind::Video),
        }
    }
}

// -- Payloads --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    pub room_id: RoomId,
}

/// Metadata for one attachment that was persisted out-of-band.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub index: u32,
    pub thumbnail_path: String,
    pub original_path: String,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl From<&Attachment> for AttachmentMeta {
    fn from(att: &Attachment) -> Self {
        Self {
            kind: att.kind,
            index: att.index,
            thumbnail_path: att.thumbnail.clone(),
            original_path: att.original.clone(),
            width: att.width,
            height: att.height,
            byte_size: att.byte_size,
            content_hash: att.content_hash.clone(),
            duration_ms: att.duration_ms,
        }
    }
}

/// Body of a `send_attachments` emit. Carries no binary data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentsPayload {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub sent_at: DateTime<Utc>,
    pub attachments: Vec<AttachmentMeta>,
}

impl From<&Message> for AttachmentsPayload {
    fn from(msg: &Message) -> Self {
        Self {
            message_id: msg.id.clone(),
            room_id: msg.room_id.clone(),
            sender_id: msg.sender_id.clone(),
            sender_name: msg.sender_name.clone(),
            text: msg.text.clone(),
            sent_at: msg.sent_at,
            attachments: msg.attachments.iter().map(AttachmentMeta::from).collect(),
        }
    }
}

/// Server acknowledgment for `send_message` / `send_attachments`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default, alias = "success")]
    pub ok: bool,
    /// The server already accepted a message with this id.
    #[serde(default, alias = "isDuplicate")]
    pub duplicate: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Sequence number assigned on acceptance, when the server reports it.
    #[serde(default)]
    pub seq: Option<i64>,
}

impl Ack {
    /// A duplicate is as good as a fresh acceptance.
    pub fn is_accepted(&self) -> bool {
        self.ok || self.duplicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ack_counts_as_accepted() {
        let ack: Ack = serde_json::from_value(serde_json::json!({ "duplicate": true })).unwrap();
        assert!(ack.is_accepted());

        let ack: Ack = serde_json::from_value(serde_json::json!({ "success": true, "seq": 7 })).unwrap();
        assert!(ack.is_accepted());
        assert_eq!(ack.seq, Some(7));

        let ack: Ack = serde_json::from_value(serde_json::json!({ "error": "rate limited" })).unwrap();
        assert!(!ack.is_accepted());
    }

    #[test]
    fn event_names_are_distinct() {
        let names: std::collections::HashSet<_> =
            RoomEventKind::ALL.iter().map(|k| k.event_name()).collect();
        assert_eq!(names.len(), 3);
    }
}
