use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rendered in place of the body of a soft-deleted message.
pub const TOMBSTONE_TEXT: &str = "This message was deleted";

// -- Identifiers --

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Opaque room identifier, assigned by the remote store on creation.
    RoomId
);
string_id!(UserId);
string_id!(
    /// Client-generated message identifier. Stable across retries so the
    /// transport can recognise a resend as a duplicate.
    MessageId
);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// The local user as seen on outgoing messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: UserId,
    pub display_name: String,
}

// -- Rooms --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub text: String,
    pub author_id: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    /// Filled from the document id when the stored body does not carry it.
    #[serde(default)]
    pub id: RoomId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub participants: BTreeSet<UserId>,
    pub creator_id: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announcement: Option<Announcement>,
}

impl Room {
    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participants.contains(user_id)
    }

    /// Time used to rank the room list: last activity, or creation for a
    /// room nobody has written to yet.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }
}

// -- Messages --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    /// Position within the owning message.
    pub index: u32,
    pub thumbnail: String,
    pub original: String,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    /// Hex SHA-256 of the original bytes.
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perceptual_hash: Option<String>,
    /// Videos only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub message_id: MessageId,
    pub sender_name: String,
    pub snippet: String,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Absent on legacy records written before sequence numbers existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
    #[serde(default)]
    pub deleted: bool,
    /// Client-local delivery failure marker. Never serialized.
    #[serde(skip)]
    pub failed: bool,
}

impl Message {
    /// A fresh outgoing text message from `author`.
    pub fn text(room_id: RoomId, author: &Author, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            room_id,
            sender_id: author.id.clone(),
            sender_name: author.display_name.clone(),
            text: Some(text.into()),
            seq: None,
            sent_at: Utc::now(),
            attachments: Vec::new(),
            reply_to: None,
            deleted: false,
            failed: false,
        }
    }

    pub fn with_reply(mut self, original: &Message) -> Self {
        self.reply_to = Some(ReplyPreview {
            message_id: original.id.clone(),
            sender_name: original.sender_name.clone(),
            snippet: original.preview_text().chars().take(80).collect(),
            deleted: original.deleted,
        });
        self
    }

    /// Same id and content, flagged as undelivered.
    pub fn failed_copy(&self) -> Self {
        Self {
            failed: true,
            ..self.clone()
        }
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Body as shown in a bubble; soft-deleted messages show the tombstone.
    pub fn display_text(&self) -> &str {
        if self.deleted {
            return TOMBSTONE_TEXT;
        }
        self.text.as_deref().unwrap_or_default()
    }

    /// Short text used for the room list's last-message column.
    pub fn preview_text(&self) -> String {
        if self.deleted {
            return TOMBSTONE_TEXT.to_string();
        }
        match (&self.text, self.attachments.first()) {
            (Some(text), _) if !text.is_empty() => text.clone(),
            (_, Some(att)) if att.kind == AttachmentKind::Video => "[video]".to_string(),
            (_, Some(_)) => "[image]".to_string(),
            _ => String::new(),
        }
    }
}
