//! Loosely-typed realtime payloads -> canonical [`Message`].
//!
//! Different server and client generations spell the same fields
//! differently. Every accepted spelling is listed in the `*_KEYS` tables
//! below; the first key present wins.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::events::RoomEventKind;
use crate::models::{Attachment, AttachmentKind, Message, MessageId, ReplyPreview, RoomId, UserId};

pub const ID_KEYS: &[&str] = &["id", "messageId", "message_id", "msgId", "_id"];
pub const ROOM_KEYS: &[&str] = &["roomId", "room_id", "roomID", "room"];
pub const SENDER_ID_KEYS: &[&str] = &["senderId", "sender_id", "senderID", "userId", "user_id", "uid"];
pub const SENDER_NAME_KEYS: &[&str] = &[
    "senderNickname",
    "sender_nickname",
    "senderNickName",
    "senderName",
    "sender_name",
    "nickname",
    "nickName",
    "username",
];
pub const TEXT_KEYS: &[&str] = &["text", "message", "body", "content"];
pub const SEQ_KEYS: &[&str] = &["seq", "sequence", "seqNo", "sequenceNumber"];
pub const SENT_AT_KEYS: &[&str] = &["sentAt", "sent_at", "timestamp", "createdAt", "created_at"];
pub const ATTACHMENTS_KEYS: &[&str] = &["attachments", "media"];
pub const REPLY_KEYS: &[&str] = &["replyTo", "reply_to", "reply"];
pub const DELETED_KEYS: &[&str] = &["deleted", "isDeleted", "is_deleted"];

const KIND_KEYS: &[&str] = &["type", "kind", "mediaType"];
const INDEX_KEYS: &[&str] = &["index", "position", "order"];
const THUMBNAIL_KEYS: &[&str] = &["thumbnail", "thumbnailUrl", "thumbnail_url", "thumbUrl", "thumbnailPath"];
const ORIGINAL_KEYS: &[&str] = &["original", "originalUrl", "original_url", "url", "originalPath", "path"];
const WIDTH_KEYS: &[&str] = &["width", "w"];
const HEIGHT_KEYS: &[&str] = &["height", "h"];
const SIZE_KEYS: &[&str] = &["byteSize", "byte_size", "size", "fileSize"];
const HASH_KEYS: &[&str] = &["contentHash", "content_hash", "hash", "sha256"];
const PHASH_KEYS: &[&str] = &["perceptualHash", "perceptual_hash", "phash"];
const DURATION_KEYS: &[&str] = &["durationMs", "duration_ms", "duration"];
const SNIPPET_KEYS: &[&str] = &["snippet", "text", "message"];

/// Timestamps below this are taken as seconds rather than milliseconds.
const SECONDS_CUTOFF: i64 = 100_000_000_000;

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("payload is not an object")]
    NotAnObject,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Normalize one payload received for `kind`.
///
/// Image and video broadcasts may carry a single flattened attachment at the
/// top level instead of an `attachments` array.
pub fn normalize_message(payload: &Value, kind: RoomEventKind) -> Result<Message, NormalizeError> {
    let map = payload.as_object().ok_or(NormalizeError::NotAnObject)?;

    let id = pick_string(map, ID_KEYS).ok_or(NormalizeError::MissingField("id"))?;
    let room_id = pick_string(map, ROOM_KEYS).ok_or(NormalizeError::MissingField("roomId"))?;
    let sender_id = pick_string(map, SENDER_ID_KEYS).ok_or(NormalizeError::MissingField("senderId"))?;
    let sender_name = pick_string(map, SENDER_NAME_KEYS).unwrap_or_default();
    let text = pick_string(map, TEXT_KEYS);
    let seq = pick_i64(map, SEQ_KEYS);
    let sent_at = match pick(map, SENT_AT_KEYS) {
        Some(v) => parse_time(v).ok_or_else(|| NormalizeError::InvalidField {
            field: "sentAt",
            reason: format!("unparseable timestamp {}", v),
        })?,
        None => Utc::now(),
    };

    let attachments = match pick(map, ATTACHMENTS_KEYS).and_then(Value::as_array) {
        Some(items) => items
            .iter()
            .enumerate()
            .filter_map(|(position, item)| {
                item.as_object()
                    .and_then(|obj| normalize_attachment(obj, position as u32, kind.default_attachment_kind()))
            })
            .collect(),
        None => match kind.default_attachment_kind() {
            // Flattened single attachment
            Some(default_kind) => normalize_attachment(map, 0, Some(default_kind))
                .into_iter()
                .collect(),
            None => Vec::new(),
        },
    };

    let reply_to = pick(map, REPLY_KEYS)
        .and_then(Value::as_object)
        .and_then(normalize_reply);

    Ok(Message {
        id: MessageId(id),
        room_id: RoomId(room_id),
        sender_id: UserId(sender_id),
        sender_name,
        text,
        seq,
        sent_at,
        attachments,
        reply_to,
        deleted: pick_bool(map, DELETED_KEYS),
        failed: false,
    })
}

fn normalize_attachment(
    map: &Map<String, Value>,
    position: u32,
    default_kind: Option<AttachmentKind>,
) -> Option<Attachment> {
    let original = pick_string(map, ORIGINAL_KEYS)?;
    let kind = match pick(map, KIND_KEYS).and_then(Value::as_str) {
        Some(k) if k.eq_ignore_ascii_case("video") => AttachmentKind::Video,
        Some(k) if k.eq_ignore_ascii_case("image") => AttachmentKind::Image,
        _ => default_kind.unwrap_or(AttachmentKind::Image),
    };

    Some(Attachment {
        kind,
        index: pick_u32(map, INDEX_KEYS).unwrap_or(position),
        thumbnail: pick_string(map, THUMBNAIL_KEYS).unwrap_or_else(|| original.clone()),
        original,
        width: pick_u32(map, WIDTH_KEYS).unwrap_or(0),
        height: pick_u32(map, HEIGHT_KEYS).unwrap_or(0),
        byte_size: pick_u64(map, SIZE_KEYS).unwrap_or(0),
        content_hash: pick_string(map, HASH_KEYS).unwrap_or_default(),
        perceptual_hash: pick_string(map, PHASH_KEYS),
        duration_ms: match kind {
            AttachmentKind::Video => pick_u64(map, DURATION_KEYS),
            AttachmentKind::Image => None,
        },
    })
}

fn normalize_reply(map: &Map<String, Value>) -> Option<ReplyPreview> {
    Some(ReplyPreview {
        message_id: MessageId(pick_string(map, ID_KEYS)?),
        sender_name: pick_string(map, SENDER_NAME_KEYS).unwrap_or_default(),
        snippet: pick_string(map, SNIPPET_KEYS).unwrap_or_default(),
        deleted: pick_bool(map, DELETED_KEYS),
    })
}

fn pick<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .find(|v| !v.is_null())
}

fn pick_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match pick(map, keys)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn pick_i64(map: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    match pick(map, keys)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Out-of-range values count as absent.
fn pick_u32(map: &Map<String, Value>, keys: &[&str]) -> Option<u32> {
    pick_i64(map, keys).and_then(|v| u32::try_from(v).ok())
}

fn pick_u64(map: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    pick_i64(map, keys).and_then(|v| u64::try_from(v).ok())
}

fn pick_bool(map: &Map<String, Value>, keys: &[&str]) -> bool {
    match pick(map, keys) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    }
}

/// Epoch milliseconds, epoch seconds, or RFC 3339.
fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            let millis = if raw.abs() < SECONDS_CUTOFF { raw * 1000 } else { raw };
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(|n| parse_time(&Value::from(n)))),
        _ => None,
    }
}
