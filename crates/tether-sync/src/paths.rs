//! Document layout in the remote store.

use tether_store::DocumentPath;
use tether_types::{MessageId, RoomId, UserId};

pub const ROOMS: &str = "rooms";
pub const USERS: &str = "users";

// Room fields
pub const NAME: &str = "name";
pub const DESCRIPTION: &str = "description";
pub const PARTICIPANTS: &str = "participants";
pub const LAST_MESSAGE: &str = "lastMessage";
pub const LAST_MESSAGE_AT: &str = "lastMessageAt";
pub const LAST_MESSAGE_SEQ: &str = "lastMessageSeq";
pub const IMAGE_URL: &str = "imageUrl";
pub const THUMBNAIL_URL: &str = "thumbnailUrl";
pub const ANNOUNCEMENT: &str = "announcement";

// User fields
pub const JOINED_ROOMS: &str = "joinedRooms";

// Message fields
pub const SEQ: &str = "seq";
pub const SENT_AT: &str = "sentAt";
pub const DELETED: &str = "deleted";

pub fn room(id: &RoomId) -> DocumentPath {
    DocumentPath::new(ROOMS, id.as_str())
}

pub fn user(id: &UserId) -> DocumentPath {
    DocumentPath::new(USERS, id.as_str())
}

pub fn messages(room_id: &RoomId) -> String {
    format!("{}/{}/messages", ROOMS, room_id)
}

pub fn message(room_id: &RoomId, id: &MessageId) -> DocumentPath {
    DocumentPath::new(messages(room_id), id.as_str())
}
