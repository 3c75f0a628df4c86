pub mod events;
pub mod media;
pub mod models;
pub mod normalize;

pub use models::{
    Announcement, Attachment, AttachmentKind, Author, Message, MessageId, ReplyPreview, Room,
    RoomId, UserId,
};
