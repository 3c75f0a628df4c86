use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::models::{Attachment, AttachmentKind, Author, Message, MessageId, RoomId};

/// A media file that exists only on this device.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub path: PathBuf,
    /// Locally generated preview; the original is used when absent.
    pub thumbnail_path: Option<PathBuf>,
    pub kind: AttachmentKind,
    pub width: u32,
    pub height: u32,
    pub duration_ms: Option<u64>,
}

pub fn file_reference(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Hex SHA-256 of a file's contents.
pub fn content_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Build an attachment that points at local files. Unreadable files still
/// yield an attachment (zero size, empty hash) so the bubble can render.
pub fn local_attachment(index: u32, media: &LocalMedia) -> Attachment {
    let byte_size = match std::fs::metadata(&media.path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!("Cannot stat {}: {}", media.path.display(), e);
            0
        }
    };
    let content_hash = content_hash(&media.path).unwrap_or_else(|e| {
        warn!("Cannot hash {}: {}", media.path.display(), e);
        String::new()
    });

    let original = file_reference(&media.path);
    Attachment {
        kind: media.kind,
        index,
        thumbnail: media
            .thumbnail_path
            .as_deref()
            .map(file_reference)
            .unwrap_or_else(|| original.clone()),
        original,
        width: media.width,
        height: media.height,
        byte_size,
        content_hash,
        perceptual_hash: None,
        duration_ms: match media.kind {
            AttachmentKind::Video => media.duration_ms,
            AttachmentKind::Image => None,
        },
    }
}

/// Turn media whose upload or transport failed into a complete,
/// failure-flagged message referencing local files, ready to render as a
/// retryable bubble. Reads only the local filesystem.
pub fn synthesize_failed_attachment(
    room_id: &RoomId,
    author: &Author,
    files: &[LocalMedia],
    caption: Option<String>,
) -> Message {
    Message {
        id: MessageId::generate(),
        room_id: room_id.clone(),
        sender_id: author.id.clone(),
        sender_name: author.display_name.clone(),
        text: caption,
        seq: None,
        sent_at: Utc::now(),
        attachments: files
            .iter()
            .enumerate()
            .map(|(i, media)| local_attachment(i as u32, media))
            .collect(),
        reply_to: None,
        deleted: false,
        failed: true,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn temp_file(name: &str, bytes: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tether_media_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn failed_attachment_references_local_files() {
        let path = temp_file("photo.jpg", b"abc");
        let author = Author {
            id: "u1".into(),
            display_name: "Ada".into(),
        };
        let media = LocalMedia {
            path: path.clone(),
            thumbnail_path: None,
            kind: AttachmentKind::Image,
            width: 640,
            height: 480,
            duration_ms: Some(10),
        };

        let msg = synthesize_failed_attachment(&"r1".into(), &author, &[media], Some("look".into()));

        assert!(msg.failed);
        assert_eq!(msg.text.as_deref(), Some("look"));
        let att = &msg.attachments[0];
        assert_eq!(att.original, file_reference(&path));
        assert_eq!(att.thumbnail, att.original);
        assert_eq!(att.byte_size, 3);
        assert_eq!(
            att.content_hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(att.duration_ms, None);
    }

    #[test]
    fn missing_file_still_produces_attachment() {
        let media = LocalMedia {
            path: PathBuf::from("/definitely/not/here.mp4"),
            thumbnail_path: Some(PathBuf::from("/definitely/not/here.jpg")),
            kind: AttachmentKind::Video,
            width: 1,
            height: 1,
            duration_ms: Some(1500),
        };
        let att = local_attachment(2, &media);
        assert_eq!(att.index, 2);
        assert_eq!(att.byte_size, 0);
        assert!(att.content_hash.is_empty());
        assert_eq!(att.duration_ms, Some(1500));
        assert_eq!(att.thumbnail, "file:///definitely/not/here.jpg");
    }
}
