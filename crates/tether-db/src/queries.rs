use crate::models::{MediaPathRow, MessageRow, RoomRow};
use crate::Database;
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Rooms --

    pub fn upsert_rooms(&self, rows: &[RoomRow]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO rooms (id, name, last_message_at, body) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        last_message_at = excluded.last_message_at,
                        body = excluded.body,
                        cached_at = datetime('now')",
                )?;
                for row in rows {
                    stmt.execute(rusqlite::params![row.id, row.name, row.last_message_at, row.body])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_room(&self, id: &str) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| query_room(conn, id))
    }

    /// Most recently active rooms first; rooms without messages last.
    pub fn get_rooms(&self, limit: u32) -> Result<Vec<RoomRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, last_message_at, body FROM rooms
                 ORDER BY last_message_at IS NULL, last_message_at DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit], room_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    /// Insert or replace messages, recording attachments that still
    /// reference local files.
    pub fn upsert_messages(&self, rows: &[MessageRow], media: &[MediaPathRow]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO messages (id, room_id, seq, sent_at, body) VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                        seq = COALESCE(excluded.seq, messages.seq),
                        sent_at = excluded.sent_at,
                        body = excluded.body",
                )?;
                for row in rows {
                    stmt.execute(rusqlite::params![row.id, row.room_id, row.seq, row.sent_at, row.body])?;
                }

                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO media_paths (message_id, idx, room_id, local_path)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for row in media {
                    stmt.execute(rusqlite::params![row.message_id, row.idx, row.room_id, row.local_path])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// The newest `limit` messages of a room, newest first. Sequenced
    /// messages are preferred; rooms holding only legacy messages fall back
    /// to timestamp order.
    pub fn recent_messages(&self, room_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sequenced = query_messages(
                conn,
                "SELECT id, room_id, seq, sent_at, body FROM messages
                 WHERE room_id = ?1 AND seq IS NOT NULL
                 ORDER BY seq DESC
                 LIMIT ?2",
                room_id,
                limit,
            )?;
            if !sequenced.is_empty() {
                return Ok(sequenced);
            }
            query_messages(
                conn,
                "SELECT id, room_id, seq, sent_at, body FROM messages
                 WHERE room_id = ?1
                 ORDER BY sent_at DESC
                 LIMIT ?2",
                room_id,
                limit,
            )
        })
    }

    pub fn media_paths(&self, room_id: &str) -> Result<Vec<MediaPathRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, idx, room_id, local_path FROM media_paths
                 WHERE room_id = ?1
                 ORDER BY message_id, idx",
            )?;
            let rows = stmt
                .query_map([room_id], |row| {
                    Ok(MediaPathRow {
                        message_id: row.get(0)?,
                        idx: row.get(1)?,
                        room_id: row.get(2)?,
                        local_path: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Drop everything cached for a room. Returns the number of messages removed.
    pub fn delete_room_data(&self, room_id: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM media_paths WHERE room_id = ?1", [room_id])?;
            let removed = tx.execute("DELETE FROM messages WHERE room_id = ?1", [room_id])?;
            tx.execute("DELETE FROM rooms WHERE id = ?1", [room_id])?;
            tx.commit()?;
            Ok(removed)
        })
    }
}

fn room_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomRow> {
    Ok(RoomRow {
        id: row.get(0)?,
        name: row.get(1)?,
        last_message_at: row.get(2)?,
        body: row.get(3)?,
    })
}

fn query_room(conn: &Connection, id: &str) -> Result<Option<RoomRow>> {
    let mut stmt = conn.prepare("SELECT id, name, last_message_at, body FROM rooms WHERE id = ?1")?;
    let row = stmt.query_row([id], room_from_row).optional()?;
    Ok(row)
}

fn query_messages(conn: &Connection, sql: &str, room_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(rusqlite::params![room_id, limit], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                room_id: row.get(1)?,
                seq: row.get(2)?,
                sent_at: row.get(3)?,
                body: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, seq: Option<i64>, sent_at: i64) -> MessageRow {
        MessageRow {
            id: id.into(),
            room_id: "r1".into(),
            seq,
            sent_at,
            body: "{}".into(),
        }
    }

    #[test]
    fn recent_messages_prefers_sequence_order() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_messages(
            &[message("a", Some(2), 300), message("b", Some(1), 400), message("c", None, 500)],
            &[],
        )
        .unwrap();
        let ids: Vec<_> = db.recent_messages("r1", 10).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn recent_messages_falls_back_to_timestamps() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_messages(&[message("a", None, 300), message("b", None, 100)], &[]).unwrap();
        let ids: Vec<_> = db.recent_messages("r1", 10).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn upsert_keeps_known_sequence() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_messages(&[message("a", Some(7), 300)], &[]).unwrap();
        db.upsert_messages(&[message("a", None, 300)], &[]).unwrap();
        assert_eq!(db.recent_messages("r1", 1).unwrap()[0].seq, Some(7));
    }

    #[test]
    fn delete_room_data_clears_media_paths() {
        let db = Database::open_in_memory().unwrap();
        let media = MediaPathRow {
            message_id: "a".into(),
            idx: 0,
            room_id: "r1".into(),
            local_path: "/tmp/a.jpg".into(),
        };
        db.upsert_messages(&[message("a", Some(1), 1)], &[media]).unwrap();
        assert_eq!(db.media_paths("r1").unwrap().len(), 1);

        assert_eq!(db.delete_room_data("r1").unwrap(), 1);
        assert!(db.media_paths("r1").unwrap().is_empty());
        assert!(db.recent_messages("r1", 10).unwrap().is_empty());
    }
}
