use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS rooms (
            id               TEXT PRIMARY KEY,
            name             TEXT NOT NULL,
            last_message_at  INTEGER,
            body             TEXT NOT NULL,
            cached_at        TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            room_id     TEXT NOT NULL,
            seq         INTEGER,
            sent_at     INTEGER NOT NULL,
            body        TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room_seq
            ON messages(room_id, seq);

        CREATE INDEX IF NOT EXISTS idx_messages_room_sent
            ON messages(room_id, sent_at);

        -- Attachments that still point at files on this device
        CREATE TABLE IF NOT EXISTS media_paths (
            message_id  TEXT NOT NULL,
            idx         INTEGER NOT NULL,
            room_id     TEXT NOT NULL,
            local_path  TEXT NOT NULL,
            PRIMARY KEY (message_id, idx)
        );

        CREATE INDEX IF NOT EXISTS idx_media_paths_room
            ON media_paths(room_id);
        ",
    )?;

    info!("Cache migrations complete");
    Ok(())
}
