/// Cache row types. Bodies are the JSON wire form of the
/// tether-types models; the other columns exist for indexing.

pub struct RoomRow {
    pub id: String,
    pub name: String,
    pub last_message_at: Option<i64>,
    pub body: String,
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub seq: Option<i64>,
    pub sent_at: i64,
    pub body: String,
}

pub struct MediaPathRow {
    pub message_id: String,
    pub idx: u32,
    pub room_id: String,
    pub local_path: String,
}
