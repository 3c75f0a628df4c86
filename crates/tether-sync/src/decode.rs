use serde::de::DeserializeOwned;
use tether_store::DocumentSnapshot;
use tracing::warn;

/// Decode one document; a malformed one is logged and yields `None`.
pub fn decode_one<T: DeserializeOwned>(doc: &DocumentSnapshot, what: &str) -> Option<T> {
    match doc.decode() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Skipping malformed {} {}: {}", what, doc.path, e);
            None
        }
    }
}

/// Decode each document independently, skipping the malformed ones.
pub fn decode_all<T: DeserializeOwned>(docs: &[DocumentSnapshot], what: &str) -> Vec<T> {
    docs.iter().filter_map(|doc| decode_one(doc, what)).collect()
}
