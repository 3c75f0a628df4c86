use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentPath {
    collection: String,
    id: String,
}

impl DocumentPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub path: DocumentPath,
    pub data: Value,
}

impl DocumentSnapshot {
    pub fn new(path: DocumentPath, data: Value) -> Self {
        Self { path, data }
    }

    pub fn id(&self) -> &str {
        self.path.id()
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Deserialize the body, filling `id` from the document id when the
    /// body does not carry one.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let mut data = self.data.clone();
        if let Value::Object(map) = &mut data {
            map.entry("id")
                .or_insert_with(|| Value::String(self.path.id().to_string()));
        }
        serde_json::from_value(data)
    }
}

/// Opaque pagination position: "continue after this document".
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor(DocumentSnapshot);

impl Cursor {
    pub fn after(doc: &DocumentSnapshot) -> Self {
        Self(doc.clone())
    }

    /// For store implementations resolving the position.
    pub fn document(&self) -> &DocumentSnapshot {
        &self.0
    }
}
