use serde_json::Value;

use crate::document::DocumentPath;

/// Per-field mutation applied by [`WriteOp::Update`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Set(Value),
    /// Append each value not already present.
    ArrayUnion(Vec<Value>),
    /// Remove every occurrence of each value.
    ArrayRemove(Vec<Value>),
    Increment(i64),
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    Exists(DocumentPath),
    Missing(DocumentPath),
    /// `value` of `Null` means the field must be absent.
    FieldEquals {
        path: DocumentPath,
        field: String,
        value: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Replace the whole body.
    Set { path: DocumentPath, data: Value },
    /// Mutate fields; fails on a missing document unless `upsert`.
    Update {
        path: DocumentPath,
        fields: Vec<(String, FieldValue)>,
        upsert: bool,
    },
    Delete { path: DocumentPath },
}

impl WriteOp {
    pub fn path(&self) -> &DocumentPath {
        match self {
            Self::Set { path, .. } | Self::Update { path, .. } | Self::Delete { path } => path,
        }
    }
}

/// Writes and preconditions committed as one atomic unit.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub preconditions: Vec<Precondition>,
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }

    pub fn set(mut self, path: DocumentPath, data: Value) -> Self {
        self.ops.push(WriteOp::Set { path, data });
        self
    }

    pub fn update(mut self, path: DocumentPath, fields: Vec<(String, FieldValue)>) -> Self {
        self.ops.push(WriteOp::Update {
            path,
            fields,
            upsert: false,
        });
        self
    }

    pub fn upsert(mut self, path: DocumentPath, fields: Vec<(String, FieldValue)>) -> Self {
        self.ops.push(WriteOp::Update {
            path,
            fields,
            upsert: true,
        });
        self
    }

    pub fn delete(mut self, path: DocumentPath) -> Self {
        self.ops.push(WriteOp::Delete { path });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}
