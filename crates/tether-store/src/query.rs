use serde_json::Value;

use crate::document::Cursor;
use crate::error::StoreError;

/// The remote store rejects `in` filters with more values than this.
pub const MAX_IN_VALUES: usize = 10;

/// Pseudo-field addressing the document id in filters and ordering.
pub const DOCUMENT_ID: &str = "__name__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Equal(String, Value),
    LessThan(String, Value),
    GreaterThan(String, Value),
    In(String, Vec<Value>),
}

impl Filter {
    pub fn field(&self) -> &str {
        match self {
            Self::Equal(f, _) | Self::LessThan(f, _) | Self::GreaterThan(f, _) | Self::In(f, _) => f,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Documents lacking the `order_by` field are excluded from ordered
/// results, matching the behaviour of hosted document stores.
#[derive(Debug, Clone)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub start_after: Option<Cursor>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
            start_after: None,
        }
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Equal(field.to_string(), value.into()));
        self
    }

    pub fn where_lt(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::LessThan(field.to_string(), value.into()));
        self
    }

    pub fn where_gt(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::GreaterThan(field.to_string(), value.into()));
        self
    }

    pub fn where_in<V: Into<Value>>(mut self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.filters.push(Filter::In(
            field.to_string(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn start_after(mut self, cursor: Option<Cursor>) -> Self {
        self.start_after = cursor;
        self
    }

    /// Reject queries the remote store would refuse.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.limit == Some(0) {
            return Err(StoreError::InvalidQuery("limit must be positive".into()));
        }
        for filter in &self.filters {
            if let Filter::In(field, values) = filter {
                if values.is_empty() {
                    return Err(StoreError::InvalidQuery(format!("empty 'in' filter on {}", field)));
                }
                if values.len() > MAX_IN_VALUES {
                    return Err(StoreError::InvalidQuery(format!(
                        "'in' filter on {} has {} values (max {})",
                        field,
                        values.len(),
                        MAX_IN_VALUES
                    )));
                }
            }
        }
        Ok(())
    }
}
