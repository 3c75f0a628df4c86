use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::document::{DocumentPath, DocumentSnapshot};
use crate::error::StoreError;
use crate::listener::{ChangeKind, DocumentChange, Listener, ListenerHandle, ListenerId};
use crate::query::{DOCUMENT_ID, Direction, Filter, OrderBy, Query};
use crate::write::{FieldValue, Precondition, WriteBatch, WriteOp};
use crate::RemoteStore;

/// In-process [`RemoteStore`] with the query, batch and listener semantics
/// of the hosted store. Used by the tests and the sandbox binary, with
/// failure injection hooks for each kind of operation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    next_listener: AtomicU64,
}

#[derive(Default)]
struct State {
    docs: BTreeMap<DocumentPath, Value>,
    listeners: HashMap<ListenerId, Registration>,
    faults: Faults,
    queries_served: u64,
}

struct Registration {
    query: Query,
    tx: mpsc::UnboundedSender<Vec<DocumentChange>>,
}

#[derive(Default)]
struct Faults {
    commit_fail_after: Option<usize>,
    unavailable: HashSet<String>,
    listen_failures: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw body of a document, bypassing the query layer.
    pub fn document(&self, path: &DocumentPath) -> Option<Value> {
        self.state().docs.get(path).cloned()
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.state()
            .docs
            .keys()
            .filter(|p| p.collection() == collection)
            .count()
    }

    pub fn active_listeners(&self) -> usize {
        self.state().listeners.len()
    }

    pub fn listener_queries(&self) -> Vec<Query> {
        self.state()
            .listeners
            .values()
            .map(|r| r.query.clone())
            .collect()
    }

    pub fn queries_served(&self) -> u64 {
        self.state().queries_served
    }

    /// The next commit fails after staging `ops` of its writes. Nothing from
    /// that batch becomes visible.
    pub fn fail_next_commit_after(&self, ops: usize) {
        self.state().faults.commit_fail_after = Some(ops);
    }

    /// Every read, query, listen and write touching `collection` fails
    /// until [`MemoryStore::restore`].
    pub fn make_unavailable(&self, collection: &str) {
        self.state().faults.unavailable.insert(collection.to_string());
    }

    pub fn restore(&self, collection: &str) {
        self.state().faults.unavailable.remove(collection);
    }

    pub fn fail_next_listens(&self, count: u32) {
        self.state().faults.listen_failures = count;
    }
}

impl State {
    fn check_available(&self, collection: &str) -> Result<(), StoreError> {
        if self.faults.unavailable.contains(collection) {
            return Err(StoreError::Unavailable(format!("collection {} is offline", collection)));
        }
        Ok(())
    }

    fn notify(&self, previous: &BTreeMap<DocumentPath, Value>, touched: &BTreeSet<&DocumentPath>) {
        for registration in self.listeners.values() {
            let query = &registration.query;
            let mut changes = Vec::new();

            for path in touched {
                let before = previous.get(*path).filter(|d| matches_query(path, d, query));
                let after = self.docs.get(*path).filter(|d| matches_query(path, d, query));
                let change = match (before, after) {
                    (None, Some(new)) => Some((ChangeKind::Added, new)),
                    (Some(old), Some(new)) if old != new => Some((ChangeKind::Modified, new)),
                    (Some(old), None) => Some((ChangeKind::Removed, old)),
                    _ => None,
                };
                if let Some((kind, data)) = change {
                    changes.push(DocumentChange {
                        kind,
                        document: DocumentSnapshot::new((*path).clone(), data.clone()),
                    });
                }
            }

            if !changes.is_empty() {
                let _ = registration.tx.send(changes);
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, path: &DocumentPath) -> Result<Option<DocumentSnapshot>, StoreError> {
        let state = self.state();
        state.check_available(path.collection())?;
        Ok(state
            .docs
            .get(path)
            .map(|data| DocumentSnapshot::new(path.clone(), data.clone())))
    }

    async fn query(&self, query: &Query) -> Result<Vec<DocumentSnapshot>, StoreError> {
        query.validate()?;
        let mut state = self.state();
        state.check_available(&query.collection)?;
        state.queries_served += 1;
        Ok(evaluate(&state.docs, query))
    }

    fn new_document_path(&self, collection: &str) -> DocumentPath {
        let id: String = Uuid::new_v4().simple().to_string().chars().take(20).collect();
        DocumentPath::new(collection, id)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut state = self.state();
        for op in &batch.ops {
            state.check_available(op.path().collection())?;
        }

        let mut staged = state.docs.clone();
        for precondition in &batch.preconditions {
            check_precondition(&staged, precondition)?;
        }
        for (applied, op) in batch.ops.iter().enumerate() {
            if state.faults.commit_fail_after == Some(applied) {
                state.faults.commit_fail_after = None;
                warn!("Injected commit failure after {} of {} writes", applied, batch.ops.len());
                return Err(StoreError::Unavailable(format!(
                    "injected failure after {} writes",
                    applied
                )));
            }
            apply(&mut staged, op)?;
        }

        let previous = std::mem::replace(&mut state.docs, staged);
        let touched: BTreeSet<&DocumentPath> = batch.ops.iter().map(WriteOp::path).collect();
        state.notify(&previous, &touched);
        Ok(())
    }

    async fn listen(&self, query: &Query) -> Result<Listener, StoreError> {
        query.validate()?;
        let mut state = self.state();
        state.check_available(&query.collection)?;
        if state.faults.listen_failures > 0 {
            state.faults.listen_failures -= 1;
            return Err(StoreError::Unavailable("injected listen failure".into()));
        }

        let id = ListenerId(self.inner.next_listener.fetch_add(1, atomic::Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();

        let initial: Vec<DocumentChange> = evaluate(&state.docs, query)
            .into_iter()
            .map(|document| DocumentChange {
                kind: ChangeKind::Added,
                document,
            })
            .collect();
        if !initial.is_empty() {
            let _ = tx.send(initial);
        }

        state.listeners.insert(
            id,
            Registration {
                query: query.clone(),
                tx,
            },
        );
        drop(state);

        let inner = Arc::downgrade(&self.inner);
        let handle = ListenerHandle::new(id, move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .listeners
                    .remove(&id);
                debug!("Released {}", id);
            }
        });

        Ok(Listener { handle, changes: rx })
    }
}

// -- Query evaluation --

fn field_value(path: &DocumentPath, data: &Value, field: &str) -> Option<Value> {
    if field == DOCUMENT_ID {
        return Some(Value::String(path.id().to_string()));
    }
    data.get(field).filter(|v| !v.is_null()).cloned()
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(a, b)| compare_values(a, b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b) && compare_values(a, b) == Ordering::Equal
}

fn matches_filter(path: &DocumentPath, data: &Value, filter: &Filter) -> bool {
    let Some(actual) = field_value(path, data, filter.field()) else {
        return false;
    };
    match filter {
        Filter::Equal(_, expected) => values_equal(&actual, expected),
        Filter::LessThan(_, bound) => {
            type_rank(&actual) == type_rank(bound) && compare_values(&actual, bound) == Ordering::Less
        }
        Filter::GreaterThan(_, bound) => {
            type_rank(&actual) == type_rank(bound)
                && compare_values(&actual, bound) == Ordering::Greater
        }
        Filter::In(_, candidates) => candidates.iter().any(|c| values_equal(&actual, c)),
    }
}

fn matches_query(path: &DocumentPath, data: &Value, query: &Query) -> bool {
    path.collection() == query.collection
        && query.filters.iter().all(|f| matches_filter(path, data, f))
        && query
            .order_by
            .as_ref()
            .map_or(true, |o| field_value(path, data, &o.field).is_some())
}

fn compare_for_order(a: &DocumentSnapshot, b: &DocumentSnapshot, order: Option<&OrderBy>) -> Ordering {
    match order {
        Some(order) => {
            let av = field_value(&a.path, &a.data, &order.field).unwrap_or(Value::Null);
            let bv = field_value(&b.path, &b.data, &order.field).unwrap_or(Value::Null);
            let ord = compare_values(&av, &bv).then_with(|| a.id().cmp(b.id()));
            match order.direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            }
        }
        None => a.id().cmp(b.id()),
    }
}

fn evaluate(docs: &BTreeMap<DocumentPath, Value>, query: &Query) -> Vec<DocumentSnapshot> {
    let order = query.order_by.as_ref();
    let mut hits: Vec<DocumentSnapshot> = docs
        .iter()
        .filter(|(path, data)| matches_query(path, data, query))
        .map(|(path, data)| DocumentSnapshot::new(path.clone(), data.clone()))
        .collect();
    hits.sort_by(|a, b| compare_for_order(a, b, order));

    if let Some(cursor) = &query.start_after {
        let anchor = cursor.document();
        hits.retain(|doc| compare_for_order(doc, anchor, order) == Ordering::Greater);
    }
    if let Some(limit) = query.limit {
        hits.truncate(limit);
    }
    hits
}

// -- Writes --

fn check_precondition(docs: &BTreeMap<DocumentPath, Value>, precondition: &Precondition) -> Result<(), StoreError> {
    let holds = match precondition {
        Precondition::Exists(path) => docs.contains_key(path),
        Precondition::Missing(path) => !docs.contains_key(path),
        Precondition::FieldEquals { path, field, value } => {
            let actual = docs
                .get(path)
                .and_then(|d| d.get(field))
                .cloned()
                .unwrap_or(Value::Null);
            values_equal(&actual, value)
        }
    };
    if holds {
        Ok(())
    } else {
        Err(StoreError::PreconditionFailed(format!("{:?}", precondition)))
    }
}

fn apply(docs: &mut BTreeMap<DocumentPath, Value>, op: &WriteOp) -> Result<(), StoreError> {
    match op {
        WriteOp::Set { path, data } => {
            if !data.is_object() {
                return Err(StoreError::InvalidWrite(format!("{} body must be an object", path)));
            }
            docs.insert(path.clone(), data.clone());
        }
        WriteOp::Update { path, fields, upsert } => {
            if !docs.contains_key(path) {
                if !*upsert {
                    return Err(StoreError::NotFound(path.clone()));
                }
                docs.insert(path.clone(), Value::Object(Map::new()));
            }
            let Some(Value::Object(body)) = docs.get_mut(path) else {
                return Err(StoreError::InvalidWrite(format!("{} is not an object", path)));
            };
            for (field, change) in fields {
                apply_field(body, field, change);
            }
        }
        WriteOp::Delete { path } => {
            docs.remove(path);
        }
    }
    Ok(())
}

fn apply_field(body: &mut Map<String, Value>, field: &str, change: &FieldValue) {
    match change {
        FieldValue::Set(value) => {
            body.insert(field.to_string(), value.clone());
        }
        FieldValue::Delete => {
            body.remove(field);
        }
        FieldValue::Increment(n) => {
            let current = body.get(field).and_then(Value::as_i64).unwrap_or(0);
            body.insert(field.to_string(), Value::from(current + n));
        }
        FieldValue::ArrayUnion(values) => {
            let entry = body
                .entry(field.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !entry.is_array() {
                *entry = Value::Array(Vec::new());
            }
            if let Value::Array(items) = entry {
                for value in values {
                    if !items.contains(value) {
                        items.push(value.clone());
                    }
                }
            }
        }
        FieldValue::ArrayRemove(values) => {
            if let Some(Value::Array(items)) = body.get_mut(field) {
                items.retain(|item| !values.contains(item));
            }
        }
    }
}
