// Document repository layer
//
// Typed CRUD over named document collections, partitioned by scheduler name
// and guarded by optimistic concurrency tokens. Every write is a single
// conditional document write; nothing here retries.

pub mod entities;
pub mod memory;
pub mod postgres;

pub use entities::{job_id, key_id, trigger_id, Entity, EntityStore, Versioned};
pub use memory::InMemoryDocumentStore;
pub use postgres::PostgresDocumentStore;

use crate::errors::RepositoryError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Named document collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Jobs,
    Triggers,
    Calendars,
    FiredTriggers,
    Locks,
    SchedulerStates,
    PausedTriggerGroups,
    PausedJobGroups,
}

impl Collection {
    pub const ALL: [Collection; 8] = [
        Collection::Jobs,
        Collection::Triggers,
        Collection::Calendars,
        Collection::FiredTriggers,
        Collection::Locks,
        Collection::SchedulerStates,
        Collection::PausedTriggerGroups,
        Collection::PausedJobGroups,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Jobs => "jobs",
            Collection::Triggers => "triggers",
            Collection::Calendars => "calendars",
            Collection::FiredTriggers => "fired_triggers",
            Collection::Locks => "locks",
            Collection::SchedulerStates => "scheduler_states",
            Collection::PausedTriggerGroups => "paused_trigger_groups",
            Collection::PausedJobGroups => "paused_job_groups",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque value tied to a document's last written version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConcurrencyToken(String);

impl ConcurrencyToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored document with its current concurrency token
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub body: Value,
    pub token: ConcurrencyToken,
}

/// Typed scalar compared against a document field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Bool(bool),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

/// Predicate over a dotted field path (`job_key.group`)
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, FieldValue),
    Lt(String, FieldValue),
    Lte(String, FieldValue),
}

impl Filter {
    pub fn field(&self) -> &str {
        match self {
            Filter::Eq(f, _) | Filter::Lt(f, _) | Filter::Lte(f, _) => f,
        }
    }

    pub fn value(&self) -> &FieldValue {
        match self {
            Filter::Eq(_, v) | Filter::Lt(_, v) | Filter::Lte(_, v) => v,
        }
    }

    /// Evaluate against a document body; missing or null fields never match
    pub fn matches(&self, body: &Value) -> bool {
        let field = match lookup(body, self.field()) {
            Some(v) if !v.is_null() => v,
            _ => return false,
        };
        let ordering = match compare_field(field, self.value()) {
            Some(o) => o,
            None => return false,
        };
        match self {
            Filter::Eq(..) => ordering == Ordering::Equal,
            Filter::Lt(..) => ordering == Ordering::Less,
            Filter::Lte(..) => ordering != Ordering::Greater,
        }
    }
}

/// How a sort field is compared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub kind: FieldKind,
    pub descending: bool,
}

/// Filter, order and limit for a collection scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.filters.push(Filter::Eq(field.to_string(), value.into()));
        self
    }

    pub fn lt(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.filters.push(Filter::Lt(field.to_string(), value.into()));
        self
    }

    pub fn lte(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.filters.push(Filter::Lte(field.to_string(), value.into()));
        self
    }

    pub fn order_asc(mut self, field: &str, kind: FieldKind) -> Self {
        self.order_by.push(SortKey {
            field: field.to_string(),
            kind,
            descending: false,
        });
        self
    }

    pub fn order_desc(mut self, field: &str, kind: FieldKind) -> Self {
        self.order_by.push(SortKey {
            field: field.to_string(),
            kind,
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, body: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(body))
    }

    /// Total order over document bodies implied by `order_by`; nulls sort last
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for key in &self.order_by {
            let left = lookup(a, &key.field).filter(|v| !v.is_null());
            let right = lookup(b, &key.field).filter(|v| !v.is_null());
            let ordering = match (left, right) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(l), Some(r)) => {
                    let natural = match key.kind {
                        FieldKind::Integer => l.as_i64().cmp(&r.as_i64()),
                        FieldKind::Text => l.as_str().cmp(&r.as_str()),
                    };
                    if key.descending {
                        natural.reverse()
                    } else {
                        natural
                    }
                }
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// Resolve a dotted path inside a document body
pub fn lookup<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(body, |node, segment| node.get(segment))
}

fn compare_field(field: &Value, expected: &FieldValue) -> Option<Ordering> {
    match expected {
        FieldValue::Text(s) => field.as_str().map(|v| v.cmp(s.as_str())),
        FieldValue::Integer(i) => field.as_i64().map(|v| v.cmp(i)),
        FieldValue::Bool(b) => field.as_bool().map(|v| v.cmp(b)),
    }
}

/// Field paths end up inside SQL text, so only plain identifiers are allowed
pub fn is_valid_field_path(path: &str) -> bool {
    !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

/// Storage backend contract
///
/// Writes carry the token the caller last observed: `None` means the document
/// must not exist yet. A mismatch fails with `ConcurrencyConflict` and never
/// overwrites. Connectivity problems surface as `StoreUnavailable` and are
/// left to the caller to retry.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn get(
        &self,
        partition: &str,
        collection: Collection,
        id: &str,
    ) -> Result<Document, RepositoryError>;

    async fn upsert(
        &self,
        partition: &str,
        collection: Collection,
        id: &str,
        body: Value,
        expected: Option<&ConcurrencyToken>,
    ) -> Result<ConcurrencyToken, RepositoryError>;

    /// Lazily evaluated when first polled; each call starts a fresh scan
    fn query(
        &self,
        partition: &str,
        collection: Collection,
        query: Query,
    ) -> BoxStream<'static, Result<Document, RepositoryError>>;

    async fn delete(
        &self,
        partition: &str,
        collection: Collection,
        id: &str,
        expected: &ConcurrencyToken,
    ) -> Result<(), RepositoryError>;
}
