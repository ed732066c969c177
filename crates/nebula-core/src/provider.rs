//! Backend collaborator interfaces
//!
//! The engine never talks to a concrete backend directly. Auth, row queries,
//! realtime channels and object storage are reached through these traits;
//! `remote` implements them over HTTP and websockets, `memory` in-process.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};

use crate::channel::{ChannelHandle, ChannelSpec};
use crate::error::SyncResult;
use crate::models::User;

/// A raw backend row
pub type Row = Map<String, Value>;

/// Row filter understood by the data provider
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value`
    Eq(String, Value),
    /// `column IS NULL`
    IsNull(String),
    /// `column IN (values)`
    In(String, Vec<Value>),
    /// Disjunction of conjunctions: `(a AND b) OR (c AND d)`
    AnyOf(Vec<Vec<Filter>>),
    /// Case-insensitive `column ILIKE pattern`; `%` matches any run
    ILike(String, String),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn is_null(column: &str) -> Self {
        Filter::IsNull(column.to_string())
    }

    /// Case-insensitive substring match
    ///
    /// Wildcards typed by the user are matched literally.
    pub fn contains(column: &str, needle: &str) -> Self {
        let needle: String = needle
            .chars()
            .filter(|c| !matches!(c, '%' | '*'))
            .collect();
        Filter::ILike(column.to_string(), format!("%{}%", needle))
    }

    /// Evaluate against a row (used by in-process providers)
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Eq(column, value) => row.get(column).is_some_and(|v| loosely_equal(v, value)),
            Filter::IsNull(column) => row.get(column).map_or(true, Value::is_null),
            Filter::In(column, values) => row
                .get(column)
                .is_some_and(|v| values.iter().any(|candidate| loosely_equal(v, candidate))),
            Filter::AnyOf(groups) => groups
                .iter()
                .any(|group| group.iter().all(|filter| filter.matches(row))),
            Filter::ILike(column, pattern) => row
                .get(column)
                .and_then(Value::as_str)
                .is_some_and(|text| ilike(text, pattern)),
        }
    }
}

/// Match `text` against a `%` wildcard pattern, ignoring case
fn ilike(text: &str, pattern: &str) -> bool {
    let text = text.to_lowercase();
    let pattern = pattern.to_lowercase();
    let parts: Vec<&str> = pattern.split('%').collect();
    let (Some(first), Some(last)) = (parts.first(), parts.last()) else {
        return false;
    };
    if parts.len() == 1 {
        return text == pattern;
    }
    if !text.starts_with(first) {
        return false;
    }
    let mut rest = &text[first.len()..];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// Compare ids that may arrive as numbers or strings
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            n.to_string() == *s
        }
        _ => a == b,
    }
}

/// Ordering of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// An ordered, filtered, range-limited select
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    /// Column list, including embedded relations (`*,author:profiles(*)`)
    pub select: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    /// Offset and limit
    pub range: Option<(usize, usize)>,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            select: "*".to_string(),
            filters: Vec::new(),
            order: None,
            range: None,
        }
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.select = columns.to_string();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn range(mut self, offset: usize, limit: usize) -> Self {
        self.range = Some((offset, limit));
        self
    }
}

/// Kind of row change delivered by a realtime channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Insert => write!(f, "INSERT"),
            EventType::Update => write!(f, "UPDATE"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

/// A row change pushed by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub event_type: EventType,
    pub table: String,
    pub new_row: Row,
    pub old_row: Row,
}

impl ChangeEvent {
    pub fn insert(table: &str, row: Row) -> Self {
        Self {
            event_type: EventType::Insert,
            table: table.to_string(),
            new_row: row,
            old_row: Row::new(),
        }
    }

    pub fn update(table: &str, row: Row) -> Self {
        Self {
            event_type: EventType::Update,
            table: table.to_string(),
            new_row: row,
            old_row: Row::new(),
        }
    }

    pub fn delete(table: &str, old_row: Row) -> Self {
        Self {
            event_type: EventType::Delete,
            table: table.to_string(),
            new_row: Row::new(),
            old_row,
        }
    }
}

/// Session issued by the auth provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthSession {
    pub user: User,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Auth state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// Auth state change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<AuthSession>,
}

/// Hosted authentication service
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current session, if any
    async fn get_session(&self) -> SyncResult<Option<AuthSession>>;

    /// Stream of auth state changes
    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthChange>;

    /// Password sign-in
    async fn sign_in(&self, email: &str, password: &str) -> SyncResult<AuthSession>;

    /// End the current session
    async fn sign_out(&self) -> SyncResult<()>;
}

/// Relational row access
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Ordered, filtered, range-limited select
    async fn select(&self, query: &Query) -> SyncResult<Vec<Row>>;

    /// Insert one row and return the stored representation
    async fn insert(&self, table: &str, row: Row) -> SyncResult<Row>;

    /// Insert or update by primary key and return the stored representation
    async fn upsert(&self, table: &str, row: Row) -> SyncResult<Row>;

    /// Update matching rows and return them
    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> SyncResult<Vec<Row>>;

    /// Delete matching rows, returning how many were removed
    async fn delete(&self, table: &str, filters: &[Filter]) -> SyncResult<usize>;

    /// Number of matching rows, without fetching them
    async fn count(&self, table: &str, filters: &[Filter]) -> SyncResult<usize>;
}

/// Realtime change subscriptions
#[async_trait]
pub trait RealtimeProvider: Send + Sync {
    /// Open a channel; events are delivered to `sink` until the handle is
    /// dropped or unsubscribed
    async fn subscribe(
        &self,
        spec: ChannelSpec,
        sink: mpsc::Sender<ChangeEvent>,
    ) -> SyncResult<ChannelHandle>;
}

/// Object storage for media uploads
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload bytes and return the stored path
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> SyncResult<String>;

    /// Public URL of a stored object
    fn public_url(&self, path: &str) -> String;
}

/// The four collaborators the engine talks to
#[derive(Clone)]
pub struct Providers {
    pub auth: Arc<dyn AuthProvider>,
    pub data: Arc<dyn DataProvider>,
    pub realtime: Arc<dyn RealtimeProvider>,
    pub storage: Arc<dyn ObjectStorage>,
}
