//! In-process backend
//!
//! `MemoryBackend` implements every provider trait over tables of JSON rows
//! held in memory. It mirrors the behavior the engine relies on from the
//! hosted backend: generated ids and timestamps, unique constraints that fail
//! with `Conflict`, counter triggers that keep `posts.like_count` and friends
//! up to date (and emit their own UPDATE events), and realtime fan-out to
//! subscribed channels. Used by the integration tests and `nebula demo`.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{ChannelHandle, ChannelSpec, ChannelState, ChannelStatus};
use crate::error::{SyncError, SyncResult};
use crate::models::User;
use crate::provider::{
    AuthChange, AuthEvent, AuthProvider, AuthSession, ChangeEvent, DataProvider, EventType,
    Filter, ObjectStorage, Providers, Query, RealtimeProvider, Row,
};

/// Tables whose rows get numeric ids
const NUMERIC_ID_TABLES: &[&str] = &["posts", "comments"];

/// Unique constraints per table
const UNIQUE_KEYS: &[(&str, &[&str])] = &[
    ("likes", &["post_id", "user_id"]),
    ("community_members", &["community_id", "user_id"]),
    ("user_follows", &["follower_id", "following_id"]),
    ("profiles", &["username"]),
];

/// Foreign keys checked on insert: (child table, fk column, parent table)
const FOREIGN_KEYS: &[(&str, &str, &str)] = &[
    ("likes", "post_id", "posts"),
    ("comments", "post_id", "posts"),
    ("user_follows", "following_id", "profiles"),
];

/// Counter triggers: (child table, parent fk column, parent table, counter column)
const COUNTERS: &[(&str, &str, &str, &str)] = &[
    ("likes", "post_id", "posts", "like_count"),
    ("comments", "post_id", "posts", "comment_count"),
    ("community_members", "community_id", "communities", "member_count"),
];

struct Subscription {
    id: u64,
    spec: ChannelSpec,
    sink: mpsc::Sender<ChangeEvent>,
    status: Arc<ChannelStatus>,
}

struct Account {
    password: String,
    user: User,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Row>>,
    next_id: u64,
    accounts: HashMap<String, Account>,
    session: Option<AuthSession>,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
    objects: HashMap<String, (Vec<u8>, String)>,
    failures: HashMap<String, VecDeque<SyncError>>,
    select_delay: Option<Duration>,
    subscribe_delay: Option<Duration>,
    connected: bool,
}

/// In-memory implementation of all provider traits
///
/// Cloning shares the same backend.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    auth_tx: broadcast::Sender<AuthChange>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (auth_tx, _) = broadcast::channel(16);
        let state = State {
            connected: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            auth_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves rows consistent enough for tests
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Test and demo hooks ====================

    /// Register an account and its profile row; returns the user
    pub fn register(&self, email: &str, password: &str, username: &str) -> User {
        let mut state = self.lock();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: Some(email.to_string()),
        };
        state.accounts.insert(
            email.to_string(),
            Account {
                password: password.to_string(),
                user: user.clone(),
            },
        );
        let profile = object(json!({
            "id": user.id,
            "username": username,
            "full_name": null,
            "avatar_url": null,
            "bio": null,
        }));
        state.tables.entry("profiles".to_string()).or_default().push(profile);
        user
    }

    /// Insert rows without triggers or realtime events
    pub fn seed(&self, table: &str, rows: Vec<Row>) -> Vec<Row> {
        let mut state = self.lock();
        rows.into_iter()
            .map(|row| {
                let row = state.complete_row(table, row);
                state.tables.entry(table.to_string()).or_default().push(row.clone());
                row
            })
            .collect()
    }

    /// All rows of a table
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Make the next operation touching `table` fail with `error`
    pub fn fail_next(&self, table: &str, error: SyncError) {
        self.lock()
            .failures
            .entry(table.to_string())
            .or_default()
            .push_back(error);
    }

    /// Delay every select (to interleave concurrent loads)
    pub fn set_select_delay(&self, delay: Option<Duration>) {
        self.lock().select_delay = delay;
    }

    /// Delay every realtime subscribe (to interleave concurrent subscribes)
    pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
        self.lock().subscribe_delay = delay;
    }

    /// Push an event to matching channels as if the database emitted it
    pub fn emit(&self, event: ChangeEvent) {
        self.lock().fan_out(&event);
    }

    /// Simulate a dropped realtime connection; events are lost until restored
    pub fn disconnect_realtime(&self) {
        let mut state = self.lock();
        state.connected = false;
        for sub in &state.subscriptions {
            sub.status.advance(ChannelState::Reconnecting);
        }
    }

    pub fn restore_realtime(&self) {
        let mut state = self.lock();
        state.connected = true;
        for sub in &state.subscriptions {
            sub.status.advance(ChannelState::Active);
        }
    }

    /// Number of open channels
    pub fn channel_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Names of open channels
    pub fn channel_names(&self) -> Vec<String> {
        self.lock()
            .subscriptions
            .iter()
            .map(|sub| sub.spec.name.clone())
            .collect()
    }

    /// Provider set backed by this backend
    pub fn providers(&self) -> Providers {
        Providers {
            auth: Arc::new(self.clone()),
            data: Arc::new(self.clone()),
            realtime: Arc::new(self.clone()),
            storage: Arc::new(self.clone()),
        }
    }

    /// Stored object bytes
    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(path).map(|(bytes, _)| bytes.clone())
    }

    fn unsubscribe(&self, id: u64) {
        let mut state = self.lock();
        if let Some(pos) = state.subscriptions.iter().position(|sub| sub.id == id) {
            let sub = state.subscriptions.remove(pos);
            sub.status.advance(ChannelState::Terminated);
            debug!("Memory channel {} closed", sub.spec.name);
        }
    }
}

impl State {
    fn take_failure(&mut self, table: &str) -> SyncResult<()> {
        match self.failures.get_mut(table).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Fill generated columns
    fn complete_row(&mut self, table: &str, mut row: Row) -> Row {
        if !row.get("id").is_some_and(|v| !v.is_null()) {
            self.next_id += 1;
            let id = if NUMERIC_ID_TABLES.contains(&table) {
                json!(self.next_id)
            } else {
                json!(Uuid::new_v4().to_string())
            };
            row.insert("id".to_string(), id);
        }
        if !row.get("created_at").is_some_and(|v| !v.is_null()) {
            row.insert("created_at".to_string(), json!(Utc::now().to_rfc3339()));
        }
        for (column, value) in column_defaults(table) {
            row.entry(column.to_string()).or_insert(value);
        }
        row
    }

    fn check_unique(&self, table: &str, row: &Row, skip_id: Option<&Value>) -> SyncResult<()> {
        let existing = self.tables.get(table).map(Vec::as_slice).unwrap_or_default();
        if let Some(id) = row.get("id") {
            if skip_id.is_none() && existing.iter().any(|r| r.get("id") == Some(id)) {
                return Err(SyncError::from_backend(
                    "23505",
                    format!("duplicate key violates unique constraint \"{}_pkey\"", table),
                ));
            }
        }
        for (unique_table, columns) in UNIQUE_KEYS {
            let incomplete = columns.iter().any(|c| row.get(*c).map_or(true, Value::is_null));
            if *unique_table != table || incomplete {
                continue;
            }
            let clash = existing.iter().any(|r| {
                r.get("id") != skip_id && columns.iter().all(|c| r.get(*c) == row.get(*c))
            });
            if clash {
                return Err(SyncError::from_backend(
                    "23505",
                    format!(
                        "duplicate key value violates unique constraint \"{}_{}_key\"",
                        table,
                        columns.join("_")
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_foreign_keys(&self, table: &str, row: &Row) -> SyncResult<()> {
        for (child, fk, parent) in FOREIGN_KEYS {
            if *child != table {
                continue;
            }
            let Some(parent_id) = row.get(*fk).filter(|v| !v.is_null()).map(loose_id) else {
                continue;
            };
            let exists = self
                .tables
                .get(*parent)
                .into_iter()
                .flatten()
                .any(|r| r.get("id").map(loose_id).as_deref() == Some(parent_id.as_str()));
            if !exists {
                return Err(SyncError::from_backend(
                    "23503",
                    format!(
                        "insert or update on table \"{}\" violates foreign key constraint \"{}_{}_fkey\"",
                        table, table, fk
                    ),
                ));
            }
        }
        Ok(())
    }

    fn insert(&mut self, table: &str, row: Row) -> SyncResult<Row> {
        self.take_failure(table)?;
        let row = self.complete_row(table, row);
        self.check_foreign_keys(table, &row)?;
        self.check_unique(table, &row, None)?;
        self.tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        self.fan_out(&ChangeEvent::insert(table, row.clone()));
        self.after_insert(table, &row);
        Ok(row)
    }

    fn update(&mut self, table: &str, filters: &[Filter], patch: &Row) -> SyncResult<Vec<Row>> {
        self.take_failure(table)?;
        let ids: Vec<Value> = self
            .tables
            .get(table)
            .into_iter()
            .flatten()
            .filter(|row| filters.iter().all(|f| f.matches(row)))
            .filter_map(|row| row.get("id").cloned())
            .collect();

        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(current) = self.find(table, &id) else {
                continue;
            };
            let mut next = current.clone();
            for (key, value) in patch {
                if key != "id" {
                    next.insert(key.clone(), value.clone());
                }
            }
            self.check_unique(table, &next, Some(&id))?;
            self.replace(table, &id, next.clone());
            self.fan_out(&ChangeEvent {
                event_type: EventType::Update,
                table: table.to_string(),
                new_row: next.clone(),
                old_row: current,
            });
            updated.push(next);
        }
        Ok(updated)
    }

    fn delete(&mut self, table: &str, filters: &[Filter]) -> SyncResult<usize> {
        self.take_failure(table)?;
        let Some(rows) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        let (removed, kept): (Vec<Row>, Vec<Row>) = rows
            .drain(..)
            .partition(|row| filters.iter().all(|f| f.matches(row)));
        *rows = kept;

        for row in &removed {
            self.fan_out(&ChangeEvent::delete(table, row.clone()));
            self.after_delete(table, row);
        }
        Ok(removed.len())
    }

    fn find(&self, table: &str, id: &Value) -> Option<Row> {
        self.tables
            .get(table)?
            .iter()
            .find(|row| row.get("id") == Some(id))
            .cloned()
    }

    fn replace(&mut self, table: &str, id: &Value, row: Row) {
        if let Some(slot) = self
            .tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| r.get("id") == Some(id)))
        {
            *slot = row;
        }
    }

    fn after_insert(&mut self, table: &str, row: &Row) {
        self.bump_counters(table, row, 1);
        match table {
            "likes" => self.notify_owner(row, "posts", "post_id", "like"),
            "comments" => self.notify_owner(row, "posts", "post_id", "comment"),
            _ => {}
        }
    }

    fn after_delete(&mut self, table: &str, row: &Row) {
        self.bump_counters(table, row, -1);
        if table == "posts" {
            let Some(id) = row.get("id").cloned() else {
                return;
            };
            for child in ["likes", "comments"] {
                if let Some(rows) = self.tables.get_mut(child) {
                    rows.retain(|r| r.get("post_id").map(loose_id) != Some(loose_id(&id)));
                }
            }
        }
    }

    /// Maintain denormalized counters and emit the parent UPDATE
    fn bump_counters(&mut self, table: &str, row: &Row, delta: i64) {
        for (child, fk, parent, column) in COUNTERS {
            if *child != table {
                continue;
            }
            let Some(parent_id) = row.get(*fk).map(loose_id) else {
                continue;
            };
            let Some(current) = self
                .tables
                .get(*parent)
                .into_iter()
                .flatten()
                .find(|r| r.get("id").map(loose_id).as_deref() == Some(parent_id.as_str()))
                .cloned()
            else {
                continue;
            };
            let Some(id) = current.get("id").cloned() else {
                continue;
            };
            let count = current.get(*column).and_then(Value::as_i64).unwrap_or(0);
            let mut next = current.clone();
            next.insert(column.to_string(), json!((count + delta).max(0)));
            self.replace(parent, &id, next.clone());
            self.fan_out(&ChangeEvent {
                event_type: EventType::Update,
                table: parent.to_string(),
                new_row: next,
                old_row: current,
            });
        }
    }

    /// Create a notification for the owner of the parent row
    fn notify_owner(&mut self, row: &Row, parent: &str, fk: &str, kind: &str) {
        let Some(parent_id) = row.get(fk).map(loose_id) else {
            return;
        };
        let owner = self
            .tables
            .get(parent)
            .into_iter()
            .flatten()
            .find(|r| r.get("id").map(loose_id).as_deref() == Some(parent_id.as_str()))
            .and_then(|r| r.get("user_id").cloned());
        let sender = row.get("user_id").cloned();
        let (Some(owner), Some(sender)) = (owner, sender) else {
            return;
        };
        if owner == sender {
            return;
        }
        let notification = object(json!({
            "receiver_id": owner,
            "sender_id": sender,
            "type": kind,
            "post_id": row.get(fk),
            "comment_id": if kind == "comment" { row.get("id").cloned() } else { None },
        }));
        let notification = self.complete_row("notifications", notification);
        self.tables
            .entry("notifications".to_string())
            .or_default()
            .push(notification.clone());
        self.fan_out(&ChangeEvent::insert("notifications", notification));
    }

    fn fan_out(&self, event: &ChangeEvent) {
        if !self.connected {
            debug!("Realtime disconnected; dropping {} on {}", event.event_type, event.table);
            return;
        }
        let row = match event.event_type {
            EventType::Delete => &event.old_row,
            _ => &event.new_row,
        };
        for sub in &self.subscriptions {
            let spec = &sub.spec;
            if spec.table != event.table || !spec.wants(event.event_type) {
                continue;
            }
            if let Some(ref filter) = spec.filter {
                if !Filter::eq(&filter.column, filter.value.as_str()).matches(row) {
                    continue;
                }
            }
            if sub.sink.try_send(event.clone()).is_err() {
                warn!("Channel {} sink full or closed; dropping event", spec.name);
            }
        }
    }
}

fn column_defaults(table: &str) -> Vec<(&'static str, Value)> {
    match table {
        "posts" => vec![("like_count", json!(0)), ("comment_count", json!(0))],
        "communities" => vec![("member_count", json!(0))],
        "notifications" | "messages" => vec![("read_at", Value::Null)],
        _ => Vec::new(),
    }
}

fn object(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

fn loose_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Order two column values: timestamps chronologically, numbers numerically
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl DataProvider for MemoryBackend {
    async fn select(&self, query: &Query) -> SyncResult<Vec<Row>> {
        let delay = self.lock().select_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.take_failure(&query.table)?;
        let mut rows: Vec<Row> = state
            .tables
            .get(&query.table)
            .into_iter()
            .flatten()
            .filter(|row| query.filters.iter().all(|f| f.matches(row)))
            .cloned()
            .collect();

        if let Some(ref order) = query.order {
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }

        if let Some((offset, limit)) = query.range {
            rows = rows.into_iter().skip(offset).take(limit).collect();
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Row) -> SyncResult<Row> {
        self.lock().insert(table, row)
    }

    async fn upsert(&self, table: &str, row: Row) -> SyncResult<Row> {
        let mut state = self.lock();
        let existing_id = match row.get("id") {
            Some(id) if state.find(table, id).is_some() => Some(id.clone()),
            _ => None,
        };
        match existing_id {
            Some(id) => {
                let updated = state.update(table, &[Filter::Eq("id".to_string(), id)], &row)?;
                updated
                    .into_iter()
                    .next()
                    .ok_or_else(|| SyncError::NotFound(format!("{} row vanished", table)))
            }
            None => state.insert(table, row),
        }
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> SyncResult<Vec<Row>> {
        self.lock().update(table, filters, &patch)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> SyncResult<usize> {
        self.lock().delete(table, filters)
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> SyncResult<usize> {
        let mut state = self.lock();
        state.take_failure(table)?;
        Ok(state
            .tables
            .get(table)
            .into_iter()
            .flatten()
            .filter(|row| filters.iter().all(|f| f.matches(row)))
            .count())
    }
}

#[async_trait]
impl AuthProvider for MemoryBackend {
    async fn get_session(&self) -> SyncResult<Option<AuthSession>> {
        Ok(self.lock().session.clone())
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthChange> {
        self.auth_tx.subscribe()
    }

    async fn sign_in(&self, email: &str, password: &str) -> SyncResult<AuthSession> {
        let session = {
            let mut state = self.lock();
            let account = state
                .accounts
                .get(email)
                .filter(|account| account.password == password)
                .ok_or_else(|| {
                    SyncError::AuthRequired("Invalid login credentials".to_string())
                })?;
            let session = AuthSession {
                user: account.user.clone(),
                access_token: Uuid::new_v4().to_string(),
                refresh_token: Some(Uuid::new_v4().to_string()),
                expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            };
            state.session = Some(session.clone());
            session
        };
        let _ = self.auth_tx.send(AuthChange {
            event: AuthEvent::SignedIn,
            session: Some(session.clone()),
        });
        Ok(session)
    }

    async fn sign_out(&self) -> SyncResult<()> {
        let had_session = self.lock().session.take().is_some();
        if had_session {
            let _ = self.auth_tx.send(AuthChange {
                event: AuthEvent::SignedOut,
                session: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RealtimeProvider for MemoryBackend {
    async fn subscribe(
        &self,
        spec: ChannelSpec,
        sink: mpsc::Sender<ChangeEvent>,
    ) -> SyncResult<ChannelHandle> {
        let delay = self.lock().subscribe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (status, state_rx) = ChannelStatus::new(&spec.name);
        let status = Arc::new(status);
        let (command_tx, mut command_rx) = mpsc::channel(4);
        let name = spec.name.clone();

        let id = {
            let mut state = self.lock();
            state.take_failure(&format!("realtime:{}", spec.name))?;
            state.next_subscription += 1;
            let id = state.next_subscription;
            status.advance(ChannelState::Subscribing);
            if state.connected {
                status.advance(ChannelState::Active);
            } else {
                status.advance(ChannelState::Reconnecting);
            }
            state.subscriptions.push(Subscription {
                id,
                spec,
                sink,
                status: status.clone(),
            });
            id
        };
        debug!("Memory channel {} subscribed", name);

        let backend = self.clone();
        tokio::spawn(async move {
            // Unsubscribe command or a dropped handle both end the channel
            let _ = command_rx.recv().await;
            backend.unsubscribe(id);
        });

        Ok(ChannelHandle::new(&name, command_tx, state_rx))
    }
}

#[async_trait]
impl ObjectStorage for MemoryBackend {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> SyncResult<String> {
        let mut state = self.lock();
        state.take_failure("storage")?;
        state
            .objects
            .insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(path.to_string())
    }

    fn public_url(&self, path: &str) -> String {
        format!("memory://posts/{}", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelFilter;
    use crate::models::ListName;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_generates_columns() {
        let backend = MemoryBackend::new();
        let post = backend
            .insert("posts", row(json!({"user_id": "u1", "content": "hi"})))
            .await
            .unwrap();
        assert!(post["id"].is_number());
        assert_eq!(post["like_count"], 0);
        assert!(post["created_at"].is_string());

        let msg = backend
            .insert("messages", row(json!({"sender_id": "a", "receiver_id": "b"})))
            .await
            .unwrap();
        assert!(msg["id"].is_string());
        assert!(msg["read_at"].is_null());
    }

    #[tokio::test]
    async fn test_unique_constraint_is_conflict() {
        let backend = MemoryBackend::new();
        backend.seed("posts", vec![row(json!({"id": 1, "user_id": "u2"}))]);
        let like = row(json!({"post_id": "1", "user_id": "u1"}));
        backend.insert("likes", like.clone()).await.unwrap();
        let err = backend.insert("likes", like).await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_missing_parent_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend
            .insert("likes", row(json!({"post_id": 42, "user_id": "u1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        let err = backend
            .insert("comments", row(json!({"post_id": 42, "user_id": "u1", "content": "hi"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert!(backend.rows("likes").is_empty());
        assert!(backend.rows("comments").is_empty());
    }

    #[tokio::test]
    async fn test_like_trigger_updates_counter() {
        let backend = MemoryBackend::new();
        let post = backend
            .insert("posts", row(json!({"user_id": "u1", "content": "hi"})))
            .await
            .unwrap();
        let post_id = post["id"].clone();

        backend
            .insert("likes", row(json!({"post_id": post_id, "user_id": "u2"})))
            .await
            .unwrap();
        let stored = backend.rows("posts");
        assert_eq!(stored[0]["like_count"], 1);
        assert_eq!(backend.rows("notifications").len(), 1);

        backend
            .delete(
                "likes",
                &[Filter::eq("post_id", post_id.clone()), Filter::eq("user_id", "u2")],
            )
            .await
            .unwrap();
        assert_eq!(backend.rows("posts")[0]["like_count"], 0);
    }

    #[tokio::test]
    async fn test_select_orders_and_ranges() {
        let backend = MemoryBackend::new();
        for i in 0..5 {
            backend.seed(
                "posts",
                vec![row(json!({
                    "user_id": "u1",
                    "content": format!("{}", i),
                    "created_at": format!("2025-03-01T10:00:0{}Z", i),
                }))],
            );
        }
        let query = Query::table("posts").order_by("created_at", false).range(1, 2);
        let rows = backend.select(&query).await.unwrap();
        let contents: Vec<_> = rows.iter().map(|r| r["content"].clone()).collect();
        assert_eq!(contents, vec![json!("3"), json!("2")]);
    }

    #[tokio::test]
    async fn test_count_applies_filters() {
        let backend = MemoryBackend::new();
        backend.seed(
            "user_follows",
            vec![
                row(json!({"follower_id": "a", "following_id": "b"})),
                row(json!({"follower_id": "c", "following_id": "b"})),
                row(json!({"follower_id": "b", "following_id": "a"})),
            ],
        );
        let followers = [Filter::eq("following_id", "b")];
        assert_eq!(backend.count("user_follows", &followers).await.unwrap(), 2);
        assert_eq!(backend.count("user_follows", &[]).await.unwrap(), 3);
        assert_eq!(backend.count("missing", &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let backend = MemoryBackend::new();
        backend.fail_next("posts", SyncError::Network("offline".into()));
        assert!(backend.select(&Query::table("posts")).await.is_err());
        assert!(backend.select(&Query::table("posts")).await.is_ok());
    }

    #[tokio::test]
    async fn test_realtime_fan_out_respects_filter() {
        let backend = MemoryBackend::new();
        let (tx, mut rx) = mpsc::channel(8);
        let spec = ChannelSpec::new("notifications-u1", ListName::Notifications)
            .with_filter(ChannelFilter::eq("receiver_id", "u1"));
        let handle = backend.subscribe(spec, tx).await.unwrap();
        assert_eq!(handle.state(), ChannelState::Active);

        backend
            .insert("notifications", row(json!({"receiver_id": "u2", "type": "like"})))
            .await
            .unwrap();
        backend
            .insert("notifications", row(json!({"receiver_id": "u1", "type": "like"})))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Insert);
        assert_eq!(event.new_row["receiver_id"], "u1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropping_handle_closes_channel() {
        let backend = MemoryBackend::new();
        let (tx, _rx) = mpsc::channel(8);
        let handle = backend
            .subscribe(ChannelSpec::new("posts", ListName::Feed), tx)
            .await
            .unwrap();
        let mut state_rx = handle.watch_state();
        assert_eq!(backend.channel_count(), 1);

        drop(handle);
        state_rx
            .wait_for(|state| *state == ChannelState::Terminated)
            .await
            .unwrap();
        assert_eq!(backend.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_sign_in_broadcasts() {
        let backend = MemoryBackend::new();
        let user = backend.register("a@example.com", "secret", "alice");
        let mut rx = backend.on_auth_state_change();

        assert!(backend.sign_in("a@example.com", "wrong").await.is_err());
        let session = backend.sign_in("a@example.com", "secret").await.unwrap();
        assert_eq!(session.user, user);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.event, AuthEvent::SignedIn);

        backend.sign_out().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event, AuthEvent::SignedOut);
        assert!(backend.get_session().await.unwrap().is_none());
    }
}
