//! Realtime reconciler
//!
//! Merges change events pushed by realtime channels into the session store.
//!
//! - INSERT whose correlation key matches a pending optimistic insert replaces
//!   the provisional entry with the server row; any other INSERT is merged by id.
//! - UPDATE patches the entry with the fields present in the row. Server
//!   counts are absolute, so they overwrite optimistic increments instead of
//!   adding to them. An UPDATE for an id not yet in the list is parked and
//!   retried once after a delay.
//! - DELETE removes the entry.
//!
//! Rows that fail to map are logged and dropped.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::models::{Comment, Community, FeedEntry, ListName, Message, NotificationEntry};
use crate::optimistic::{CorrelationKey, OptimisticLedger};
use crate::provider::{ChangeEvent, EventType, Row};
use crate::rows;
use crate::store::{Listed, SessionStore};

/// What happened to one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New entry added
    Inserted,
    /// Matched a pending optimistic insert and replaced it
    Reconciled { provisional_id: String },
    /// Existing entry changed
    Updated,
    /// Target not present yet; parked for a retry
    Deferred,
    Removed,
    /// Not for this list, or nothing to do
    Ignored,
    /// Row could not be mapped
    Dropped,
}

#[derive(Debug, Clone)]
struct DeferredUpdate {
    list: ListName,
    event: ChangeEvent,
    due: DateTime<Utc>,
}

/// Merges realtime events and owns the optimistic ledger
#[derive(Debug)]
pub struct Reconciler {
    ledger: OptimisticLedger,
    deferred: VecDeque<DeferredUpdate>,
    max_deferred: usize,
    retry_delay: Duration,
}

impl Reconciler {
    pub fn new(max_deferred: usize, retry_delay: std::time::Duration) -> Self {
        Self {
            ledger: OptimisticLedger::new(),
            deferred: VecDeque::new(),
            max_deferred,
            retry_delay: Duration::from_std(retry_delay).unwrap_or_else(|_| Duration::seconds(2)),
        }
    }

    pub fn ledger(&self) -> &OptimisticLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut OptimisticLedger {
        &mut self.ledger
    }

    /// Number of parked updates
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Forget pending edits and parked updates (session teardown)
    pub fn clear(&mut self) {
        self.ledger.clear();
        self.deferred.clear();
    }

    /// Merge one event into `list`
    pub fn apply(
        &mut self,
        store: &mut SessionStore,
        list: &ListName,
        event: &ChangeEvent,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        if event.table != list.table() {
            debug!("Ignoring {} event on {} for {}", event.event_type, event.table, list);
            return MergeOutcome::Ignored;
        }

        let row = match event.event_type {
            EventType::Delete => &event.old_row,
            _ => &event.new_row,
        };
        if !belongs_to(list, row, store.user_id()) {
            return MergeOutcome::Ignored;
        }

        let result = match event.event_type {
            EventType::Insert => self.insert(store, list, row),
            EventType::Update => self.update(store, list, row, true, event, now),
            EventType::Delete => Ok(delete(store, list, row)),
        };

        match result {
            Ok(outcome) => {
                debug!("{} on {}: {:?}", event.event_type, list, outcome);
                outcome
            }
            Err(e) => {
                warn!("Dropping {} event for {}: {}", event.event_type, list, e);
                MergeOutcome::Dropped
            }
        }
    }

    /// Retry parked updates that are due; each gets one retry, then it is dropped
    ///
    /// Returns the number of updates that found their entry.
    pub fn retry_deferred(&mut self, store: &mut SessionStore, now: DateTime<Utc>) -> usize {
        let mut applied = 0;
        let mut waiting = VecDeque::with_capacity(self.deferred.len());

        while let Some(parked) = self.deferred.pop_front() {
            if parked.due > now {
                waiting.push_back(parked);
                continue;
            }
            match self.update(store, &parked.list, &parked.event.new_row, false, &parked.event, now) {
                Ok(MergeOutcome::Updated) => applied += 1,
                Ok(_) => debug!(
                    "Dropping update for absent entry in {} after retry",
                    parked.list
                ),
                Err(e) => warn!("Dropping parked update for {}: {}", parked.list, e),
            }
        }

        self.deferred = waiting;
        applied
    }

    fn insert(
        &mut self,
        store: &mut SessionStore,
        list: &ListName,
        row: &Row,
    ) -> SyncResult<MergeOutcome> {
        Ok(match list {
            ListName::Feed => {
                let entry = rows::feed_entry(row)?;
                let key = CorrelationKey::insert(list, &entry.author.id, &entry.content);
                self.insert_entry(store, list, entry, key)
            }
            ListName::Comments(_) => {
                let entry = rows::comment(row)?;
                let key = CorrelationKey::insert(list, &entry.author.id, &entry.content);
                self.insert_entry(store, list, entry, key)
            }
            ListName::Messages(_) => {
                let entry = rows::message(row)?;
                let key = CorrelationKey::insert(list, &entry.sender_id, &entry.content);
                self.insert_entry(store, list, entry, key)
            }
            ListName::Notifications => {
                self.insert_entry(store, list, rows::notification(row)?, None)
            }
            ListName::Communities => self.insert_entry(store, list, rows::community(row)?, None),
        })
    }

    fn insert_entry<T: Listed>(
        &mut self,
        store: &mut SessionStore,
        list: &ListName,
        entry: T,
        key: Option<CorrelationKey>,
    ) -> MergeOutcome {
        let claimed = key.and_then(|key| self.ledger.claim(&key));
        if let Some(provisional_id) = claimed.and_then(|edit| edit.provisional_id) {
            store.confirm_pending(list, &provisional_id, entry);
            return MergeOutcome::Reconciled { provisional_id };
        }

        if store.prepend_entries(list, vec![entry]) > 0 {
            MergeOutcome::Inserted
        } else {
            MergeOutcome::Updated
        }
    }

    fn update(
        &mut self,
        store: &mut SessionStore,
        list: &ListName,
        row: &Row,
        may_defer: bool,
        event: &ChangeEvent,
        now: DateTime<Utc>,
    ) -> SyncResult<MergeOutcome> {
        let Some(id) = rows::row_id(row) else {
            return Err(crate::error::SyncError::malformed("row", "update without id"));
        };

        let found = match list {
            ListName::Feed => {
                store.mutate_entry::<FeedEntry>(list, &id, &rows::feed_patch(row)?)
            }
            ListName::Comments(_) => {
                store.mutate_entry::<Comment>(list, &id, &rows::comment_patch(row)?)
            }
            ListName::Notifications => {
                store.mutate_entry::<NotificationEntry>(list, &id, &rows::notification_patch(row)?)
            }
            ListName::Messages(_) => {
                store.mutate_entry::<Message>(list, &id, &rows::message_patch(row)?)
            }
            ListName::Communities => {
                store.mutate_entry::<Community>(list, &id, &rows::community_patch(row)?)
            }
        };

        if found {
            self.ledger.note_server_update(list, &id);
            return Ok(MergeOutcome::Updated);
        }
        if !may_defer {
            return Ok(MergeOutcome::Ignored);
        }

        if self.deferred.len() >= self.max_deferred {
            if let Some(evicted) = self.deferred.pop_front() {
                warn!("Deferred update buffer full; dropping oldest for {}", evicted.list);
            }
        }
        if self.max_deferred == 0 {
            return Ok(MergeOutcome::Ignored);
        }
        self.deferred.push_back(DeferredUpdate {
            list: list.clone(),
            event: event.clone(),
            due: now + self.retry_delay,
        });
        Ok(MergeOutcome::Deferred)
    }
}

fn delete(store: &mut SessionStore, list: &ListName, row: &Row) -> MergeOutcome {
    let Some(id) = rows::row_id(row) else {
        return MergeOutcome::Ignored;
    };
    let removed = match list {
        ListName::Feed => store.remove_entry::<FeedEntry>(list, &id).is_some(),
        ListName::Comments(_) => store.remove_entry::<Comment>(list, &id).is_some(),
        ListName::Notifications => store.remove_entry::<NotificationEntry>(list, &id).is_some(),
        ListName::Messages(_) => store.remove_entry::<Message>(list, &id).is_some(),
        ListName::Communities => store.remove_entry::<Community>(list, &id).is_some(),
    };
    if removed {
        MergeOutcome::Removed
    } else {
        MergeOutcome::Ignored
    }
}

/// Check whether a row belongs to a keyed list
///
/// Channels can only filter on a single column, so rows of other posts or
/// other conversations may arrive. Fields missing from the row (partial
/// UPDATE or DELETE payloads) do not exclude it.
fn belongs_to(list: &ListName, row: &Row, me: Option<&str>) -> bool {
    let field_is = |key: &str, expected: &str| match row.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s == expected),
        Some(Value::Number(n)) => Some(n.to_string() == expected),
        Some(_) => Some(false),
    };

    match list {
        ListName::Comments(post_id) => field_is("post_id", post_id) != Some(false),
        ListName::Messages(peer) => {
            let Some(me) = me else {
                return false;
            };
            let sender_me = field_is("sender_id", me);
            let receiver_me = field_is("receiver_id", me);
            let sender_peer = field_is("sender_id", peer);
            let receiver_peer = field_is("receiver_id", peer);
            if sender_me.is_none() && receiver_me.is_none() {
                return true;
            }
            (sender_me == Some(true) && receiver_peer == Some(true))
                || (sender_peer == Some(true) && receiver_me == Some(true))
        }
        ListName::Notifications => match me {
            Some(me) => field_is("receiver_id", me) != Some(false),
            None => false,
        },
        ListName::Feed | ListName::Communities => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthorRef, User};
    use crate::optimistic::PendingEdit;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn post_row(id: &str, likes: u32, at: &str) -> Row {
        row(json!({
            "id": id, "user_id": "u2", "content": format!("post {}", id),
            "like_count": likes, "created_at": at
        }))
    }

    fn setup() -> (Reconciler, SessionStore) {
        let mut store = SessionStore::new();
        store.set_session(Some(User::new("me")), None);
        (
            Reconciler::new(4, std::time::Duration::from_secs(2)),
            store,
        )
    }

    fn feed_ids(store: &SessionStore) -> Vec<String> {
        store
            .entries::<FeedEntry>(&ListName::Feed)
            .iter()
            .map(|p| p.id.clone())
            .collect()
    }

    #[test]
    fn test_insert_prepends_and_dedups() {
        let (mut r, mut store) = setup();
        let now = Utc::now();
        let event = ChangeEvent::insert("posts", post_row("1", 0, "2025-03-01T10:00:00Z"));
        assert_eq!(r.apply(&mut store, &ListName::Feed, &event, now), MergeOutcome::Inserted);
        assert_eq!(r.apply(&mut store, &ListName::Feed, &event, now), MergeOutcome::Updated);
        assert_eq!(store.len(&ListName::Feed), 1);
    }

    #[test]
    fn test_insert_matching_pending_edit_reconciles() {
        let (mut r, mut store) = setup();
        let provisional = FeedEntry {
            id: "tmp-1".to_string(),
            author: AuthorRef::new("me"),
            content: "hello".to_string(),
            media: Vec::new(),
            like_count: 0,
            comment_count: 0,
            user_has_liked: false,
            community_id: None,
            created_at: Utc::now(),
        };
        store.insert_pending(&ListName::Feed, provisional);
        r.ledger_mut().record(PendingEdit {
            key: CorrelationKey::insert(&ListName::Feed, "me", "hello").unwrap(),
            list: ListName::Feed,
            provisional_id: Some("tmp-1".to_string()),
            counts_on: None,
            server_updated: false,
            started_at: Utc::now(),
        });

        let echo = ChangeEvent::insert(
            "posts",
            row(json!({
                "id": "42", "user_id": "me", "content": "hello",
                "created_at": "2025-03-01T10:00:00Z"
            })),
        );
        let outcome = r.apply(&mut store, &ListName::Feed, &echo, Utc::now());
        assert_eq!(
            outcome,
            MergeOutcome::Reconciled {
                provisional_id: "tmp-1".to_string()
            }
        );
        assert_eq!(feed_ids(&store), vec!["42"]);
        assert!(r.ledger().is_empty());
    }

    #[test]
    fn test_update_counts_are_absolute_and_keep_liked_flag() {
        let (mut r, mut store) = setup();
        let now = Utc::now();
        let mut post = rows::feed_entry(&post_row("5", 3, "2025-03-01T10:00:00Z")).unwrap();
        // Optimistic like already applied: 3 -> 4
        post.like_count = 4;
        post.user_has_liked = true;
        store.append_entries(&ListName::Feed, vec![post]);

        let confirmed = ChangeEvent::update("posts", row(json!({"id": "5", "like_count": 4})));
        assert_eq!(r.apply(&mut store, &ListName::Feed, &confirmed, now), MergeOutcome::Updated);

        let post = store.get::<FeedEntry>(&ListName::Feed, "5").unwrap();
        assert_eq!(post.like_count, 4);
        assert!(post.user_has_liked);
    }

    #[test]
    fn test_update_for_absent_entry_is_deferred_then_retried() {
        let (mut r, mut store) = setup();
        let now = Utc::now();
        let update = ChangeEvent::update("posts", row(json!({"id": "9", "like_count": 7})));
        assert_eq!(r.apply(&mut store, &ListName::Feed, &update, now), MergeOutcome::Deferred);
        assert_eq!(r.deferred_len(), 1);

        // Not due yet
        assert_eq!(r.retry_deferred(&mut store, now), 0);
        assert_eq!(r.deferred_len(), 1);

        store.append_entries(
            &ListName::Feed,
            vec![rows::feed_entry(&post_row("9", 6, "2025-03-01T10:00:00Z")).unwrap()],
        );
        assert_eq!(r.retry_deferred(&mut store, now + Duration::seconds(3)), 1);
        assert_eq!(r.deferred_len(), 0);
        assert_eq!(store.get::<FeedEntry>(&ListName::Feed, "9").unwrap().like_count, 7);
    }

    #[test]
    fn test_deferred_update_dropped_after_single_retry() {
        let (mut r, mut store) = setup();
        let now = Utc::now();
        let update = ChangeEvent::update("posts", row(json!({"id": "9", "like_count": 7})));
        r.apply(&mut store, &ListName::Feed, &update, now);
        assert_eq!(r.retry_deferred(&mut store, now + Duration::seconds(3)), 0);
        assert_eq!(r.deferred_len(), 0);
    }

    #[test]
    fn test_deferred_buffer_is_bounded() {
        let (mut r, mut store) = setup();
        let now = Utc::now();
        for i in 0..10 {
            let update = ChangeEvent::update("posts", row(json!({"id": i, "like_count": 1})));
            r.apply(&mut store, &ListName::Feed, &update, now);
        }
        assert_eq!(r.deferred_len(), 4);
    }

    #[test]
    fn test_delete_removes() {
        let (mut r, mut store) = setup();
        let now = Utc::now();
        let insert = ChangeEvent::insert("posts", post_row("1", 0, "2025-03-01T10:00:00Z"));
        r.apply(&mut store, &ListName::Feed, &insert, now);
        let delete = ChangeEvent::delete("posts", row(json!({"id": "1"})));
        assert_eq!(r.apply(&mut store, &ListName::Feed, &delete, now), MergeOutcome::Removed);
        assert_eq!(r.apply(&mut store, &ListName::Feed, &delete, now), MergeOutcome::Ignored);
    }

    #[test]
    fn test_malformed_row_is_dropped() {
        let (mut r, mut store) = setup();
        let event = ChangeEvent::insert("posts", row(json!({"id": "1", "user_id": "u2"})));
        assert_eq!(
            r.apply(&mut store, &ListName::Feed, &event, Utc::now()),
            MergeOutcome::Dropped
        );
        assert_eq!(store.len(&ListName::Feed), 0);
    }

    #[test]
    fn test_rows_of_other_lists_are_ignored() {
        let (mut r, mut store) = setup();
        let now = Utc::now();

        let other_post = ChangeEvent::insert(
            "comments",
            row(json!({
                "id": "c1", "post_id": "6", "user_id": "u2", "content": "x",
                "created_at": "2025-03-01T10:00:00Z"
            })),
        );
        let comments = ListName::Comments("5".into());
        assert_eq!(r.apply(&mut store, &comments, &other_post, now), MergeOutcome::Ignored);

        let other_chat = ChangeEvent::insert(
            "messages",
            row(json!({
                "id": "m1", "sender_id": "u3", "receiver_id": "me", "content": "x",
                "created_at": "2025-03-01T10:00:00Z"
            })),
        );
        let chat = ListName::Messages("u2".into());
        assert_eq!(r.apply(&mut store, &chat, &other_chat, now), MergeOutcome::Ignored);

        let wrong_table = ChangeEvent::insert("posts", post_row("1", 0, "2025-03-01T10:00:00Z"));
        assert_eq!(r.apply(&mut store, &chat, &wrong_table, now), MergeOutcome::Ignored);
    }

    #[test]
    fn test_chat_message_from_peer_is_inserted() {
        let (mut r, mut store) = setup();
        let event = ChangeEvent::insert(
            "messages",
            row(json!({
                "id": "m1", "sender_id": "u2", "receiver_id": "me", "content": "hey",
                "created_at": "2025-03-01T10:00:00Z"
            })),
        );
        let chat = ListName::Messages("u2".into());
        assert_eq!(r.apply(&mut store, &chat, &event, Utc::now()), MergeOutcome::Inserted);
        assert_eq!(store.len(&chat), 1);
    }

    #[test]
    fn test_clear_drops_everything() {
        let (mut r, mut store) = setup();
        let update = ChangeEvent::update("posts", row(json!({"id": "9", "like_count": 7})));
        r.apply(&mut store, &ListName::Feed, &update, Utc::now());
        r.clear();
        assert_eq!(r.deferred_len(), 0);
        assert!(r.ledger().is_empty());
    }
}
