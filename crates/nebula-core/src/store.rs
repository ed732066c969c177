//! Session store
//!
//! The single in-memory container for cross-screen state: the signed-in
//! identity, the cached profile, theme, joined communities and every entry
//! collection. Collections are only reachable through the operations below,
//! and every mutation publishes a `StoreEvent` so views can re-render.
//!
//! The store performs no I/O besides writing the persisted subset
//! (identity, profile, theme, joined communities) through a `StateFile`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::list::{Entry, EntryList};
use crate::models::{
    Comment, Community, FeedEntry, ListName, Message, NotificationEntry, NotificationPatch,
    Profile, ProfilePatch, Session, Theme, User,
};
use crate::persist::{PersistedState, StateFile};

const EVENT_CAPACITY: usize = 256;

/// Change notification published after every store mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Identity changed (sign-in or restore)
    SessionChanged { authenticated: bool },
    /// Session torn down and all collections emptied
    SessionCleared,
    /// Entries of a list changed
    ListChanged(ListName),
    ProfileChanged,
    ThemeChanged(Theme),
    CommunitiesChanged,
    FollowingChanged,
}

/// All entry collections
#[derive(Debug)]
pub struct Collections {
    feed: EntryList<FeedEntry>,
    comments: HashMap<String, EntryList<Comment>>,
    notifications: EntryList<NotificationEntry>,
    messages: HashMap<String, EntryList<Message>>,
    communities: EntryList<Community>,
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            feed: EntryList::new(ListName::Feed.order()),
            comments: HashMap::new(),
            notifications: EntryList::new(ListName::Notifications.order()),
            messages: HashMap::new(),
            communities: EntryList::new(ListName::Communities.order()),
        }
    }
}

impl Collections {
    fn len(&self, list: &ListName) -> usize {
        match list {
            ListName::Feed => self.feed.len(),
            ListName::Comments(post) => self.comments.get(post).map_or(0, EntryList::len),
            ListName::Notifications => self.notifications.len(),
            ListName::Messages(peer) => self.messages.get(peer).map_or(0, EntryList::len),
            ListName::Communities => self.communities.len(),
        }
    }

    fn clear(&mut self) {
        self.feed.clear();
        self.comments.clear();
        self.notifications.clear();
        self.messages.clear();
        self.communities.clear();
    }
}

/// Entity types that live in a named store list
///
/// Lookups with a list name of the wrong kind return `None`.
pub trait Listed: Entry {
    fn list<'a>(collections: &'a Collections, name: &ListName) -> Option<&'a EntryList<Self>>;

    fn list_mut<'a>(
        collections: &'a mut Collections,
        name: &ListName,
    ) -> Option<&'a mut EntryList<Self>>;
}

impl Listed for FeedEntry {
    fn list<'a>(c: &'a Collections, name: &ListName) -> Option<&'a EntryList<Self>> {
        matches!(name, ListName::Feed).then_some(&c.feed)
    }

    fn list_mut<'a>(c: &'a mut Collections, name: &ListName) -> Option<&'a mut EntryList<Self>> {
        matches!(name, ListName::Feed).then_some(&mut c.feed)
    }
}

impl Listed for Comment {
    fn list<'a>(c: &'a Collections, name: &ListName) -> Option<&'a EntryList<Self>> {
        match name {
            ListName::Comments(post) => c.comments.get(post),
            _ => None,
        }
    }

    fn list_mut<'a>(c: &'a mut Collections, name: &ListName) -> Option<&'a mut EntryList<Self>> {
        match name {
            ListName::Comments(post) => Some(
                c.comments
                    .entry(post.clone())
                    .or_insert_with(|| EntryList::new(name.order())),
            ),
            _ => None,
        }
    }
}

impl Listed for NotificationEntry {
    fn list<'a>(c: &'a Collections, name: &ListName) -> Option<&'a EntryList<Self>> {
        matches!(name, ListName::Notifications).then_some(&c.notifications)
    }

    fn list_mut<'a>(c: &'a mut Collections, name: &ListName) -> Option<&'a mut EntryList<Self>> {
        matches!(name, ListName::Notifications).then_some(&mut c.notifications)
    }
}

impl Listed for Message {
    fn list<'a>(c: &'a Collections, name: &ListName) -> Option<&'a EntryList<Self>> {
        match name {
            ListName::Messages(peer) => c.messages.get(peer),
            _ => None,
        }
    }

    fn list_mut<'a>(c: &'a mut Collections, name: &ListName) -> Option<&'a mut EntryList<Self>> {
        match name {
            ListName::Messages(peer) => Some(
                c.messages
                    .entry(peer.clone())
                    .or_insert_with(|| EntryList::new(name.order())),
            ),
            _ => None,
        }
    }
}

impl Listed for Community {
    fn list<'a>(c: &'a Collections, name: &ListName) -> Option<&'a EntryList<Self>> {
        matches!(name, ListName::Communities).then_some(&c.communities)
    }

    fn list_mut<'a>(c: &'a mut Collections, name: &ListName) -> Option<&'a mut EntryList<Self>> {
        matches!(name, ListName::Communities).then_some(&mut c.communities)
    }
}

/// Process-wide session state
#[derive(Debug)]
pub struct SessionStore {
    session: Session,
    theme: Theme,
    joined_communities: Vec<String>,
    /// Users the signed-in user follows; fetched per session
    following: Vec<String>,
    collections: Collections,
    /// Advanced on every identity change; stale completions compare against it
    epoch: u64,
    events: broadcast::Sender<StoreEvent>,
    state_file: StateFile,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Create an empty, non-persistent store
    pub fn new() -> Self {
        Self::with_state_file(StateFile::new())
    }

    /// Create a store backed by a state file, restoring the persisted subset
    ///
    /// A restored identity is not authenticated until a session is confirmed
    /// with `set_session`.
    pub fn with_state_file(state_file: StateFile) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let restored = state_file.state().clone();
        Self {
            session: Session {
                current_user: restored.user,
                current_profile: restored.profile,
                authenticated: false,
            },
            theme: restored.theme,
            joined_communities: restored.joined_communities,
            following: Vec::new(),
            collections: Collections::default(),
            epoch: 0,
            events,
            state_file,
        }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Id of the authenticated user
    pub fn user_id(&self) -> Option<&str> {
        self.session.user_id()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn theme(&self) -> Theme {
        self.theme
    }

    pub fn joined_communities(&self) -> &[String] {
        &self.joined_communities
    }

    pub fn is_member(&self, community_id: &str) -> bool {
        self.joined_communities.iter().any(|id| id == community_id)
    }

    pub fn following(&self) -> &[String] {
        &self.following
    }

    pub fn is_following(&self, user_id: &str) -> bool {
        self.following.iter().any(|id| id == user_id)
    }

    // ==================== Session ====================

    /// Replace the identity atomically
    ///
    /// An absent user yields the unauthenticated state (same as
    /// `clear_session`). Signing in as a different user than the one held
    /// drops every collection and advances the epoch.
    pub fn set_session(&mut self, user: Option<User>, profile: Option<Profile>) {
        let Some(user) = user else {
            self.clear_session();
            return;
        };

        let same_user = self.session.authenticated
            && self
                .session
                .current_user
                .as_ref()
                .is_some_and(|current| current.id == user.id);

        if !same_user {
            self.epoch += 1;
            self.collections.clear();
            self.following.clear();
            let restored_same = self
                .session
                .current_user
                .as_ref()
                .is_some_and(|current| current.id == user.id);
            if !restored_same {
                self.joined_communities.clear();
            }
            info!("Session started for user {} (epoch {})", user.id, self.epoch);
        }

        let profile = profile.or_else(|| {
            self.session
                .current_profile
                .take()
                .filter(|p| p.id == user.id)
        });

        self.session = Session {
            current_user: Some(user),
            current_profile: profile,
            authenticated: true,
        };
        self.persist();
        self.emit(StoreEvent::SessionChanged {
            authenticated: true,
        });
    }

    /// Wipe identity and all derived collections
    ///
    /// Idempotent. Always advances the epoch so late callbacks of the old
    /// session are discarded.
    pub fn clear_session(&mut self) {
        self.epoch += 1;
        let had_user = self.session.current_user.is_some();
        self.session = Session::default();
        self.joined_communities.clear();
        self.following.clear();
        self.collections.clear();
        self.persist();
        if had_user {
            info!("Session cleared (epoch {})", self.epoch);
        }
        self.emit(StoreEvent::SessionCleared);
    }

    /// Apply a partial profile update; false when no profile is loaded
    pub fn update_profile(&mut self, patch: &ProfilePatch) -> bool {
        let Some(ref mut profile) = self.session.current_profile else {
            return false;
        };
        profile.apply(patch);
        self.persist();
        self.emit(StoreEvent::ProfileChanged);
        true
    }

    /// Replace the cached profile
    pub fn set_profile(&mut self, profile: Profile) {
        self.session.current_profile = Some(profile);
        self.persist();
        self.emit(StoreEvent::ProfileChanged);
    }

    /// Flip the theme and return the new one
    pub fn toggle_theme(&mut self) -> Theme {
        self.set_theme(self.theme.toggled());
        self.theme
    }

    pub fn set_theme(&mut self, theme: Theme) {
        if self.theme == theme {
            return;
        }
        self.theme = theme;
        self.persist();
        self.emit(StoreEvent::ThemeChanged(theme));
    }

    /// Add a community to the joined list; false if already joined
    pub fn join_community(&mut self, community_id: &str) -> bool {
        if self.is_member(community_id) {
            return false;
        }
        self.joined_communities.push(community_id.to_string());
        self.persist();
        self.emit(StoreEvent::CommunitiesChanged);
        true
    }

    /// Remove a community from the joined list; false if not joined
    pub fn leave_community(&mut self, community_id: &str) -> bool {
        let before = self.joined_communities.len();
        self.joined_communities.retain(|id| id != community_id);
        if self.joined_communities.len() == before {
            return false;
        }
        self.persist();
        self.emit(StoreEvent::CommunitiesChanged);
        true
    }

    /// Replace the joined list (after fetching memberships)
    pub fn set_joined_communities(&mut self, ids: Vec<String>) {
        if self.joined_communities == ids {
            return;
        }
        self.joined_communities = ids;
        self.persist();
        self.emit(StoreEvent::CommunitiesChanged);
    }

    /// Add a user to the followed list; false if already followed
    pub fn follow(&mut self, user_id: &str) -> bool {
        if self.is_following(user_id) {
            return false;
        }
        self.following.push(user_id.to_string());
        self.emit(StoreEvent::FollowingChanged);
        true
    }

    /// Remove a user from the followed list; false if not followed
    pub fn unfollow(&mut self, user_id: &str) -> bool {
        let before = self.following.len();
        self.following.retain(|id| id != user_id);
        if self.following.len() == before {
            return false;
        }
        self.emit(StoreEvent::FollowingChanged);
        true
    }

    pub fn set_following(&mut self, ids: Vec<String>) {
        if self.following == ids {
            return;
        }
        self.following = ids;
        self.emit(StoreEvent::FollowingChanged);
    }

    // ==================== Collections ====================

    /// Entries of a list in display order
    pub fn entries<T: Listed>(&self, list: &ListName) -> &[T] {
        T::list(&self.collections, list)
            .map(EntryList::entries)
            .unwrap_or_default()
    }

    pub fn get<T: Listed>(&self, list: &ListName, id: &str) -> Option<&T> {
        T::list(&self.collections, list).and_then(|l| l.get(id))
    }

    pub fn contains<T: Listed>(&self, list: &ListName, id: &str) -> bool {
        self.get::<T>(list, id).is_some()
    }

    /// Check if an entry is a pending optimistic insert
    pub fn is_pending<T: Listed>(&self, list: &ListName, id: &str) -> bool {
        T::list(&self.collections, list).is_some_and(|l| l.is_pinned(id))
    }

    /// Number of entries in a list
    pub fn len(&self, list: &ListName) -> usize {
        self.collections.len(list)
    }

    /// Number of unread notifications
    pub fn unread_count(&self) -> usize {
        self.collections
            .notifications
            .entries()
            .iter()
            .filter(|n| n.is_unread())
            .count()
    }

    /// Partial update of exactly one entry; false if the id is absent
    pub fn mutate_entry<T: Listed>(&mut self, list: &ListName, id: &str, patch: &T::Patch) -> bool {
        let changed = self
            .existing_mut::<T>(list)
            .is_some_and(|l| l.mutate(id, patch));
        if changed {
            self.emit(StoreEvent::ListChanged(list.clone()));
        }
        changed
    }

    /// Merge entries at the newest end (realtime inserts)
    ///
    /// Returns the number of ids that were not present before.
    pub fn prepend_entries<T: Listed>(&mut self, list: &ListName, entries: Vec<T>) -> usize {
        self.merge(list, entries)
    }

    /// Merge a fetched page (pagination)
    pub fn append_entries<T: Listed>(&mut self, list: &ListName, entries: Vec<T>) -> usize {
        self.merge(list, entries)
    }

    /// Replace a list with a fresh first page, keeping pending inserts
    pub fn replace_entries<T: Listed>(&mut self, list: &ListName, entries: Vec<T>) {
        let Some(target) = T::list_mut(&mut self.collections, list) else {
            warn!("Ignoring replace on mismatched list {}", list);
            return;
        };
        target.replace(entries);
        debug!("Replaced {} ({} entries)", list, target.len());
        self.emit(StoreEvent::ListChanged(list.clone()));
    }

    pub fn remove_entry<T: Listed>(&mut self, list: &ListName, id: &str) -> Option<T> {
        let removed = self.existing_mut::<T>(list).and_then(|l| l.remove(id));
        if removed.is_some() {
            self.emit(StoreEvent::ListChanged(list.clone()));
        }
        removed
    }

    /// Insert an optimistic entry pinned to the newest end
    pub fn insert_pending<T: Listed>(&mut self, list: &ListName, entry: T) {
        let Some(target) = T::list_mut(&mut self.collections, list) else {
            warn!("Ignoring pending insert on mismatched list {}", list);
            return;
        };
        target.insert_pinned(entry);
        self.emit(StoreEvent::ListChanged(list.clone()));
    }

    /// Replace a pending entry by its confirmed server version
    ///
    /// Returns false when the provisional entry is gone (already confirmed,
    /// discarded, or wiped by a teardown); the confirmed row is still merged
    /// in the first case so it is never lost.
    pub fn confirm_pending<T: Listed>(
        &mut self,
        list: &ListName,
        provisional_id: &str,
        entry: T,
    ) -> bool {
        let Some(target) = T::list_mut(&mut self.collections, list) else {
            return false;
        };
        let was_pending = target.is_pinned(provisional_id);
        target.confirm(provisional_id, entry);
        self.emit(StoreEvent::ListChanged(list.clone()));
        was_pending
    }

    /// Drop a pending entry (rollback)
    pub fn discard_pending<T: Listed>(&mut self, list: &ListName, provisional_id: &str) -> bool {
        self.remove_entry::<T>(list, provisional_id).is_some()
    }

    /// Mark every unread notification as read, returning the ids changed
    pub fn mark_all_notifications_read(&mut self, at: DateTime<Utc>) -> Vec<String> {
        let mut changed = Vec::new();
        self.collections.notifications.mutate_all(|n| {
            if n.is_unread() {
                n.apply(&NotificationPatch {
                    read_at: Some(Some(at)),
                    body: None,
                });
                changed.push(n.id.clone());
            }
        });
        if !changed.is_empty() {
            self.emit(StoreEvent::ListChanged(ListName::Notifications));
        }
        changed
    }

    /// Empty one list
    pub fn clear_list(&mut self, list: &ListName) {
        match list {
            ListName::Feed => self.collections.feed.clear(),
            ListName::Comments(post) => {
                self.collections.comments.remove(post);
            }
            ListName::Notifications => self.collections.notifications.clear(),
            ListName::Messages(peer) => {
                self.collections.messages.remove(peer);
            }
            ListName::Communities => self.collections.communities.clear(),
        }
        self.emit(StoreEvent::ListChanged(list.clone()));
    }

    fn merge<T: Listed>(&mut self, list: &ListName, entries: Vec<T>) -> usize {
        if entries.is_empty() {
            return 0;
        }
        let Some(target) = T::list_mut(&mut self.collections, list) else {
            warn!("Ignoring merge on mismatched list {}", list);
            return 0;
        };
        let incoming = entries.len();
        let added = target.merge(entries);
        debug!("Merged {} entries into {} ({} new)", incoming, list, added);
        self.emit(StoreEvent::ListChanged(list.clone()));
        added
    }

    /// Mutable access without creating keyed lists
    fn existing_mut<T: Listed>(&mut self, list: &ListName) -> Option<&mut EntryList<T>> {
        let exists = match list {
            ListName::Comments(post) => self.collections.comments.contains_key(post),
            ListName::Messages(peer) => self.collections.messages.contains_key(peer),
            _ => true,
        };
        if exists {
            T::list_mut(&mut self.collections, list)
        } else {
            None
        }
    }

    fn persist(&mut self) {
        let state = PersistedState {
            user: self.session.current_user.clone(),
            profile: self.session.current_profile.clone(),
            theme: self.theme,
            joined_communities: self.joined_communities.clone(),
        };
        if let Err(e) = self.state_file.store(state) {
            warn!("Failed to persist session state: {:#}", e);
        }
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthorRef, FeedPatch};
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn post(id: &str, secs: i64) -> FeedEntry {
        FeedEntry {
            id: id.to_string(),
            author: AuthorRef::new("u1"),
            content: format!("post {}", id),
            media: Vec::new(),
            like_count: 0,
            comment_count: 0,
            user_has_liked: false,
            community_id: None,
            created_at: at(secs),
        }
    }

    fn notification(id: &str, secs: i64) -> NotificationEntry {
        NotificationEntry {
            id: id.to_string(),
            kind: "like".to_string(),
            sender_id: Some("u2".to_string()),
            post_id: None,
            comment_id: None,
            body: None,
            read_at: None,
            created_at: at(secs),
        }
    }

    fn signed_in() -> SessionStore {
        let mut store = SessionStore::new();
        store.set_session(Some(User::new("u1")), None);
        store
    }

    #[test]
    fn test_set_session_authenticates() {
        let store = signed_in();
        assert!(store.session().authenticated);
        assert_eq!(store.user_id(), Some("u1"));
        assert_eq!(store.epoch(), 1);
    }

    #[test]
    fn test_set_session_without_user_is_unauthenticated() {
        let mut store = signed_in();
        store.set_session(None, None);
        assert!(!store.session().authenticated);
        assert!(store.user_id().is_none());
    }

    #[test]
    fn test_same_user_keeps_collections_and_epoch() {
        let mut store = signed_in();
        store.prepend_entries(&ListName::Feed, vec![post("1", 1)]);
        store.set_session(Some(User::new("u1")), None);
        assert_eq!(store.len(&ListName::Feed), 1);
        assert_eq!(store.epoch(), 1);

        store.set_session(Some(User::new("u2")), None);
        assert_eq!(store.len(&ListName::Feed), 0);
        assert_eq!(store.epoch(), 2);
    }

    #[test]
    fn test_clear_session_is_idempotent() {
        let mut store = signed_in();
        store.prepend_entries(&ListName::Feed, vec![post("1", 1)]);
        store.append_entries(&ListName::Comments("1".into()), Vec::<Comment>::new());
        store.prepend_entries(&ListName::Notifications, vec![notification("n1", 1)]);

        store.clear_session();
        let epoch = store.epoch();
        store.clear_session();

        assert_eq!(store.epoch(), epoch + 1);
        assert!(store.session().current_user.is_none());
        assert_eq!(store.len(&ListName::Feed), 0);
        assert_eq!(store.len(&ListName::Notifications), 0);
        assert_eq!(store.unread_count(), 0);
    }

    #[test]
    fn test_merge_same_entry_twice_leaves_one() {
        let mut store = signed_in();
        assert_eq!(store.prepend_entries(&ListName::Feed, vec![post("1", 1)]), 1);
        assert_eq!(store.append_entries(&ListName::Feed, vec![post("1", 1)]), 0);
        assert_eq!(store.len(&ListName::Feed), 1);
    }

    #[test]
    fn test_mutate_entry_absent_is_noop() {
        let mut store = signed_in();
        let patch = FeedPatch {
            like_count: Some(4),
            ..Default::default()
        };
        assert!(!store.mutate_entry::<FeedEntry>(&ListName::Feed, "5", &patch));
        let comments = ListName::Comments("5".into());
        assert!(!store.mutate_entry::<Comment>(&comments, "c", &Default::default()));
        assert_eq!(store.len(&comments), 0);

        store.prepend_entries(&ListName::Feed, vec![post("5", 1)]);
        assert!(store.mutate_entry::<FeedEntry>(&ListName::Feed, "5", &patch));
        let entry = store.get::<FeedEntry>(&ListName::Feed, "5").unwrap();
        assert_eq!(entry.like_count, 4);
    }

    #[test]
    fn test_mismatched_list_is_ignored() {
        let mut store = signed_in();
        let added = store.prepend_entries(&ListName::Notifications, vec![post("1", 1)]);
        assert_eq!(added, 0);
        assert!(store.entries::<FeedEntry>(&ListName::Notifications).is_empty());
    }

    #[test]
    fn test_pending_entry_pinned_then_confirmed() {
        let mut store = signed_in();
        store.append_entries(&ListName::Feed, vec![post("1", 10), post("2", 20)]);
        store.insert_pending(&ListName::Feed, post("tmp-1", 0));
        assert_eq!(store.entries::<FeedEntry>(&ListName::Feed)[0].id, "tmp-1");
        assert!(store.is_pending::<FeedEntry>(&ListName::Feed, "tmp-1"));

        assert!(store.confirm_pending(&ListName::Feed, "tmp-1", post("3", 30)));
        let ids: Vec<_> = store
            .entries::<FeedEntry>(&ListName::Feed)
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(ids, vec!["3", "2", "1"]);

        // Second confirmation of the same edit is harmless
        assert!(!store.confirm_pending(&ListName::Feed, "tmp-1", post("3", 30)));
        assert_eq!(store.len(&ListName::Feed), 3);
    }

    #[test]
    fn test_discard_pending() {
        let mut store = signed_in();
        store.insert_pending(&ListName::Feed, post("tmp-1", 0));
        assert!(store.discard_pending::<FeedEntry>(&ListName::Feed, "tmp-1"));
        assert!(!store.discard_pending::<FeedEntry>(&ListName::Feed, "tmp-1"));
    }

    #[test]
    fn test_mark_all_notifications_read() {
        let mut store = signed_in();
        let mut read = notification("n2", 2);
        read.read_at = Some(at(3));
        store.append_entries(&ListName::Notifications, vec![notification("n1", 1), read]);
        assert_eq!(store.unread_count(), 1);

        let changed = store.mark_all_notifications_read(at(5) + Duration::seconds(1));
        assert_eq!(changed, vec!["n1"]);
        assert_eq!(store.unread_count(), 0);
    }

    #[test]
    fn test_theme_and_communities() {
        let mut store = signed_in();
        assert_eq!(store.toggle_theme(), Theme::Dark);
        assert!(store.join_community("k1"));
        assert!(!store.join_community("k1"));
        assert!(store.is_member("k1"));
        assert!(store.leave_community("k1"));
        assert!(!store.leave_community("k1"));
    }

    #[test]
    fn test_following_cleared_on_user_switch() {
        let mut store = signed_in();
        assert!(store.follow("u2"));
        assert!(!store.follow("u2"));
        assert!(store.is_following("u2"));

        store.set_session(Some(User::new("u1")), None);
        assert!(store.is_following("u2"));

        store.set_session(Some(User::new("u3")), None);
        assert!(store.following().is_empty());

        store.set_following(vec!["u1".to_string()]);
        store.clear_session();
        assert!(store.following().is_empty());
        assert!(!store.unfollow("u1"));
    }

    #[test]
    fn test_update_profile_requires_profile() {
        let mut store = signed_in();
        let patch = ProfilePatch {
            bio: Some("hi".to_string()),
            ..Default::default()
        };
        assert!(!store.update_profile(&patch));
        store.set_profile(Profile {
            id: "u1".to_string(),
            ..Default::default()
        });
        assert!(store.update_profile(&patch));
        assert_eq!(
            store.session().current_profile.as_ref().unwrap().bio.as_deref(),
            Some("hi")
        );
    }

    #[tokio::test]
    async fn test_mutations_publish_events() {
        let mut store = SessionStore::new();
        let mut rx = store.subscribe();
        store.set_session(Some(User::new("u1")), None);
        store.prepend_entries(&ListName::Feed, vec![post("1", 1)]);
        store.clear_session();

        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent::SessionChanged {
                authenticated: true
            }
        );
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::ListChanged(ListName::Feed));
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::SessionCleared);
    }

    #[test]
    fn test_persisted_subset_restored_unauthenticated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");

        {
            let file = StateFile::with_path(path.clone()).unwrap();
            let mut store = SessionStore::with_state_file(file);
            store.set_session(
                Some(User::new("u1")),
                Some(Profile {
                    id: "u1".to_string(),
                    username: Some("nova".to_string()),
                    ..Default::default()
                }),
            );
            store.toggle_theme();
            store.join_community("k1");
            store.prepend_entries(&ListName::Feed, vec![post("1", 1)]);
        }

        let mut store = SessionStore::with_state_file(StateFile::with_path(path).unwrap());
        assert!(!store.session().authenticated);
        assert_eq!(store.session().current_user.as_ref().unwrap().id, "u1");
        assert_eq!(store.theme(), Theme::Dark);
        assert_eq!(store.joined_communities(), ["k1".to_string()]);
        assert_eq!(store.len(&ListName::Feed), 0);

        // Confirming the restored user keeps the persisted extras
        store.set_session(Some(User::new("u1")), None);
        assert!(store.is_member("k1"));
        assert_eq!(
            store.session().current_profile.as_ref().unwrap().username.as_deref(),
            Some("nova")
        );
    }
}
