//! Sync engine
//!
//! The action boundary used by views. The engine owns the session store, the
//! pagination cursors and the realtime reconciler behind one async mutex and
//! talks to the backend only through the provider traits.
//!
//! Every action follows the same shape:
//! 1. Lock, validate, apply the optimistic edit, capture the session epoch
//! 2. Unlock and call the backend
//! 3. Lock again; if the epoch moved (sign-out or user switch) drop the
//!    result, otherwise confirm or roll back the optimistic edit
//!
//! Realtime subscriptions are tied to screens. Each one forwards its events
//! through a task that merges them under the same lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelFilter, ChannelHandle, ChannelSpec, ChannelState};
use crate::config::Config;
use crate::cursor::{Cursor, CursorManager, PageRequest};
use crate::error::{SyncError, SyncResult};
use crate::list::Entry;
use crate::memory::MemoryBackend;
use crate::models::{
    AuthorRef, Comment, Community, CommunityPatch, FeedEntry, FeedPatch, ListName, Message,
    MessagePatch, NotificationEntry, NotificationPatch, Profile, ProfilePatch, SearchResults,
    SearchScope, Session, Theme, User, UserStats,
};
use crate::optimistic::{CorrelationKey, PendingEdit};
use crate::persist::StateFile;
use crate::provider::{AuthChange, AuthEvent, ChangeEvent, Filter, Providers, Query, Row};
use crate::reconciler::{MergeOutcome, Reconciler};
use crate::remote;
use crate::rows;
use crate::store::{Listed, SessionStore, StoreEvent};

/// Capacity of the event queue between a channel and its forwarding task
const REALTIME_BUFFER: usize = 256;

/// A screen of the view layer that keeps a realtime subscription open
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Screen {
    Home,
    Comments { post_id: String },
    Chat { peer_id: String },
    Notifications,
    Communities,
}

impl Screen {
    /// The list this screen renders
    pub fn list(&self) -> ListName {
        match self {
            Screen::Home => ListName::Feed,
            Screen::Comments { post_id } => ListName::Comments(post_id.clone()),
            Screen::Chat { peer_id } => ListName::Messages(peer_id.clone()),
            Screen::Notifications => ListName::Notifications,
            Screen::Communities => ListName::Communities,
        }
    }

    fn channel(&self, me: Option<&str>) -> SyncResult<ChannelSpec> {
        let list = self.list();
        Ok(match self {
            Screen::Home => ChannelSpec::new("feed", list),
            Screen::Communities => ChannelSpec::new("communities", list),
            Screen::Comments { post_id } => {
                ChannelSpec::new(format!("comments-{}", post_id), list)
                    .with_filter(ChannelFilter::eq("post_id", post_id))
            }
            Screen::Chat { peer_id } => {
                let me = me.ok_or_else(|| sign_in_required("chat"))?;
                // Channels filter on one column; other conversations are dropped on merge
                ChannelSpec::new(format!("messages-{}-{}", me, peer_id), list)
            }
            Screen::Notifications => {
                let me = me.ok_or_else(|| sign_in_required("notifications"))?;
                ChannelSpec::new(format!("notifications-{}", me), list)
                    .with_filter(ChannelFilter::eq("receiver_id", me))
            }
        })
    }
}

impl fmt::Display for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Screen::Home => write!(f, "home"),
            Screen::Comments { post_id } => write!(f, "comments:{}", post_id),
            Screen::Chat { peer_id } => write!(f, "chat:{}", peer_id),
            Screen::Notifications => write!(f, "notifications"),
            Screen::Communities => write!(f, "communities"),
        }
    }
}

/// Result of a page load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Rows were merged
    Loaded { count: usize, has_more: bool },
    /// A newer reset or a session change superseded this load
    Stale,
    /// `load_more` had nothing to do
    Skipped,
}

/// A media file attached to a new post
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Everything guarded by the engine lock
struct State {
    store: SessionStore,
    cursors: CursorManager,
    reconciler: Reconciler,
}

impl State {
    fn user(&self) -> SyncResult<String> {
        self.store
            .user_id()
            .map(str::to_string)
            .ok_or_else(|| sign_in_required("this action"))
    }

    fn epoch(&self) -> u64 {
        self.store.epoch()
    }

    /// Reset derived state after the store moved to a new epoch
    fn forget_session_state(&mut self) {
        self.cursors.clear();
        self.reconciler.clear();
    }

    fn teardown(&mut self) {
        self.store.clear_session();
        self.forget_session_state();
    }

    /// Record an optimistic insert and show it
    fn stage_insert<T: Listed>(
        &mut self,
        list: &ListName,
        entry: T,
        key: CorrelationKey,
        counts_on: Option<(ListName, String)>,
    ) -> Staged {
        let provisional_id = entry.id().to_string();
        self.reconciler.ledger_mut().record(PendingEdit {
            key: key.clone(),
            list: list.clone(),
            provisional_id: Some(provisional_id.clone()),
            counts_on,
            server_updated: false,
            started_at: Utc::now(),
        });
        self.store.insert_pending(list, entry);
        Staged {
            list: list.clone(),
            key,
            provisional_id,
            epoch: self.epoch(),
        }
    }
}

/// An optimistic insert waiting for the backend
struct Staged {
    list: ListName,
    key: CorrelationKey,
    provisional_id: String,
    epoch: u64,
}

/// An open realtime subscription; dropping it unsubscribes
struct Subscription {
    handle: ChannelHandle,
    forward: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forward.abort();
        self.handle.unsubscribe();
    }
}

/// Client sync engine
///
/// Cloning shares the same state.
#[derive(Clone)]
pub struct SyncEngine {
    providers: Providers,
    config: Arc<Config>,
    state: Arc<Mutex<State>>,
    subscriptions: Arc<Mutex<HashMap<Screen, Subscription>>>,
}

impl SyncEngine {
    pub fn new(providers: Providers, config: Config, store: SessionStore) -> Self {
        let state = State {
            store,
            cursors: CursorManager::new(config.page_sizes),
            reconciler: Reconciler::new(config.max_deferred_updates, config.update_retry_delay()),
        };
        Self {
            providers,
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Engine against the configured backend, with the persisted session subset
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let providers = remote::connect(&config)?;
        let state_file = StateFile::with_path(config.session_path())
            .context("Failed to load persisted session")?;
        Ok(Self::new(
            providers,
            config,
            SessionStore::with_state_file(state_file),
        ))
    }

    /// Engine against an in-process backend
    pub fn in_memory(backend: &MemoryBackend, config: Config) -> Self {
        Self::new(backend.providers(), config, SessionStore::new())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ==================== Read accessors ====================

    pub async fn session(&self) -> Session {
        self.state.lock().await.store.session().clone()
    }

    pub async fn feed(&self) -> Vec<FeedEntry> {
        self.entries(&ListName::Feed).await
    }

    pub async fn comments(&self, post_id: &str) -> Vec<Comment> {
        self.entries(&ListName::Comments(post_id.to_string())).await
    }

    pub async fn notifications(&self) -> Vec<NotificationEntry> {
        self.entries(&ListName::Notifications).await
    }

    pub async fn messages(&self, peer_id: &str) -> Vec<Message> {
        self.entries(&ListName::Messages(peer_id.to_string())).await
    }

    pub async fn communities(&self) -> Vec<Community> {
        self.entries(&ListName::Communities).await
    }

    pub async fn joined_communities(&self) -> Vec<String> {
        self.state.lock().await.store.joined_communities().to_vec()
    }

    /// Ids of the users the signed-in user follows
    pub async fn following(&self) -> Vec<String> {
        self.state.lock().await.store.following().to_vec()
    }

    pub async fn is_following(&self, user_id: &str) -> bool {
        self.state.lock().await.store.is_following(user_id)
    }

    pub async fn unread_count(&self) -> usize {
        self.state.lock().await.store.unread_count()
    }

    pub async fn theme(&self) -> Theme {
        self.state.lock().await.store.theme()
    }

    pub async fn cursor(&self, list: &ListName) -> Cursor {
        self.state.lock().await.cursors.cursor(list)
    }

    /// Check if an entry is still a pending optimistic insert
    pub async fn is_pending<T: Listed>(&self, list: &ListName, id: &str) -> bool {
        self.state.lock().await.store.is_pending::<T>(list, id)
    }

    /// Number of realtime updates waiting for their entry
    pub async fn deferred_updates(&self) -> usize {
        self.state.lock().await.reconciler.deferred_len()
    }

    /// Subscribe to store change notifications
    pub async fn store_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.state.lock().await.store.subscribe()
    }

    async fn entries<T: Listed>(&self, list: &ListName) -> Vec<T> {
        self.state.lock().await.store.entries::<T>(list).to_vec()
    }

    // ==================== Pagination ====================

    /// Fetch a page: `reset` replaces the list with page 0, otherwise the
    /// next page is appended
    pub async fn load_page(&self, list: &ListName, reset: bool) -> SyncResult<LoadOutcome> {
        self.load(list, reset, false).await
    }

    /// Append the next page if there is one and nothing is loading
    pub async fn load_more(&self, list: &ListName) -> SyncResult<LoadOutcome> {
        self.load(list, false, true).await
    }

    pub async fn refresh(&self, list: &ListName) -> SyncResult<LoadOutcome> {
        self.load(list, true, false).await
    }

    async fn load(&self, list: &ListName, reset: bool, gated: bool) -> SyncResult<LoadOutcome> {
        let (request, query, me, epoch) = {
            let mut state = self.state.lock().await;
            let me = state.store.user_id().map(str::to_string);
            if requires_user(list) && me.is_none() {
                return Err(sign_in_required(&format!("loading {}", list)));
            }
            if gated && !state.cursors.can_load_more(list) {
                debug!("Nothing more to load for {}", list);
                return Ok(LoadOutcome::Skipped);
            }
            let request = state.cursors.begin(list, reset);
            let query = page_query(&request, me.as_deref().unwrap_or_default());
            let epoch = state.epoch();
            (request, query, me, epoch)
        };

        let fetched = self.fetch_page(list, &query, me.as_deref()).await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch() != epoch {
            debug!(
                "Dropping page {} of {} from an ended session",
                request.page_index, list
            );
            return Ok(LoadOutcome::Stale);
        }

        match fetched {
            Ok((count, page)) => {
                if !state.cursors.complete(&request, count) {
                    return Ok(LoadOutcome::Stale);
                }
                page.merge(&mut state.store, list, request.reset);
                let has_more = state.cursors.cursor(list).has_more;
                debug!(
                    "Loaded page {} of {}: {} rows (has_more: {})",
                    request.page_index, list, count, has_more
                );
                Ok(LoadOutcome::Loaded { count, has_more })
            }
            Err(e) => {
                state.cursors.fail(&request);
                warn!("Loading page {} of {} failed: {}", request.page_index, list, e);
                Err(e)
            }
        }
    }

    /// Run a page query and map its rows; returns the raw row count too
    async fn fetch_page(
        &self,
        list: &ListName,
        query: &Query,
        me: Option<&str>,
    ) -> SyncResult<(usize, Page)> {
        let raw = self.providers.data.select(query).await?;
        let mut page = Page::from_rows(list, &raw);

        if let (Page::Feed(entries), Some(me)) = (&mut page, me) {
            let ids = entries.iter().map(|e| Value::String(e.id.clone())).collect();
            let liked = self.liked_posts(me, ids).await?;
            for entry in entries.iter_mut() {
                entry.user_has_liked |= liked.contains(&entry.id);
            }
        }
        Ok((raw.len(), page))
    }

    /// Which of these posts the user has liked
    async fn liked_posts(&self, me: &str, ids: Vec<Value>) -> SyncResult<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let query = Query::table("likes")
            .select("post_id")
            .filter(Filter::In("post_id".to_string(), ids))
            .filter(Filter::eq("user_id", me));
        let raw = self.providers.data.select(&query).await?;
        Ok(raw
            .iter()
            .filter_map(|row| row.get("post_id").and_then(value_id))
            .collect())
    }

    // ==================== Likes ====================

    /// Toggle the like on a post, returning the new liked state
    ///
    /// Only one like or unlike may be pending per post; a second toggle while
    /// the first is in flight fails with `Conflict`.
    pub async fn like_post(&self, post_id: &str) -> SyncResult<bool> {
        let list = ListName::Feed;
        let key = CorrelationKey::like(post_id);

        let (me, epoch, was_liked, count, optimistic) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let me = state.user()?;
            if state.reconciler.ledger().is_pending(&key) {
                return Err(SyncError::Conflict(format!(
                    "a like on post {} is already pending",
                    post_id
                )));
            }
            let post = state
                .store
                .get::<FeedEntry>(&list, post_id)
                .ok_or_else(|| SyncError::NotFound(format!("post {}", post_id)))?;
            let (was_liked, count) = (post.user_has_liked, post.like_count);

            let optimistic = if was_liked {
                count.saturating_sub(1)
            } else {
                count + 1
            };
            state.store.mutate_entry::<FeedEntry>(
                &list,
                post_id,
                &FeedPatch {
                    like_count: Some(optimistic),
                    user_has_liked: Some(!was_liked),
                    ..Default::default()
                },
            );
            state.reconciler.ledger_mut().record(PendingEdit {
                key: key.clone(),
                list: list.clone(),
                provisional_id: None,
                counts_on: Some((list.clone(), post_id.to_string())),
                server_updated: false,
                started_at: Utc::now(),
            });
            (me, state.epoch(), was_liked, count, optimistic)
        };

        let result = if was_liked {
            let filters = [
                Filter::eq("post_id", post_id),
                Filter::eq("user_id", me.as_str()),
            ];
            self.providers.data.delete("likes", &filters).await.map(|_| ())
        } else {
            let row = rows::like_row(&me, post_id);
            self.providers.data.insert("likes", row).await.map(|_| ())
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch() != epoch {
            return Err(session_ended());
        }
        let server_updated = state
            .reconciler
            .ledger_mut()
            .settle(&key, None)
            .is_some_and(|edit| edit.server_updated);

        match result {
            Ok(()) => Ok(!was_liked),
            Err(SyncError::Conflict(message)) if !was_liked => {
                // The server already holds this like
                if let Some(current) = state.store.get::<FeedEntry>(&list, post_id) {
                    let like_count =
                        rolled_back(current.like_count, optimistic, count, server_updated);
                    state.store.mutate_entry::<FeedEntry>(
                        &list,
                        post_id,
                        &FeedPatch {
                            like_count: Some(like_count),
                            user_has_liked: Some(true),
                            ..Default::default()
                        },
                    );
                }
                warn!("Like on post {} already recorded: {}", post_id, message);
                Err(SyncError::Conflict(message))
            }
            Err(SyncError::NotFound(message)) => {
                state.store.remove_entry::<FeedEntry>(&list, post_id);
                debug!("Post {} is gone; removed from feed", post_id);
                Err(SyncError::NotFound(message))
            }
            Err(e) => {
                // A realtime count that replaced ours is server truth and stays
                if let Some(current) = state.store.get::<FeedEntry>(&list, post_id) {
                    let like_count =
                        rolled_back(current.like_count, optimistic, count, server_updated);
                    state.store.mutate_entry::<FeedEntry>(
                        &list,
                        post_id,
                        &FeedPatch {
                            like_count: Some(like_count),
                            user_has_liked: Some(was_liked),
                            ..Default::default()
                        },
                    );
                }
                warn!("Like on post {} failed: {}", post_id, e);
                Err(e)
            }
        }
    }

    // ==================== Inserts ====================

    /// Comment on a post (optionally as a reply)
    pub async fn add_comment(
        &self,
        post_id: &str,
        content: &str,
        parent_id: Option<&str>,
    ) -> SyncResult<Comment> {
        let content = non_empty(content, "comment")?;
        let list = ListName::Comments(post_id.to_string());
        let now = Utc::now();

        let (staged, row, counts) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let me = state.user()?;
            let key = insert_key(&list, &me, &content)?;
            let pending = Comment {
                id: provisional_id(),
                post_id: post_id.to_string(),
                author: self_author(&state.store, &me),
                content: content.clone(),
                parent_id: parent_id.map(str::to_string),
                like_count: 0,
                user_has_liked: false,
                created_at: now,
            };
            let counts = bump_comment_count(&mut state.store, post_id, 1);
            let row = rows::new_comment_row(&me, post_id, &content, parent_id, now);
            let counts_on = Some((ListName::Feed, post_id.to_string()));
            (state.stage_insert(&list, pending, key, counts_on), row, counts)
        };

        let post_id = post_id.to_string();
        let rollback = move |store: &mut SessionStore, error: &SyncError, server_updated: bool| {
            if let SyncError::NotFound(_) = error {
                store.remove_entry::<FeedEntry>(&ListName::Feed, &post_id);
                debug!("Post {} is gone; removed from feed", post_id);
                return;
            }
            if let Some((original, written)) = counts {
                restore_comment_count(store, &post_id, written, original, server_updated);
            }
        };
        self.commit_insert(staged, "comments", row, rows::comment, rollback)
            .await
    }

    /// Send a chat message to a peer
    pub async fn send_message(&self, peer_id: &str, content: &str) -> SyncResult<Message> {
        let content = non_empty(content, "message")?;
        let list = ListName::Messages(peer_id.to_string());
        let now = Utc::now();

        let (staged, row) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let me = state.user()?;
            let key = insert_key(&list, &me, &content)?;
            let pending = Message {
                id: provisional_id(),
                sender_id: me.clone(),
                receiver_id: peer_id.to_string(),
                content: content.clone(),
                read_at: None,
                created_at: now,
            };
            let row = rows::new_message_row(&me, peer_id, &content, now);
            (state.stage_insert(&list, pending, key, None), row)
        };

        self.commit_insert(staged, "messages", row, rows::message, |_, _, _| {})
            .await
    }

    /// Publish a post, uploading its media first
    pub async fn create_post(
        &self,
        content: &str,
        media: Vec<MediaUpload>,
        community_id: Option<&str>,
    ) -> SyncResult<FeedEntry> {
        let content = content.trim().to_string();
        if content.is_empty() && media.is_empty() {
            return Err(SyncError::malformed("post", "a post needs text or media"));
        }
        let me = self.state.lock().await.user()?;

        let mut media_urls = Vec::with_capacity(media.len());
        for upload in media {
            let path = format!("{}/{}-{}", me, Uuid::new_v4(), upload.file_name);
            let stored = self
                .providers
                .storage
                .upload(&path, upload.bytes, &upload.content_type)
                .await
                .map_err(|e| {
                    warn!("Uploading {} failed: {}", upload.file_name, e);
                    e
                })?;
            media_urls.push(self.providers.storage.public_url(&stored));
        }

        let list = ListName::Feed;
        let now = Utc::now();
        let (staged, row) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            // The session may have changed during the uploads
            if state.user()? != me {
                return Err(session_ended());
            }
            let key = insert_key(&list, &me, &content)?;
            let pending = FeedEntry {
                id: provisional_id(),
                author: self_author(&state.store, &me),
                content: content.clone(),
                media: media_urls.clone(),
                like_count: 0,
                comment_count: 0,
                user_has_liked: false,
                community_id: community_id.map(str::to_string),
                created_at: now,
            };
            let row = rows::new_post_row(&me, &content, &media_urls, community_id, now);
            (state.stage_insert(&list, pending, key, None), row)
        };

        self.commit_insert(staged, "posts", row, rows::feed_entry, |_, _, _| {})
            .await
    }

    /// Insert the row and settle the staged optimistic entry
    async fn commit_insert<T, F>(
        &self,
        staged: Staged,
        table: &str,
        row: Row,
        map: fn(&Row) -> SyncResult<T>,
        rollback: F,
    ) -> SyncResult<T>
    where
        T: Listed,
        F: FnOnce(&mut SessionStore, &SyncError, bool),
    {
        let result = self
            .providers
            .data
            .insert(table, row)
            .await
            .and_then(|row| map(&row));

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch() != staged.epoch {
            return Err(session_ended());
        }
        let server_updated = state
            .reconciler
            .ledger_mut()
            .settle(&staged.key, Some(&staged.provisional_id))
            .is_some_and(|edit| edit.server_updated);

        match result {
            Ok(entry) => {
                // Already confirmed if the realtime echo won the race
                if !state
                    .store
                    .confirm_pending(&staged.list, &staged.provisional_id, entry.clone())
                {
                    debug!("{} {} was confirmed by realtime", staged.list, entry.id());
                }
                Ok(entry)
            }
            Err(e) => {
                state
                    .store
                    .discard_pending::<T>(&staged.list, &staged.provisional_id);
                rollback(&mut state.store, &e, server_updated);
                warn!("Insert into {} failed: {}", staged.list, e);
                Err(e)
            }
        }
    }

    /// Delete one of the user's own posts
    pub async fn delete_post(&self, post_id: &str) -> SyncResult<()> {
        let list = ListName::Feed;
        let (me, epoch, removed) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let me = state.user()?;
            if let Some(post) = state.store.get::<FeedEntry>(&list, post_id) {
                if post.author.id != me {
                    return Err(SyncError::PermissionDenied(format!(
                        "post {} belongs to another user",
                        post_id
                    )));
                }
            }
            let removed = state.store.remove_entry::<FeedEntry>(&list, post_id);
            (me, state.epoch(), removed)
        };

        let filters = [Filter::eq("id", post_id), Filter::eq("user_id", me.as_str())];
        let result = self.providers.data.delete("posts", &filters).await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch() != epoch {
            return Err(session_ended());
        }
        match result {
            Ok(0) => Err(SyncError::NotFound(format!("post {}", post_id))),
            Ok(_) => {
                info!("Deleted post {}", post_id);
                Ok(())
            }
            Err(SyncError::NotFound(message)) => Err(SyncError::NotFound(message)),
            Err(e) => {
                if let Some(post) = removed {
                    state.store.prepend_entries(&list, vec![post]);
                }
                warn!("Deleting post {} failed: {}", post_id, e);
                Err(e)
            }
        }
    }

    // ==================== Read markers ====================

    pub async fn mark_notification_read(&self, notification_id: &str) -> SyncResult<()> {
        let list = ListName::Notifications;
        let now = Utc::now();
        let (epoch, previous) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.user()?;
            let notification = state
                .store
                .get::<NotificationEntry>(&list, notification_id)
                .ok_or_else(|| SyncError::NotFound(format!("notification {}", notification_id)))?;
            if !notification.is_unread() {
                return Ok(());
            }
            let previous = notification.read_at;
            state.store.mutate_entry::<NotificationEntry>(
                &list,
                notification_id,
                &NotificationPatch {
                    read_at: Some(Some(now)),
                    body: None,
                },
            );
            (state.epoch(), previous)
        };

        let result = self
            .providers
            .data
            .update(
                "notifications",
                &[Filter::eq("id", notification_id)],
                rows::read_marker_row(now),
            )
            .await
            .and_then(|updated| {
                if updated.is_empty() {
                    Err(SyncError::NotFound(format!("notification {}", notification_id)))
                } else {
                    Ok(())
                }
            });

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch() != epoch {
            return Err(session_ended());
        }
        match result {
            Ok(()) => Ok(()),
            Err(SyncError::NotFound(message)) => {
                state
                    .store
                    .remove_entry::<NotificationEntry>(&list, notification_id);
                Err(SyncError::NotFound(message))
            }
            Err(e) => {
                state.store.mutate_entry::<NotificationEntry>(
                    &list,
                    notification_id,
                    &NotificationPatch {
                        read_at: Some(previous),
                        body: None,
                    },
                );
                warn!("Marking notification {} read failed: {}", notification_id, e);
                Err(e)
            }
        }
    }

    /// Mark every unread notification read; returns how many changed locally
    pub async fn mark_all_notifications_read(&self) -> SyncResult<usize> {
        let list = ListName::Notifications;
        let now = Utc::now();
        let (me, epoch, changed) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let me = state.user()?;
            let changed = state.store.mark_all_notifications_read(now);
            (me, state.epoch(), changed)
        };
        if changed.is_empty() {
            return Ok(0);
        }

        let filters = [
            Filter::eq("receiver_id", me.as_str()),
            Filter::is_null("read_at"),
        ];
        let result = self
            .providers
            .data
            .update("notifications", &filters, rows::read_marker_row(now))
            .await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch() != epoch {
            return Err(session_ended());
        }
        match result {
            Ok(_) => Ok(changed.len()),
            Err(e) => {
                let unread = NotificationPatch {
                    read_at: Some(None),
                    body: None,
                };
                for id in &changed {
                    state
                        .store
                        .mutate_entry::<NotificationEntry>(&list, id, &unread);
                }
                warn!("Marking all notifications read failed: {}", e);
                Err(e)
            }
        }
    }

    /// Mark the peer's messages to the user as read
    pub async fn mark_conversation_read(&self, peer_id: &str) -> SyncResult<usize> {
        let list = ListName::Messages(peer_id.to_string());
        let now = Utc::now();
        let (me, epoch, changed) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let me = state.user()?;
            let changed: Vec<String> = state
                .store
                .entries::<Message>(&list)
                .iter()
                .filter(|m| m.sender_id == peer_id && m.read_at.is_none())
                .map(|m| m.id.clone())
                .collect();
            let read = MessagePatch {
                content: None,
                read_at: Some(Some(now)),
            };
            for id in &changed {
                state.store.mutate_entry::<Message>(&list, id, &read);
            }
            (me, state.epoch(), changed)
        };

        let filters = [
            Filter::eq("sender_id", peer_id),
            Filter::eq("receiver_id", me.as_str()),
            Filter::is_null("read_at"),
        ];
        let result = self
            .providers
            .data
            .update("messages", &filters, rows::read_marker_row(now))
            .await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch() != epoch {
            return Err(session_ended());
        }
        match result {
            Ok(_) => Ok(changed.len()),
            Err(e) => {
                let unread = MessagePatch {
                    content: None,
                    read_at: Some(None),
                };
                for id in &changed {
                    state.store.mutate_entry::<Message>(&list, id, &unread);
                }
                warn!("Marking conversation with {} read failed: {}", peer_id, e);
                Err(e)
            }
        }
    }

    // ==================== Communities ====================

    /// Join a community; returns false if already a member
    pub async fn join_community(&self, community_id: &str) -> SyncResult<bool> {
        self.set_membership(community_id, true).await
    }

    /// Leave a community; returns false if not a member
    pub async fn leave_community(&self, community_id: &str) -> SyncResult<bool> {
        self.set_membership(community_id, false).await
    }

    async fn set_membership(&self, community_id: &str, join: bool) -> SyncResult<bool> {
        let list = ListName::Communities;
        let (me, epoch, counts) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let me = state.user()?;
            let changed = if join {
                state.store.join_community(community_id)
            } else {
                state.store.leave_community(community_id)
            };
            if !changed {
                return Ok(false);
            }
            let previous_count = state
                .store
                .get::<Community>(&list, community_id)
                .map(|c| c.member_count);
            let counts = previous_count.map(|count| {
                let next = if join {
                    count + 1
                } else {
                    count.saturating_sub(1)
                };
                set_member_count(&mut state.store, community_id, next);
                (count, next)
            });
            (me, state.epoch(), counts)
        };

        let result = if join {
            let row = rows::membership_row(&me, community_id);
            self.providers
                .data
                .insert("community_members", row)
                .await
                .map(|_| ())
        } else {
            let filters = [
                Filter::eq("community_id", community_id),
                Filter::eq("user_id", me.as_str()),
            ];
            self.providers
                .data
                .delete("community_members", &filters)
                .await
                .map(|_| ())
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch() != epoch {
            return Err(session_ended());
        }
        match result {
            Ok(()) => Ok(true),
            Err(SyncError::Conflict(_)) if join => {
                // Already a member on the server; the count included us
                if let Some((original, written)) = counts {
                    restore_member_count(&mut state.store, community_id, written, original);
                }
                Ok(false)
            }
            Err(e) => {
                if join {
                    state.store.leave_community(community_id);
                } else {
                    state.store.join_community(community_id);
                }
                if let Some((original, written)) = counts {
                    restore_member_count(&mut state.store, community_id, written, original);
                }
                warn!("Updating membership of {} failed: {}", community_id, e);
                Err(e)
            }
        }
    }

    // ==================== Follows ====================

    /// Follow a user; returns false if already followed
    pub async fn follow_user(&self, user_id: &str) -> SyncResult<bool> {
        self.set_follow(user_id, true).await
    }

    /// Stop following a user; returns false if not followed
    pub async fn unfollow_user(&self, user_id: &str) -> SyncResult<bool> {
        self.set_follow(user_id, false).await
    }

    async fn set_follow(&self, user_id: &str, follow: bool) -> SyncResult<bool> {
        let (me, epoch) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let me = state.user()?;
            if me == user_id {
                return Err(SyncError::malformed("follow", "cannot follow yourself"));
            }
            let changed = if follow {
                state.store.follow(user_id)
            } else {
                state.store.unfollow(user_id)
            };
            if !changed {
                return Ok(false);
            }
            (me, state.epoch())
        };

        let result = if follow {
            let row = rows::follow_row(&me, user_id);
            self.providers
                .data
                .insert("user_follows", row)
                .await
                .map(|_| ())
        } else {
            let filters = [
                Filter::eq("follower_id", me.as_str()),
                Filter::eq("following_id", user_id),
            ];
            self.providers
                .data
                .delete("user_follows", &filters)
                .await
                .map(|_| ())
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch() != epoch {
            return Err(session_ended());
        }
        match result {
            Ok(()) => {
                debug!("{} user {}", if follow { "Followed" } else { "Unfollowed" }, user_id);
                Ok(true)
            }
            // Already following on the server
            Err(SyncError::Conflict(_)) if follow => Ok(false),
            Err(e) => {
                if follow {
                    state.store.unfollow(user_id);
                } else {
                    state.store.follow(user_id);
                }
                warn!("Updating follow of {} failed: {}", user_id, e);
                Err(e)
            }
        }
    }

    // ==================== Search and stats ====================

    /// Search users, posts and communities by text
    ///
    /// Pages are zero-based and each kind is paged on its own. Results are
    /// returned as-is and never merged into the lists.
    pub async fn search(
        &self,
        text: &str,
        scope: SearchScope,
        page: usize,
    ) -> SyncResult<SearchResults> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SearchResults::default());
        }
        let size = self.config.page_sizes.search.max(1);
        let offset = page * size;
        let me = self.state.lock().await.store.user_id().map(str::to_string);

        let users = self.search_kind(scope, SearchScope::Users, || {
            Query::table("profiles")
                .filter(Filter::AnyOf(vec![
                    vec![Filter::contains("username", text)],
                    vec![Filter::contains("full_name", text)],
                ]))
                .order_by("username", true)
                .range(offset, size)
        });
        let posts = self.search_kind(scope, SearchScope::Posts, || {
            Query::table("posts")
                .select(rows::POST_SELECT)
                .filter(Filter::contains("content", text))
                .order_by("created_at", false)
                .range(offset, size)
        });
        let communities = self.search_kind(scope, SearchScope::Communities, || {
            Query::table("communities")
                .filter(Filter::AnyOf(vec![
                    vec![Filter::contains("name", text)],
                    vec![Filter::contains("description", text)],
                ]))
                .order_by("name", true)
                .range(offset, size)
        });
        let (users, posts, communities) = tokio::try_join!(users, posts, communities)?;

        let mut results = SearchResults {
            users: map_rows("search", &users, rows::profile),
            posts: map_rows("search", &posts, rows::feed_entry),
            communities: map_rows("search", &communities, rows::community),
        };
        if let Some(me) = me {
            let ids = results
                .posts
                .iter()
                .map(|p| Value::String(p.id.clone()))
                .collect();
            let liked = self.liked_posts(&me, ids).await?;
            for post in results.posts.iter_mut() {
                post.user_has_liked |= liked.contains(&post.id);
            }
        }
        debug!(
            "Search '{}' page {}: {} users, {} posts, {} communities",
            text,
            page,
            results.users.len(),
            results.posts.len(),
            results.communities.len()
        );
        Ok(results)
    }

    async fn search_kind(
        &self,
        scope: SearchScope,
        kind: SearchScope,
        query: impl FnOnce() -> Query,
    ) -> SyncResult<Vec<Row>> {
        if !scope.includes(kind) {
            return Ok(Vec::new());
        }
        self.providers.data.select(&query()).await
    }

    /// Post, follower and like counters of a user
    pub async fn user_stats(&self, user_id: &str) -> SyncResult<UserStats> {
        let data = &self.providers.data;
        let posts = Query::table("posts")
            .select(rows::POST_LIKES_SELECT)
            .filter(Filter::eq("user_id", user_id));
        let followers = [Filter::eq("following_id", user_id)];
        let following = [Filter::eq("follower_id", user_id)];

        let (posts, followers, following) = tokio::try_join!(
            data.select(&posts),
            data.count("user_follows", &followers),
            data.count("user_follows", &following),
        )?;

        let mut likes = 0u64;
        for row in &posts {
            likes += u64::from(rows::like_total(row)?);
        }
        Ok(UserStats {
            posts: posts.len(),
            followers,
            following,
            likes,
        })
    }

    // ==================== Profile and preferences ====================

    pub async fn update_profile(&self, patch: ProfilePatch) -> SyncResult<Profile> {
        let (me, epoch, previous) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let me = state.user()?;
            let previous = state.store.session().current_profile.clone();
            state.store.update_profile(&patch);
            (me, state.epoch(), previous)
        };

        let row = rows::profile_patch_row(&me, &patch);
        let result = self
            .providers
            .data
            .update("profiles", &[Filter::eq("id", me.as_str())], row)
            .await
            .and_then(|updated| {
                updated
                    .first()
                    .map(rows::profile)
                    .unwrap_or_else(|| Err(SyncError::NotFound(format!("profile {}", me))))
            });

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch() != epoch {
            return Err(session_ended());
        }
        match result {
            Ok(profile) => {
                state.store.set_profile(profile.clone());
                Ok(profile)
            }
            Err(e) => {
                if let Some(previous) = previous {
                    state.store.set_profile(previous);
                }
                warn!("Updating profile failed: {}", e);
                Err(e)
            }
        }
    }

    /// Flip the theme and return the new one
    pub async fn toggle_theme(&self) -> Theme {
        self.state.lock().await.store.toggle_theme()
    }

    // ==================== Session ====================

    pub async fn sign_in(&self, email: &str, password: &str) -> SyncResult<Session> {
        let auth = self.providers.auth.sign_in(email, password).await?;
        Ok(self.establish_session(auth.user).await)
    }

    /// End the session; local state is wiped even if the backend call fails
    pub async fn sign_out(&self) -> SyncResult<()> {
        let result = self.providers.auth.sign_out().await;
        if let Err(ref e) = result {
            warn!("Sign-out request failed: {}", e);
        }
        self.teardown().await;
        result
    }

    /// Confirm a session with the auth provider on startup
    pub async fn restore_session(&self) -> SyncResult<Option<Session>> {
        match self.providers.auth.get_session().await? {
            Some(auth) => Ok(Some(self.establish_session(auth.user).await)),
            None => {
                let had_identity = self.state.lock().await.store.session().current_user.is_some();
                if had_identity {
                    info!("No active session; clearing restored identity");
                    self.teardown().await;
                }
                Ok(None)
            }
        }
    }

    /// Follow auth state changes from the provider until it goes away
    pub fn watch_auth(&self) -> JoinHandle<()> {
        let mut changes = self.providers.auth.on_auth_state_change();
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => engine.handle_auth_change(change).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} auth changes; re-reading session", skipped);
                        if let Err(e) = engine.restore_session().await {
                            warn!("Re-reading session failed: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle_auth_change(&self, change: AuthChange) {
        match change.event {
            AuthEvent::SignedIn | AuthEvent::UserUpdated => {
                if let Some(session) = change.session {
                    self.establish_session(session.user).await;
                }
            }
            AuthEvent::SignedOut => {
                // A sign-in may have happened since this event was sent
                match self.providers.auth.get_session().await {
                    Ok(Some(_)) => debug!("Ignoring stale sign-out"),
                    _ => self.teardown().await,
                }
            }
            AuthEvent::TokenRefreshed => debug!("Access token refreshed"),
        }
    }

    /// Install a confirmed user, fetching their profile and memberships
    async fn establish_session(&self, user: User) -> Session {
        let profile = match self.fetch_profile(&user.id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Loading profile of {} failed: {}", user.id, e);
                None
            }
        };

        let (session, epoch, switched) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let before = state.epoch();
            state.store.set_session(Some(user.clone()), profile);
            let switched = state.epoch() != before;
            if switched {
                state.forget_session_state();
            }
            (state.store.session().clone(), state.epoch(), switched)
        };
        if switched {
            // Channels of the previous identity carry its epoch
            self.subscriptions.lock().await.clear();
        }

        match self.fetch_memberships(&user.id).await {
            Ok(ids) => {
                let mut state = self.state.lock().await;
                if state.epoch() == epoch {
                    state.store.set_joined_communities(ids);
                }
            }
            Err(e) => warn!("Loading memberships of {} failed: {}", user.id, e),
        }
        match self.fetch_following(&user.id).await {
            Ok(ids) => {
                let mut state = self.state.lock().await;
                if state.epoch() == epoch {
                    state.store.set_following(ids);
                }
            }
            Err(e) => warn!("Loading follows of {} failed: {}", user.id, e),
        }
        session
    }

    async fn fetch_profile(&self, user_id: &str) -> SyncResult<Option<Profile>> {
        let query = Query::table("profiles").filter(Filter::eq("id", user_id));
        let raw = self.providers.data.select(&query).await?;
        raw.first().map(rows::profile).transpose()
    }

    async fn fetch_memberships(&self, user_id: &str) -> SyncResult<Vec<String>> {
        let query = Query::table("community_members")
            .select("community_id")
            .filter(Filter::eq("user_id", user_id));
        let raw = self.providers.data.select(&query).await?;
        Ok(raw
            .iter()
            .filter_map(|row| row.get("community_id").and_then(value_id))
            .collect())
    }

    async fn fetch_following(&self, user_id: &str) -> SyncResult<Vec<String>> {
        let query = Query::table("user_follows")
            .select("following_id")
            .filter(Filter::eq("follower_id", user_id));
        let raw = self.providers.data.select(&query).await?;
        Ok(raw
            .iter()
            .filter_map(|row| row.get("following_id").and_then(value_id))
            .collect())
    }

    async fn teardown(&self) {
        self.state.lock().await.teardown();
        self.subscriptions.lock().await.clear();
    }

    // ==================== Realtime ====================

    /// Open the realtime subscription of a screen
    ///
    /// Subscribing twice to the same screen keeps the existing channel.
    pub async fn subscribe(&self, screen: Screen) -> SyncResult<()> {
        {
            let subscriptions = self.subscriptions.lock().await;
            if subscriptions
                .get(&screen)
                .is_some_and(|s| !s.handle.state().is_terminal())
            {
                return Ok(());
            }
        }

        let (spec, epoch) = {
            let state = self.state.lock().await;
            (screen.channel(state.store.user_id())?, state.epoch())
        };

        let (sink, events) = mpsc::channel(REALTIME_BUFFER);
        let handle = self
            .providers
            .realtime
            .subscribe(spec, sink)
            .await
            .map_err(|e| {
                warn!("Subscribing {} failed: {}", screen, e);
                e
            })?;

        // Lock order: subscriptions, then state. Teardown advances the epoch
        // before it clears the map.
        let mut subscriptions = self.subscriptions.lock().await;
        if self.state.lock().await.epoch() != epoch {
            // Dropping the handle unsubscribes
            return Err(session_ended());
        }
        if subscriptions
            .get(&screen)
            .is_some_and(|s| !s.handle.state().is_terminal())
        {
            debug!("{} was subscribed concurrently; closing {}", screen, handle.name());
            return Ok(());
        }

        let forward = spawn_forwarder(
            self.state.clone(),
            screen.list(),
            epoch,
            self.config.update_retry_delay(),
            events,
        );
        info!("Subscribed to {} ({})", screen, handle.name());
        subscriptions.insert(screen, Subscription { handle, forward });
        Ok(())
    }

    /// Close the subscription of a screen; false if none was open
    pub async fn unsubscribe(&self, screen: &Screen) -> bool {
        let removed = self.subscriptions.lock().await.remove(screen);
        if removed.is_some() {
            info!("Unsubscribed from {}", screen);
        }
        removed.is_some()
    }

    /// State of a screen's channel
    pub async fn channel_state(&self, screen: &Screen) -> Option<ChannelState> {
        self.subscriptions
            .lock()
            .await
            .get(screen)
            .map(|s| s.handle.state())
    }

    /// Screens with an open subscription
    pub async fn subscribed_screens(&self) -> Vec<Screen> {
        self.subscriptions.lock().await.keys().cloned().collect()
    }
}

/// Merge a channel's events into the store until it closes or the session ends
fn spawn_forwarder(
    state: Arc<Mutex<State>>,
    list: ListName,
    epoch: u64,
    retry_delay: Duration,
    mut events: mpsc::Receiver<ChangeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let outcome = {
                let mut guard = state.lock().await;
                let state = &mut *guard;
                if state.epoch() != epoch {
                    debug!("Channel for {} outlived its session; stopping", list);
                    break;
                }
                state
                    .reconciler
                    .apply(&mut state.store, &list, &event, Utc::now())
            };
            if outcome == MergeOutcome::Deferred {
                schedule_retry(state.clone(), epoch, retry_delay);
            }
        }
    })
}

/// Retry parked updates once their delay has passed
fn schedule_retry(state: Arc<Mutex<State>>, epoch: u64, delay: Duration) {
    let due = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut guard = state.lock().await;
        let state = &mut *guard;
        if state.epoch() != epoch {
            return;
        }
        let applied = state
            .reconciler
            .retry_deferred(&mut state.store, Utc::now().max(due));
        if applied > 0 {
            debug!("Applied {} deferred updates", applied);
        }
    });
}

/// A fetched page, mapped into the list's entry type
enum Page {
    Feed(Vec<FeedEntry>),
    Comments(Vec<Comment>),
    Notifications(Vec<NotificationEntry>),
    Messages(Vec<Message>),
    Communities(Vec<Community>),
}

impl Page {
    fn from_rows(list: &ListName, raw: &[Row]) -> Self {
        match list {
            ListName::Feed => Page::Feed(map_rows(list, raw, rows::feed_entry)),
            ListName::Comments(_) => Page::Comments(map_rows(list, raw, rows::comment)),
            ListName::Notifications => {
                Page::Notifications(map_rows(list, raw, rows::notification))
            }
            ListName::Messages(_) => Page::Messages(map_rows(list, raw, rows::message)),
            ListName::Communities => Page::Communities(map_rows(list, raw, rows::community)),
        }
    }

    fn merge(self, store: &mut SessionStore, list: &ListName, reset: bool) {
        match self {
            Page::Feed(entries) => merge_page(store, list, entries, reset),
            Page::Comments(entries) => merge_page(store, list, entries, reset),
            Page::Notifications(entries) => merge_page(store, list, entries, reset),
            Page::Messages(entries) => merge_page(store, list, entries, reset),
            Page::Communities(entries) => merge_page(store, list, entries, reset),
        }
    }
}

fn merge_page<T: Listed>(store: &mut SessionStore, list: &ListName, entries: Vec<T>, reset: bool) {
    if reset {
        store.replace_entries(list, entries);
    } else {
        store.append_entries(list, entries);
    }
}

/// Map rows, dropping the ones that fail validation
fn map_rows<T>(
    context: impl fmt::Display,
    raw: &[Row],
    map: fn(&Row) -> SyncResult<T>,
) -> Vec<T> {
    raw.iter()
        .filter_map(|row| match map(row) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Dropping row in {}: {}", context, e);
                None
            }
        })
        .collect()
}

fn page_query(request: &PageRequest, me: &str) -> Query {
    let base = |table: &str| {
        Query::table(table)
            .order_by("created_at", false)
            .range(request.offset(), request.page_size)
    };
    match &request.list {
        ListName::Feed => base("posts").select(rows::POST_SELECT),
        ListName::Comments(post_id) => base("comments")
            .select(rows::COMMENT_SELECT)
            .filter(Filter::eq("post_id", post_id.as_str())),
        ListName::Notifications => base("notifications").filter(Filter::eq("receiver_id", me)),
        ListName::Messages(peer) => base("messages").filter(Filter::AnyOf(vec![
            vec![
                Filter::eq("sender_id", me),
                Filter::eq("receiver_id", peer.as_str()),
            ],
            vec![
                Filter::eq("sender_id", peer.as_str()),
                Filter::eq("receiver_id", me),
            ],
        ])),
        ListName::Communities => base("communities"),
    }
}

fn requires_user(list: &ListName) -> bool {
    matches!(list, ListName::Notifications | ListName::Messages(_))
}

fn sign_in_required(what: &str) -> SyncError {
    SyncError::AuthRequired(format!("{} needs a signed-in user", what))
}

fn session_ended() -> SyncError {
    SyncError::AuthRequired("the session ended before the action completed".to_string())
}

fn non_empty(content: &str, entity: &'static str) -> SyncResult<String> {
    let content = content.trim();
    if content.is_empty() {
        return Err(SyncError::malformed(entity, "content is empty"));
    }
    Ok(content.to_string())
}

fn insert_key(list: &ListName, me: &str, content: &str) -> SyncResult<CorrelationKey> {
    CorrelationKey::insert(list, me, content)
        .ok_or_else(|| SyncError::malformed("edit", format!("{} takes no inserts", list)))
}

fn provisional_id() -> String {
    format!("local-{}", Uuid::new_v4())
}

/// Author reference for the signed-in user's own entries
fn self_author(store: &SessionStore, me: &str) -> AuthorRef {
    let profile = store.session().current_profile.as_ref();
    AuthorRef {
        id: me.to_string(),
        username: profile.and_then(|p| p.username.clone()),
        avatar_url: profile.and_then(|p| p.avatar_url.clone()),
    }
}

/// Count to show after a failed optimistic edit
///
/// Our written value is undone only if it is still displayed and no server
/// UPDATE reached the entry meanwhile. Anything else is server truth.
fn rolled_back(current: u32, written: u32, original: u32, server_updated: bool) -> u32 {
    if current == written && !server_updated {
        original
    } else {
        current
    }
}

/// Adjust a post's comment count; returns (original, written)
fn bump_comment_count(store: &mut SessionStore, post_id: &str, delta: i64) -> Option<(u32, u32)> {
    let post = store.get::<FeedEntry>(&ListName::Feed, post_id)?;
    let original = post.comment_count;
    let written = u32::try_from((i64::from(original) + delta).max(0)).unwrap_or(original);
    store.mutate_entry::<FeedEntry>(
        &ListName::Feed,
        post_id,
        &FeedPatch {
            comment_count: Some(written),
            ..Default::default()
        },
    );
    Some((original, written))
}

fn restore_comment_count(
    store: &mut SessionStore,
    post_id: &str,
    written: u32,
    original: u32,
    server_updated: bool,
) {
    let Some(post) = store.get::<FeedEntry>(&ListName::Feed, post_id) else {
        return;
    };
    let count = rolled_back(post.comment_count, written, original, server_updated);
    store.mutate_entry::<FeedEntry>(
        &ListName::Feed,
        post_id,
        &FeedPatch {
            comment_count: Some(count),
            ..Default::default()
        },
    );
}

fn set_member_count(store: &mut SessionStore, community_id: &str, count: u32) {
    store.mutate_entry::<Community>(
        &ListName::Communities,
        community_id,
        &CommunityPatch {
            member_count: Some(count),
            ..Default::default()
        },
    );
}

fn restore_member_count(
    store: &mut SessionStore,
    community_id: &str,
    written: u32,
    original: u32,
) {
    if let Some(community) = store.get::<Community>(&ListName::Communities, community_id) {
        let count = rolled_back(community.member_count, written, original, false);
        set_member_count(store, community_id, count);
    }
}

fn value_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_channels() {
        let spec = Screen::Comments {
            post_id: "5".into(),
        }
        .channel(None)
        .unwrap();
        assert_eq!(spec.table, "comments");
        assert_eq!(spec.filter.unwrap().to_string(), "post_id=eq.5");

        let spec = Screen::Notifications.channel(Some("u1")).unwrap();
        assert_eq!(spec.filter.unwrap().to_string(), "receiver_id=eq.u1");

        assert!(matches!(
            Screen::Chat {
                peer_id: "u2".into()
            }
            .channel(None),
            Err(SyncError::AuthRequired(_))
        ));
        let spec = Screen::Chat {
            peer_id: "u2".into(),
        }
        .channel(Some("u1"))
        .unwrap();
        assert!(spec.filter.is_none());
        assert_eq!(spec.list, ListName::Messages("u2".into()));
    }

    #[test]
    fn test_page_query_offsets() {
        let request = PageRequest {
            list: ListName::Feed,
            page_index: 2,
            page_size: 10,
            generation: 1,
            reset: false,
        };
        let query = page_query(&request, "u1");
        assert_eq!(query.table, "posts");
        assert_eq!(query.range, Some((20, 10)));
        assert!(!query.order.unwrap().ascending);
    }

    #[test]
    fn test_conversation_query_covers_both_directions() {
        let request = PageRequest {
            list: ListName::Messages("u2".into()),
            page_index: 0,
            page_size: 50,
            generation: 1,
            reset: true,
        };
        let query = page_query(&request, "u1");
        let filter = &query.filters[0];
        let mut row = Row::new();
        row.insert("sender_id".into(), Value::from("u2"));
        row.insert("receiver_id".into(), Value::from("u1"));
        assert!(filter.matches(&row));
        row.insert("receiver_id".into(), Value::from("u3"));
        assert!(!filter.matches(&row));
    }

    #[test]
    fn test_non_empty_trims() {
        assert_eq!(non_empty("  hi ", "comment").unwrap(), "hi");
        assert!(non_empty("   ", "comment").is_err());
    }

    #[tokio::test]
    async fn test_actions_require_session() {
        let backend = MemoryBackend::new();
        let engine = SyncEngine::in_memory(&backend, Config::default());
        assert!(matches!(
            engine.like_post("1").await,
            Err(SyncError::AuthRequired(_))
        ));
        assert!(matches!(
            engine.load_page(&ListName::Notifications, true).await,
            Err(SyncError::AuthRequired(_))
        ));
        assert!(matches!(
            engine.send_message("u2", "hi").await,
            Err(SyncError::AuthRequired(_))
        ));
    }
}
