//! Data models for NebulaNet
//!
//! Client-side shapes of the backend rows: feed posts, comments,
//! notifications, chat messages and communities, plus the signed-in
//! identity. Rows are converted into these types by the `rows` module.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::list::{Entry, SortOrder};

/// Authenticated user as reported by the auth provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }
}

/// Public profile of a user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

/// Partial profile update
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

impl Profile {
    /// Apply a partial update
    pub fn apply(&mut self, patch: &ProfilePatch) {
        if let Some(ref username) = patch.username {
            self.username = Some(username.clone());
        }
        if let Some(ref full_name) = patch.full_name {
            self.full_name = Some(full_name.clone());
        }
        if let Some(ref avatar_url) = patch.avatar_url {
            self.avatar_url = Some(avatar_url.clone());
        }
        if let Some(ref bio) = patch.bio {
            self.bio = Some(bio.clone());
        }
    }

    /// Name to show in lists
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .or(self.username.as_deref())
            .unwrap_or(&self.id)
    }
}

/// The signed-in identity
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub current_user: Option<User>,
    pub current_profile: Option<Profile>,
    pub authenticated: bool,
}

impl Session {
    /// Id of the signed-in user, if authenticated
    pub fn user_id(&self) -> Option<&str> {
        if self.authenticated {
            self.current_user.as_ref().map(|u| u.id.as_str())
        } else {
            None
        }
    }
}

/// Reference to the author of a post or comment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorRef {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl AuthorRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: None,
            avatar_url: None,
        }
    }
}

/// A post in the social feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedEntry {
    pub id: String,
    pub author: AuthorRef,
    pub content: String,
    pub media: Vec<String>,
    pub like_count: u32,
    pub comment_count: u32,
    pub user_has_liked: bool,
    pub community_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Partial update of a feed entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedPatch {
    pub content: Option<String>,
    pub media: Option<Vec<String>>,
    pub like_count: Option<u32>,
    pub comment_count: Option<u32>,
    pub user_has_liked: Option<bool>,
}

impl Entry for FeedEntry {
    type Patch = FeedPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn apply(&mut self, patch: &FeedPatch) {
        if let Some(ref content) = patch.content {
            self.content = content.clone();
        }
        if let Some(ref media) = patch.media {
            self.media = media.clone();
        }
        if let Some(count) = patch.like_count {
            self.like_count = count;
        }
        if let Some(count) = patch.comment_count {
            self.comment_count = count;
        }
        if let Some(liked) = patch.user_has_liked {
            self.user_has_liked = liked;
        }
    }
}

/// A comment on a post
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub author: AuthorRef,
    pub content: String,
    pub parent_id: Option<String>,
    pub like_count: u32,
    pub user_has_liked: bool,
    pub created_at: DateTime<Utc>,
}

/// Partial update of a comment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentPatch {
    pub content: Option<String>,
    pub like_count: Option<u32>,
    pub user_has_liked: Option<bool>,
}

impl Entry for Comment {
    type Patch = CommentPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn apply(&mut self, patch: &CommentPatch) {
        if let Some(ref content) = patch.content {
            self.content = content.clone();
        }
        if let Some(count) = patch.like_count {
            self.like_count = count;
        }
        if let Some(liked) = patch.user_has_liked {
            self.user_has_liked = liked;
        }
    }
}

/// An in-app notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEntry {
    pub id: String,
    pub kind: String,
    pub sender_id: Option<String>,
    pub post_id: Option<String>,
    pub comment_id: Option<String>,
    pub body: Option<String>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NotificationEntry {
    pub fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }
}

/// Partial update of a notification
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationPatch {
    /// `Some(None)` clears the read marker (used by rollbacks)
    pub read_at: Option<Option<DateTime<Utc>>>,
    pub body: Option<String>,
}

impl Entry for NotificationEntry {
    type Patch = NotificationPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn apply(&mut self, patch: &NotificationPatch) {
        if let Some(read_at) = patch.read_at {
            self.read_at = read_at;
        }
        if let Some(ref body) = patch.body {
            self.body = Some(body.clone());
        }
    }
}

/// A direct chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Check if this message belongs to the conversation between two users
    pub fn involves(&self, me: &str, peer: &str) -> bool {
        (self.sender_id == me && self.receiver_id == peer)
            || (self.sender_id == peer && self.receiver_id == me)
    }

    /// The other participant from `me`'s point of view
    pub fn peer_of(&self, me: &str) -> &str {
        if self.sender_id == me {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

/// Partial update of a message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub read_at: Option<Option<DateTime<Utc>>>,
}

impl Entry for Message {
    type Patch = MessagePatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn apply(&mut self, patch: &MessagePatch) {
        if let Some(ref content) = patch.content {
            self.content = content.clone();
        }
        if let Some(read_at) = patch.read_at {
            self.read_at = read_at;
        }
    }
}

/// A community users can join
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Community {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub member_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Partial update of a community
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommunityPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub member_count: Option<u32>,
}

impl Entry for Community {
    type Patch = CommunityPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn apply(&mut self, patch: &CommunityPatch) {
        if let Some(ref name) = patch.name {
            self.name = name.clone();
        }
        if let Some(ref description) = patch.description {
            self.description = Some(description.clone());
        }
        if let Some(count) = patch.member_count {
            self.member_count = count;
        }
    }
}

/// What a search looks through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    #[default]
    All,
    Users,
    Posts,
    Communities,
}

impl SearchScope {
    pub fn includes(self, other: SearchScope) -> bool {
        self == SearchScope::All || self == other
    }
}

/// One page of search results; kinds outside the scope stay empty
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResults {
    pub users: Vec<Profile>,
    pub posts: Vec<FeedEntry>,
    pub communities: Vec<Community>,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.posts.is_empty() && self.communities.is_empty()
    }
}

/// Activity counters of a user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UserStats {
    pub posts: usize,
    pub followers: usize,
    pub following: usize,
    /// Likes received across the user's posts
    pub likes: u64,
}

/// Color theme, persisted across launches
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }
}

/// Name of a list held by the session store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListName {
    Feed,
    /// Comments on one post
    Comments(String),
    Notifications,
    /// Conversation with one peer
    Messages(String),
    Communities,
}

impl ListName {
    /// Backend table that backs this list
    pub fn table(&self) -> &'static str {
        match self {
            ListName::Feed => "posts",
            ListName::Comments(_) => "comments",
            ListName::Notifications => "notifications",
            ListName::Messages(_) => "messages",
            ListName::Communities => "communities",
        }
    }

    /// Display order of this list
    pub fn order(&self) -> SortOrder {
        match self {
            ListName::Messages(_) => SortOrder::OldestFirst,
            _ => SortOrder::NewestFirst,
        }
    }
}

impl fmt::Display for ListName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListName::Feed => write!(f, "feed"),
            ListName::Comments(post) => write!(f, "comments:{}", post),
            ListName::Notifications => write!(f, "notifications"),
            ListName::Messages(peer) => write!(f, "messages:{}", peer),
            ListName::Communities => write!(f, "communities"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_post() -> FeedEntry {
        FeedEntry {
            id: "5".to_string(),
            author: AuthorRef::new("u1"),
            content: "hello".to_string(),
            media: Vec::new(),
            like_count: 3,
            comment_count: 0,
            user_has_liked: false,
            community_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_feed_patch_only_touches_set_fields() {
        let mut post = sample_post();
        post.apply(&FeedPatch {
            like_count: Some(4),
            ..Default::default()
        });
        assert_eq!(post.like_count, 4);
        assert_eq!(post.content, "hello");
        assert!(!post.user_has_liked);
    }

    #[test]
    fn test_notification_patch_can_clear_read_marker() {
        let mut n = NotificationEntry {
            id: "n1".to_string(),
            kind: "like".to_string(),
            sender_id: None,
            post_id: None,
            comment_id: None,
            body: None,
            read_at: Some(Utc::now()),
            created_at: Utc::now(),
        };
        n.apply(&NotificationPatch {
            read_at: Some(None),
            ..Default::default()
        });
        assert!(n.is_unread());
    }

    #[test]
    fn test_message_involves() {
        let m = Message {
            id: "m1".to_string(),
            sender_id: "a".to_string(),
            receiver_id: "b".to_string(),
            content: "hi".to_string(),
            read_at: None,
            created_at: Utc::now(),
        };
        assert!(m.involves("a", "b"));
        assert!(m.involves("b", "a"));
        assert!(!m.involves("a", "c"));
        assert_eq!(m.peer_of("a"), "b");
        assert_eq!(m.peer_of("b"), "a");
    }

    #[test]
    fn test_profile_display_name() {
        let mut profile = Profile {
            id: "u1".to_string(),
            ..Default::default()
        };
        assert_eq!(profile.display_name(), "u1");
        profile.apply(&ProfilePatch {
            username: Some("nova".to_string()),
            ..Default::default()
        });
        assert_eq!(profile.display_name(), "nova");
    }

    #[test]
    fn test_list_name_display_and_order() {
        assert_eq!(ListName::Feed.to_string(), "feed");
        assert_eq!(ListName::Comments("7".into()).to_string(), "comments:7");
        assert_eq!(
            ListName::Messages("u2".into()).order(),
            SortOrder::OldestFirst
        );
        assert_eq!(ListName::Notifications.table(), "notifications");
    }

    #[test]
    fn test_theme_toggle() {
        assert_eq!(Theme::Light.toggled(), Theme::Dark);
        assert_eq!(Theme::default().toggled().toggled(), Theme::Light);
    }

    #[test]
    fn test_session_user_id_requires_auth() {
        let session = Session {
            current_user: Some(User::new("u1")),
            current_profile: None,
            authenticated: false,
        };
        assert!(session.user_id().is_none());
    }
}
