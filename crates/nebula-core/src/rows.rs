//! Boundary mapping between backend rows and client entities
//!
//! Backend rows are loosely typed JSON. Every row that enters the store goes
//! through one of these functions, which validate and coerce fields and fail
//! with `SyncError::Malformed` instead of letting missing data through.
//!
//! Counts are accepted either as denormalized columns (`like_count`) or as
//! embedded aggregates (`likes: [{"count": 3}]`).

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::error::{SyncError, SyncResult};
use crate::models::{
    AuthorRef, Comment, CommentPatch, Community, CommunityPatch, FeedEntry, FeedPatch, Message,
    MessagePatch, NotificationEntry, NotificationPatch, Profile,
};
use crate::provider::Row;

/// Select clause for feed queries
pub const POST_SELECT: &str =
    "*,author:profiles(id,username,avatar_url),likes(count),comments(count)";

/// Select clause for per-post like totals
pub const POST_LIKES_SELECT: &str = "id,likes(count)";

/// Select clause for comment queries
pub const COMMENT_SELECT: &str = "*,author:profiles(id,username,avatar_url)";

// ==================== Field helpers ====================

/// Read an id that may be a string or a number
fn id_field(row: &Row, key: &str, entity: &'static str) -> SyncResult<String> {
    opt_id_field(row, key, entity)?
        .ok_or_else(|| SyncError::malformed(entity, format!("missing '{}'", key)))
}

fn opt_id_field(row: &Row, key: &str, entity: &'static str) -> SyncResult<Option<String>> {
    match row.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => {
            Err(SyncError::malformed(entity, format!("empty '{}'", key)))
        }
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(SyncError::malformed(
            entity,
            format!("'{}' has unexpected type: {}", key, other),
        )),
    }
}

fn opt_str_field(row: &Row, key: &str, entity: &'static str) -> SyncResult<Option<String>> {
    match row.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(SyncError::malformed(
            entity,
            format!("'{}' is not a string: {}", key, other),
        )),
    }
}

fn time_field(row: &Row, key: &str, entity: &'static str) -> SyncResult<DateTime<Utc>> {
    opt_time_field(row, key, entity)?
        .ok_or_else(|| SyncError::malformed(entity, format!("missing '{}'", key)))
}

fn opt_time_field(
    row: &Row,
    key: &str,
    entity: &'static str,
) -> SyncResult<Option<DateTime<Utc>>> {
    match opt_str_field(row, key, entity)? {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| SyncError::malformed(entity, format!("bad '{}' timestamp: {}", key, e))),
    }
}

/// Read a count from `column` or from an embedded `[{count}]` aggregate
fn count_field(
    row: &Row,
    column: &str,
    aggregate: &str,
    entity: &'static str,
) -> SyncResult<Option<u32>> {
    if let Some(value) = row.get(column).filter(|v| !v.is_null()) {
        return as_count(value)
            .map(Some)
            .ok_or_else(|| SyncError::malformed(entity, format!("bad '{}': {}", column, value)));
    }
    match row.get(aggregate) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => match items.first() {
            None => Ok(Some(0)),
            Some(first) => first
                .get("count")
                .and_then(as_count)
                .map(Some)
                .ok_or_else(|| SyncError::malformed(entity, format!("bad '{}' aggregate", aggregate))),
        },
        Some(other) => Err(SyncError::malformed(
            entity,
            format!("'{}' is not an aggregate: {}", aggregate, other),
        )),
    }
}

fn as_count(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

/// Read the liked flag from `user_has_liked` or a non-empty `user_liked` embed
fn liked_field(row: &Row, entity: &'static str) -> SyncResult<Option<bool>> {
    match row.get("user_has_liked") {
        Some(Value::Bool(b)) => return Ok(Some(*b)),
        Some(Value::Null) | None => {}
        Some(other) => {
            return Err(SyncError::malformed(
                entity,
                format!("'user_has_liked' is not a bool: {}", other),
            ))
        }
    }
    match row.get("user_liked") {
        Some(Value::Array(items)) => Ok(Some(!items.is_empty())),
        _ => Ok(None),
    }
}

fn author_field(row: &Row, entity: &'static str) -> SyncResult<AuthorRef> {
    if let Some(Value::Object(author)) = row.get("author") {
        return Ok(AuthorRef {
            id: id_field(author, "id", entity)?,
            username: opt_str_field(author, "username", entity)?,
            avatar_url: opt_str_field(author, "avatar_url", entity)?,
        });
    }
    id_field(row, "user_id", entity).map(AuthorRef::new)
}

fn media_field(row: &Row, entity: &'static str) -> SyncResult<Option<Vec<String>>> {
    match row.get("media_urls") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| SyncError::malformed(entity, "media url is not a string"))
            })
            .collect::<SyncResult<Vec<_>>>()
            .map(Some),
        Some(other) => Err(SyncError::malformed(
            entity,
            format!("'media_urls' is not an array: {}", other),
        )),
    }
}

/// Id of a row, for events that only need the key
pub fn row_id(row: &Row) -> Option<String> {
    opt_id_field(row, "id", "row").ok().flatten()
}

// ==================== Entities ====================

/// Map a `posts` row into a feed entry
pub fn feed_entry(row: &Row) -> SyncResult<FeedEntry> {
    const E: &str = "post";
    Ok(FeedEntry {
        id: id_field(row, "id", E)?,
        author: author_field(row, E)?,
        content: opt_str_field(row, "content", E)?.unwrap_or_default(),
        media: media_field(row, E)?.unwrap_or_default(),
        like_count: count_field(row, "like_count", "likes", E)?.unwrap_or(0),
        comment_count: count_field(row, "comment_count", "comments", E)?.unwrap_or(0),
        user_has_liked: liked_field(row, E)?.unwrap_or(false),
        community_id: opt_id_field(row, "community_id", E)?,
        created_at: time_field(row, "created_at", E)?,
    })
}

/// Map the fields present in a `posts` row into a patch
///
/// Realtime rows never carry the per-user liked flag, so it is only set when
/// the row states it explicitly.
pub fn feed_patch(row: &Row) -> SyncResult<FeedPatch> {
    const E: &str = "post";
    Ok(FeedPatch {
        content: opt_str_field(row, "content", E)?,
        media: media_field(row, E)?,
        like_count: count_field(row, "like_count", "likes", E)?,
        comment_count: count_field(row, "comment_count", "comments", E)?,
        user_has_liked: liked_field(row, E)?,
    })
}

/// Map a `comments` row
pub fn comment(row: &Row) -> SyncResult<Comment> {
    const E: &str = "comment";
    Ok(Comment {
        id: id_field(row, "id", E)?,
        post_id: id_field(row, "post_id", E)?,
        author: author_field(row, E)?,
        content: opt_str_field(row, "content", E)?
            .ok_or_else(|| SyncError::malformed(E, "missing 'content'"))?,
        parent_id: opt_id_field(row, "parent_comment_id", E)?,
        like_count: count_field(row, "like_count", "likes", E)?.unwrap_or(0),
        user_has_liked: liked_field(row, E)?.unwrap_or(false),
        created_at: time_field(row, "created_at", E)?,
    })
}

pub fn comment_patch(row: &Row) -> SyncResult<CommentPatch> {
    const E: &str = "comment";
    Ok(CommentPatch {
        content: opt_str_field(row, "content", E)?,
        like_count: count_field(row, "like_count", "likes", E)?,
        user_has_liked: liked_field(row, E)?,
    })
}

/// Map a `notifications` row
pub fn notification(row: &Row) -> SyncResult<NotificationEntry> {
    const E: &str = "notification";
    Ok(NotificationEntry {
        id: id_field(row, "id", E)?,
        kind: opt_str_field(row, "type", E)?.unwrap_or_else(|| "generic".to_string()),
        sender_id: opt_id_field(row, "sender_id", E)?,
        post_id: opt_id_field(row, "post_id", E)?,
        comment_id: opt_id_field(row, "comment_id", E)?,
        body: opt_str_field(row, "message", E)?,
        read_at: opt_time_field(row, "read_at", E)?,
        created_at: time_field(row, "created_at", E)?,
    })
}

pub fn notification_patch(row: &Row) -> SyncResult<NotificationPatch> {
    const E: &str = "notification";
    let read_at = if row.contains_key("read_at") {
        Some(opt_time_field(row, "read_at", E)?)
    } else {
        None
    };
    Ok(NotificationPatch {
        read_at,
        body: opt_str_field(row, "message", E)?,
    })
}

/// Map a `messages` row
pub fn message(row: &Row) -> SyncResult<Message> {
    const E: &str = "message";
    Ok(Message {
        id: id_field(row, "id", E)?,
        sender_id: id_field(row, "sender_id", E)?,
        receiver_id: id_field(row, "receiver_id", E)?,
        content: opt_str_field(row, "content", E)?
            .ok_or_else(|| SyncError::malformed(E, "missing 'content'"))?,
        read_at: opt_time_field(row, "read_at", E)?,
        created_at: time_field(row, "created_at", E)?,
    })
}

pub fn message_patch(row: &Row) -> SyncResult<MessagePatch> {
    const E: &str = "message";
    let read_at = if row.contains_key("read_at") {
        Some(opt_time_field(row, "read_at", E)?)
    } else {
        None
    };
    Ok(MessagePatch {
        content: opt_str_field(row, "content", E)?,
        read_at,
    })
}

/// Map a `communities` row
pub fn community(row: &Row) -> SyncResult<Community> {
    const E: &str = "community";
    let member_count = match count_field(row, "member_count", "members", E)? {
        Some(count) => Some(count),
        None => count_field(row, "members_count", "community_members", E)?,
    };
    Ok(Community {
        id: id_field(row, "id", E)?,
        name: opt_str_field(row, "name", E)?
            .ok_or_else(|| SyncError::malformed(E, "missing 'name'"))?,
        description: opt_str_field(row, "description", E)?,
        member_count: member_count.unwrap_or(0),
        created_at: time_field(row, "created_at", E)?,
    })
}

pub fn community_patch(row: &Row) -> SyncResult<CommunityPatch> {
    const E: &str = "community";
    Ok(CommunityPatch {
        name: opt_str_field(row, "name", E)?,
        description: opt_str_field(row, "description", E)?,
        member_count: count_field(row, "member_count", "members", E)?,
    })
}

/// Map a `profiles` row
pub fn profile(row: &Row) -> SyncResult<Profile> {
    const E: &str = "profile";
    Ok(Profile {
        id: id_field(row, "id", E)?,
        username: opt_str_field(row, "username", E)?,
        full_name: opt_str_field(row, "full_name", E)?,
        avatar_url: opt_str_field(row, "avatar_url", E)?,
        bio: opt_str_field(row, "bio", E)?,
    })
}

// ==================== Outgoing rows ====================

fn object(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// Row for a new post
pub fn new_post_row(
    user_id: &str,
    content: &str,
    media: &[String],
    community_id: Option<&str>,
    created_at: DateTime<Utc>,
) -> Row {
    object(json!({
        "user_id": user_id,
        "content": content,
        "media_urls": media,
        "community_id": community_id,
        "created_at": created_at.to_rfc3339(),
    }))
}

/// Row for a new comment
pub fn new_comment_row(
    user_id: &str,
    post_id: &str,
    content: &str,
    parent_id: Option<&str>,
    created_at: DateTime<Utc>,
) -> Row {
    object(json!({
        "post_id": post_id,
        "user_id": user_id,
        "content": content,
        "parent_comment_id": parent_id,
        "created_at": created_at.to_rfc3339(),
    }))
}

/// Row for a new chat message
pub fn new_message_row(
    sender_id: &str,
    receiver_id: &str,
    content: &str,
    created_at: DateTime<Utc>,
) -> Row {
    object(json!({
        "sender_id": sender_id,
        "receiver_id": receiver_id,
        "content": content,
        "created_at": created_at.to_rfc3339(),
    }))
}

/// Row for a like
pub fn like_row(user_id: &str, post_id: &str) -> Row {
    object(json!({ "post_id": post_id, "user_id": user_id }))
}

/// Row for a follow edge
pub fn follow_row(follower_id: &str, following_id: &str) -> Row {
    object(json!({ "follower_id": follower_id, "following_id": following_id }))
}

/// Like total of a post row, from the counter column or the embedded aggregate
pub fn like_total(row: &Row) -> SyncResult<u32> {
    Ok(count_field(row, "like_count", "likes", "post")?.unwrap_or(0))
}

/// Row for a community membership
pub fn membership_row(user_id: &str, community_id: &str) -> Row {
    object(json!({ "community_id": community_id, "user_id": user_id }))
}

/// Patch row setting `read_at`
pub fn read_marker_row(at: DateTime<Utc>) -> Row {
    object(json!({ "read_at": at.to_rfc3339() }))
}

/// Patch row for a profile update
pub fn profile_patch_row(id: &str, patch: &crate::models::ProfilePatch) -> Row {
    let mut row = serde_json::to_value(patch).map(object).unwrap_or_default();
    row.insert("id".to_string(), Value::String(id.to_string()));
    row.insert("updated_at".to_string(), Value::String(Utc::now().to_rfc3339()));
    row
}
