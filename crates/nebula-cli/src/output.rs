//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use nebula_core::{
    Comment, Community, FeedEntry, Message, NotificationEntry, SearchResults, Session, UserStats,
};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print the feed, newest first
    pub fn print_feed(&self, posts: &[FeedEntry]) {
        match self.format {
            OutputFormat::Human => {
                if posts.is_empty() {
                    println!("No posts yet.");
                    return;
                }
                for post in posts {
                    let liked = if post.user_has_liked { "♥" } else { "♡" };
                    println!(
                        "{:>6} | {:<12} | {} | {} {} 💬 {}",
                        short_id(&post.id),
                        truncate(author_name(post), 12),
                        truncate_line(&post.content, 50),
                        liked,
                        post.like_count,
                        post.comment_count
                    );
                    for url in &post.media {
                        println!("       | media: {}", url);
                    }
                }
                println!("\n{} post(s)", posts.len());
            }
            OutputFormat::Json => print_json(&posts),
            OutputFormat::Quiet => {
                for post in posts {
                    println!("{}", post.id);
                }
            }
        }
    }

    /// Print a single post
    pub fn print_post(&self, post: &FeedEntry) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:       {}", post.id);
                println!("Author:   {}", author_name(post));
                println!("Content:  {}", post.content);
                if !post.media.is_empty() {
                    println!("Media:    {}", post.media.join(", "));
                }
                println!("Likes:    {}", post.like_count);
                println!("Comments: {}", post.comment_count);
                println!("Created:  {}", post.created_at.format("%Y-%m-%d %H:%M"));
            }
            OutputFormat::Json => print_json(post),
            OutputFormat::Quiet => println!("{}", post.id),
        }
    }

    pub fn print_comments(&self, comments: &[Comment]) {
        match self.format {
            OutputFormat::Human => {
                if comments.is_empty() {
                    println!("No comments.");
                    return;
                }
                for comment in comments {
                    let indent = if comment.parent_id.is_some() { "  ↳ " } else { "" };
                    println!(
                        "{}[{}] {}: {}",
                        indent,
                        comment.created_at.format("%Y-%m-%d %H:%M"),
                        comment
                            .author
                            .username
                            .as_deref()
                            .unwrap_or(&comment.author.id),
                        comment.content
                    );
                }
            }
            OutputFormat::Json => print_json(&comments),
            OutputFormat::Quiet => {
                for comment in comments {
                    println!("{}", comment.id);
                }
            }
        }
    }

    pub fn print_notifications(&self, notifications: &[NotificationEntry]) {
        match self.format {
            OutputFormat::Human => {
                if notifications.is_empty() {
                    println!("No notifications.");
                    return;
                }
                for n in notifications {
                    let marker = if n.is_unread() { "●" } else { " " };
                    let subject = n
                        .post_id
                        .as_deref()
                        .map(|id| format!(" on post {}", id))
                        .unwrap_or_default();
                    println!(
                        "{} [{}] {} from {}{}",
                        marker,
                        n.created_at.format("%Y-%m-%d %H:%M"),
                        n.kind,
                        short_id(&n.sender_id),
                        subject
                    );
                    if let Some(ref body) = n.body {
                        println!("    {}", truncate_line(body, 70));
                    }
                }
                let unread = notifications.iter().filter(|n| n.is_unread()).count();
                println!("\n{} notification(s), {} unread", notifications.len(), unread);
            }
            OutputFormat::Json => print_json(&notifications),
            OutputFormat::Quiet => {
                for n in notifications.iter().filter(|n| n.is_unread()) {
                    println!("{}", n.id);
                }
            }
        }
    }

    /// Print a conversation, oldest first
    pub fn print_messages(&self, messages: &[Message], me: &str) {
        match self.format {
            OutputFormat::Human => {
                if messages.is_empty() {
                    println!("No messages yet.");
                    return;
                }
                for message in messages {
                    let who = if message.sender_id == me { "you" } else { "them" };
                    let read = if message.read_at.is_some() { "" } else { " (unread)" };
                    println!(
                        "[{}] {:>4}: {}{}",
                        message.created_at.format("%H:%M"),
                        who,
                        message.content,
                        read
                    );
                }
            }
            OutputFormat::Json => print_json(&messages),
            OutputFormat::Quiet => {
                for message in messages {
                    println!("{}", message.id);
                }
            }
        }
    }

    pub fn print_communities(&self, communities: &[Community], joined: &[String]) {
        match self.format {
            OutputFormat::Human => {
                for community in communities {
                    let member = if joined.contains(&community.id) { "✓" } else { " " };
                    println!(
                        "{} {} ({} members)",
                        member, community.name, community.member_count
                    );
                }
            }
            OutputFormat::Json => print_json(&communities),
            OutputFormat::Quiet => {
                for community in communities {
                    println!("{}", community.id);
                }
            }
        }
    }

    /// Print one page of search results, grouped by kind
    pub fn print_search(&self, results: &SearchResults) {
        match self.format {
            OutputFormat::Human => {
                if results.is_empty() {
                    println!("No results.");
                    return;
                }
                if !results.users.is_empty() {
                    println!("Users:");
                    for user in &results.users {
                        println!("  {:>8} | {}", short_id(&user.id), user.display_name());
                    }
                }
                if !results.posts.is_empty() {
                    println!("Posts:");
                    for post in &results.posts {
                        println!(
                            "  {:>8} | {:<12} | {}",
                            short_id(&post.id),
                            truncate(author_name(post), 12),
                            truncate_line(&post.content, 50)
                        );
                    }
                }
                if !results.communities.is_empty() {
                    println!("Communities:");
                    for community in &results.communities {
                        println!("  {:>8} | {}", short_id(&community.id), community.name);
                    }
                }
            }
            OutputFormat::Json => print_json(results),
            OutputFormat::Quiet => {
                let users = results.users.iter().map(|u| &u.id);
                let posts = results.posts.iter().map(|p| &p.id);
                let communities = results.communities.iter().map(|c| &c.id);
                for id in users.chain(posts).chain(communities) {
                    println!("{}", id);
                }
            }
        }
    }

    pub fn print_stats(&self, user_id: &str, stats: &UserStats) {
        match self.format {
            OutputFormat::Human => {
                println!("User:      {}", user_id);
                println!("Posts:     {}", stats.posts);
                println!("Likes:     {}", stats.likes);
                println!("Followers: {}", stats.followers);
                println!("Following: {}", stats.following);
            }
            OutputFormat::Json => print_json(stats),
            OutputFormat::Quiet => println!(
                "{} {} {} {}",
                stats.posts, stats.likes, stats.followers, stats.following
            ),
        }
    }

    pub fn print_session(&self, session: &Session) {
        match self.format {
            OutputFormat::Human => match session.current_user {
                Some(ref user) if session.authenticated => {
                    let name = session
                        .current_profile
                        .as_ref()
                        .map(|p| p.display_name().to_string())
                        .unwrap_or_else(|| user.id.clone());
                    println!("Signed in as {}", name);
                    if let Some(ref email) = user.email {
                        println!("  Email:   {}", email);
                    }
                    println!("  User ID: {}", user.id);
                }
                _ => println!("Not signed in."),
            },
            OutputFormat::Json => print_json(session),
            OutputFormat::Quiet => {
                if let Some(id) = session.user_id() {
                    println!("{}", id);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to encode output: {}", e),
    }
}

fn author_name(post: &FeedEntry) -> &str {
    post.author.username.as_deref().unwrap_or(&post.author.id)
}

/// First 8 characters of an id
fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Truncate to first line and max length
fn truncate_line(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    truncate(first_line, max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("héllo wörld!", 8), "héllo...");
    }

    #[test]
    fn test_truncate_line() {
        assert_eq!(truncate_line("single line", 20), "single line");
        assert_eq!(truncate_line("line one\nline two", 20), "line one");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("42"), "42");
        assert_eq!(
            short_id("0b6a4c1e-8f3d-4f7a-9a57-1d2e3f4a5b6c"),
            "0b6a4c1e"
        );
    }
}
