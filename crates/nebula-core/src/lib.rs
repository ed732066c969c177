//! NebulaNet Core Library
//!
//! This crate provides the client-side sync engine for NebulaNet, a social
//! app with a paginated feed, comments, direct messages, notifications and
//! communities backed by a hosted Postgres service with realtime channels.
//!
//! # Architecture
//!
//! - **SessionStore**: Single source of truth for the session and every list
//! - **CursorManager**: Page position and race guards per list
//! - **Reconciler**: Merges realtime row changes and settles optimistic edits
//! - **SyncEngine**: Action boundary; optimistic edits with rollback
//!
//! The backend is reached only through the traits in `provider`, implemented
//! over HTTP and websockets in `remote` and in-process in `memory`.
//!
//! # Quick Start
//!
//! ```text
//! let engine = SyncEngine::open(Config::load()?)?;
//! engine.sign_in("ada@example.com", "secret").await?;
//!
//! // Load the first page of the feed and follow it live
//! engine.refresh(&ListName::Feed).await?;
//! engine.subscribe(Screen::Home).await?;
//!
//! // Optimistic like; rolled back if the backend rejects it
//! engine.like_post(&post_id).await?;
//! ```
//!
//! # Modules
//!
//! - `engine`: Sync engine (main entry point)
//! - `store`: Session store and change notifications
//! - `cursor`: Pagination cursors
//! - `reconciler`: Realtime merge rules and deferred updates
//! - `optimistic`: Pending optimistic edits
//! - `models`: Feed entries, comments, messages and the session
//! - `provider`: Backend collaborator traits
//! - `remote`: Hosted backend providers
//! - `memory`: In-process backend for tests and demos
//! - `config`: Application configuration

pub mod channel;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod list;
pub mod memory;
pub mod models;
pub mod optimistic;
pub mod persist;
pub mod provider;
pub mod realtime;
pub mod reconciler;
pub mod remote;
pub mod rows;
pub mod store;

pub use channel::{ChannelHandle, ChannelSpec, ChannelState};
pub use config::{Config, PageSizes};
pub use cursor::{Cursor, CursorManager, PageRequest};
pub use engine::{LoadOutcome, MediaUpload, Screen, SyncEngine};
pub use error::{SyncError, SyncResult, UserAction};
pub use memory::MemoryBackend;
pub use models::{
    AuthorRef, Comment, Community, FeedEntry, ListName, Message, NotificationEntry, Profile,
    ProfilePatch, SearchResults, SearchScope, Session, Theme, User, UserStats,
};
pub use provider::{ChangeEvent, DataProvider, EventType, Filter, Providers, Query, Row};
pub use reconciler::{MergeOutcome, Reconciler};
pub use store::{SessionStore, StoreEvent};
