//! Optimistic edit ledger
//!
//! Records provisional mutations that were applied locally before the server
//! confirmed them. Each edit carries a correlation key (edit kind + target) so
//! the realtime echo of the same logical change can be recognized and merged
//! into the provisional entry instead of being applied a second time.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::ListName;

/// Kind of optimistic edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditKind {
    Like,
    Unlike,
    Post,
    Comment,
    Message,
    MarkRead,
    Join,
    Leave,
    Delete,
}

impl EditKind {
    /// Insert kind produced by a list, if the list accepts optimistic inserts
    pub fn insert_for(list: &ListName) -> Option<Self> {
        match list {
            ListName::Feed => Some(EditKind::Post),
            ListName::Comments(_) => Some(EditKind::Comment),
            ListName::Messages(_) => Some(EditKind::Message),
            ListName::Notifications | ListName::Communities => None,
        }
    }
}

/// Identity of one logical change
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub kind: EditKind,
    pub target: String,
}

impl CorrelationKey {
    pub fn new(kind: EditKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }

    /// Key of a like or unlike on a post (only one may be pending per post)
    pub fn like(post_id: &str) -> Self {
        Self::new(EditKind::Like, post_id)
    }

    /// Key of an insert, fingerprinted by list, author and content
    ///
    /// The server assigns ids, so the echo of an insert can only be matched
    /// on what the user typed.
    pub fn insert(list: &ListName, author_id: &str, content: &str) -> Option<Self> {
        let kind = EditKind::insert_for(list)?;
        Some(Self::new(
            kind,
            format!("{}|{}|{}", list, author_id, content.trim()),
        ))
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.target)
    }
}

/// A pending optimistic edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEdit {
    pub key: CorrelationKey,
    pub list: ListName,
    /// Id of the provisional entry for inserts
    pub provisional_id: Option<String>,
    /// Entry whose counters the edit bumped locally
    pub counts_on: Option<(ListName, String)>,
    /// A server UPDATE reached `counts_on` while the edit was pending
    pub server_updated: bool,
    pub started_at: DateTime<Utc>,
}

/// Pending edits by correlation key, oldest first
#[derive(Debug, Default)]
pub struct OptimisticLedger {
    pending: HashMap<CorrelationKey, VecDeque<PendingEdit>>,
}

impl OptimisticLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new edit
    pub fn record(&mut self, edit: PendingEdit) {
        debug!("Optimistic edit pending: {}", edit.key);
        self.pending
            .entry(edit.key.clone())
            .or_default()
            .push_back(edit);
    }

    /// Check if an edit with this key is pending
    pub fn is_pending(&self, key: &CorrelationKey) -> bool {
        self.pending.get(key).is_some_and(|q| !q.is_empty())
    }

    /// Claim the oldest pending edit for a key (a realtime echo arrived)
    pub fn claim(&mut self, key: &CorrelationKey) -> Option<PendingEdit> {
        let queue = self.pending.get_mut(key)?;
        let edit = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(key);
        }
        edit
    }

    /// Remove one specific edit once its action finished
    ///
    /// Returns `None` if it was already claimed by a realtime echo.
    pub fn settle(
        &mut self,
        key: &CorrelationKey,
        provisional_id: Option<&str>,
    ) -> Option<PendingEdit> {
        let queue = self.pending.get_mut(key)?;
        let edit = queue
            .iter()
            .position(|edit| edit.provisional_id.as_deref() == provisional_id)
            .and_then(|pos| queue.remove(pos));
        if queue.is_empty() {
            self.pending.remove(key);
        }
        edit
    }

    /// Mark pending edits whose counted-on entry just took a server UPDATE
    ///
    /// Counts in that UPDATE are absolute, so rolling such an edit back must
    /// keep them instead of restoring the value from before the edit.
    pub fn note_server_update(&mut self, list: &ListName, id: &str) -> usize {
        let mut marked = 0;
        for edit in self.pending.values_mut().flatten() {
            let hit = edit
                .counts_on
                .as_ref()
                .is_some_and(|(l, entry)| l == list && entry == id);
            if hit && !edit.server_updated {
                edit.server_updated = true;
                marked += 1;
            }
        }
        marked
    }

    /// Number of pending edits
    pub fn len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forget everything (session teardown)
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
