//! Ordered, de-duplicated entry lists
//!
//! Every collection in the session store is an `EntryList`: entries are keyed
//! by id, kept sorted by creation time, and optimistic entries that are still
//! pending stay pinned at the newest end until they are confirmed.

use std::collections::HashSet;
use std::fmt::Debug;

use chrono::{DateTime, Utc};

/// An entity that can live in an `EntryList`
pub trait Entry: Clone + Debug + Send + Sync + 'static {
    /// Partial update applied by `mutate_entry`
    type Patch: Clone + Debug + Default + Send + Sync;

    /// Stable identity within a list
    fn id(&self) -> &str;

    /// Creation time used for ordering
    fn created_at(&self) -> DateTime<Utc>;

    /// Apply a partial update in place
    fn apply(&mut self, patch: &Self::Patch);
}

/// Sort direction of a list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Newest first (feed, comments, notifications)
    NewestFirst,
    /// Oldest first (chat conversations)
    OldestFirst,
}

/// Ordered collection with id de-duplication
#[derive(Debug, Clone)]
pub struct EntryList<T: Entry> {
    entries: Vec<T>,
    pinned: HashSet<String>,
    order: SortOrder,
}

impl<T: Entry> EntryList<T> {
    /// Create an empty list
    pub fn new(order: SortOrder) -> Self {
        Self {
            entries: Vec::new(),
            pinned: HashSet::new(),
            order,
        }
    }

    /// Sort direction of this list
    pub fn order(&self) -> SortOrder {
        self.order
    }

    /// Entries in display order
    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the list is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if an id is present
    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// Get an entry by id
    pub fn get(&self, id: &str) -> Option<&T> {
        self.position(id).map(|pos| &self.entries[pos])
    }

    /// Check if an id is a pinned (pending) entry
    pub fn is_pinned(&self, id: &str) -> bool {
        self.pinned.contains(id)
    }

    /// Merge entries into the list
    ///
    /// An id already present is replaced in place (last write wins); new ids
    /// are inserted. The list is re-sorted afterwards. Returns the number of
    /// entries that were not present before.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = T>) -> usize {
        let mut added = 0;
        for entry in incoming {
            match self.position(entry.id()) {
                Some(pos) => self.entries[pos] = entry,
                None => {
                    self.entries.push(entry);
                    added += 1;
                }
            }
        }
        self.normalize();
        added
    }

    /// Replace the whole list, keeping pinned entries that are not in `incoming`
    pub fn replace(&mut self, incoming: Vec<T>) {
        let pinned = &self.pinned;
        let pending: Vec<T> = self
            .entries
            .drain(..)
            .filter(|entry| pinned.contains(entry.id()))
            .collect();
        self.entries = Vec::with_capacity(incoming.len() + pending.len());
        self.merge(pending);
        self.merge(incoming);
    }

    /// Insert an entry pinned to the newest end
    pub fn insert_pinned(&mut self, entry: T) {
        self.pinned.insert(entry.id().to_string());
        self.merge(std::iter::once(entry));
    }

    /// Replace a pinned entry by its confirmed version
    ///
    /// If the confirmed id is already present (the server row arrived first),
    /// the pinned entry is dropped and the confirmed one is updated in place.
    pub fn confirm(&mut self, provisional_id: &str, confirmed: T) {
        self.pinned.remove(provisional_id);
        if provisional_id != confirmed.id() {
            if let Some(pos) = self.position(provisional_id) {
                self.entries.remove(pos);
            }
        }
        self.merge(std::iter::once(confirmed));
    }

    /// Apply a patch to one entry, returning false if the id is absent
    pub fn mutate(&mut self, id: &str, patch: &T::Patch) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.entries[pos].apply(patch);
                true
            }
            None => false,
        }
    }

    /// Apply a closure to every entry
    pub fn mutate_all(&mut self, mut f: impl FnMut(&mut T)) {
        for entry in &mut self.entries {
            f(entry);
        }
    }

    /// Remove an entry by id
    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.pinned.remove(id);
        self.position(id).map(|pos| self.entries.remove(pos))
    }

    /// Remove everything
    pub fn clear(&mut self) {
        self.entries.clear();
        self.pinned.clear();
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id() == id)
    }

    /// Restore the ordering invariant
    fn normalize(&mut self) {
        let pinned = &self.pinned;
        match self.order {
            SortOrder::NewestFirst => self.entries.sort_by(|a, b| {
                let a_pinned = pinned.contains(a.id());
                let b_pinned = pinned.contains(b.id());
                b_pinned
                    .cmp(&a_pinned)
                    .then_with(|| b.created_at().cmp(&a.created_at()))
            }),
            SortOrder::OldestFirst => self.entries.sort_by(|a, b| {
                let a_pinned = pinned.contains(a.id());
                let b_pinned = pinned.contains(b.id());
                a_pinned
                    .cmp(&b_pinned)
                    .then_with(|| a.created_at().cmp(&b.created_at()))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: String,
        at: i64,
        value: u32,
    }

    #[derive(Debug, Clone, Default)]
    struct ItemPatch {
        value: Option<u32>,
    }

    impl Entry for Item {
        type Patch = ItemPatch;

        fn id(&self) -> &str {
            &self.id
        }

        fn created_at(&self) -> DateTime<Utc> {
            Utc.timestamp_opt(self.at, 0).unwrap()
        }

        fn apply(&mut self, patch: &ItemPatch) {
            if let Some(value) = patch.value {
                self.value = value;
            }
        }
    }

    fn item(id: &str, at: i64) -> Item {
        Item {
            id: id.to_string(),
            at,
            value: 0,
        }
    }

    fn ids<T: Entry>(list: &EntryList<T>) -> Vec<String> {
        list.entries().iter().map(|e| e.id().to_string()).collect()
    }

    #[test]
    fn test_merge_sorts_newest_first() {
        let mut list = EntryList::new(SortOrder::NewestFirst);
        list.merge(vec![item("a", 1), item("c", 3), item("b", 2)]);
        assert_eq!(ids(&list), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_merge_same_id_twice_keeps_one() {
        let mut list = EntryList::new(SortOrder::NewestFirst);
        assert_eq!(list.merge(vec![item("a", 1)]), 1);
        assert_eq!(list.merge(vec![item("a", 1)]), 0);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_merge_replaces_in_place() {
        let mut list = EntryList::new(SortOrder::NewestFirst);
        list.merge(vec![item("a", 1)]);
        let mut newer = item("a", 1);
        newer.value = 7;
        list.merge(vec![newer]);
        assert_eq!(list.get("a").unwrap().value, 7);
    }

    #[test]
    fn test_pinned_entry_stays_at_front() {
        let mut list = EntryList::new(SortOrder::NewestFirst);
        list.insert_pinned(item("tmp", 0));
        list.merge(vec![item("a", 5), item("b", 10)]);
        assert_eq!(ids(&list), vec!["tmp", "b", "a"]);
        assert!(list.is_pinned("tmp"));
    }

    #[test]
    fn test_pinned_entry_stays_at_tail_for_chat() {
        let mut list = EntryList::new(SortOrder::OldestFirst);
        list.insert_pinned(item("tmp", 0));
        list.merge(vec![item("a", 5), item("b", 10)]);
        assert_eq!(ids(&list), vec!["a", "b", "tmp"]);
    }

    #[test]
    fn test_confirm_replaces_provisional() {
        let mut list = EntryList::new(SortOrder::NewestFirst);
        list.merge(vec![item("a", 5)]);
        list.insert_pinned(item("tmp", 1));
        list.confirm("tmp", item("srv", 20));
        assert_eq!(ids(&list), vec!["srv", "a"]);
        assert!(!list.is_pinned("srv"));
    }

    #[test]
    fn test_confirm_when_server_row_already_present() {
        let mut list = EntryList::new(SortOrder::NewestFirst);
        list.insert_pinned(item("tmp", 1));
        list.merge(vec![item("srv", 20)]);
        list.confirm("tmp", item("srv", 20));
        assert_eq!(ids(&list), vec!["srv"]);
    }

    #[test]
    fn test_replace_keeps_pending() {
        let mut list = EntryList::new(SortOrder::NewestFirst);
        list.merge(vec![item("old", 1)]);
        list.insert_pinned(item("tmp", 2));
        list.replace(vec![item("x", 3), item("y", 4)]);
        assert_eq!(ids(&list), vec!["tmp", "y", "x"]);
    }

    #[test]
    fn test_mutate_absent_is_noop() {
        let mut list: EntryList<Item> = EntryList::new(SortOrder::NewestFirst);
        assert!(!list.mutate("missing", &ItemPatch { value: Some(1) }));
        list.merge(vec![item("a", 1)]);
        assert!(list.mutate("a", &ItemPatch { value: Some(1) }));
        assert_eq!(list.get("a").unwrap().value, 1);
    }

    #[test]
    fn test_remove() {
        let mut list = EntryList::new(SortOrder::NewestFirst);
        list.insert_pinned(item("tmp", 1));
        assert!(list.remove("tmp").is_some());
        assert!(list.remove("tmp").is_none());
        assert!(!list.is_pinned("tmp"));
        assert!(list.is_empty());
    }
}
