//! Pagination cursors
//!
//! One cursor per paginated list. A load begins by taking a `PageRequest`
//! from the manager and ends with `complete` or `fail`; the generation
//! carried by the request lets a reset invalidate appends issued before it.

use std::collections::HashMap;

use tracing::debug;

use crate::config::PageSizes;
use crate::models::ListName;

/// Pagination bookkeeping for one list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub list: ListName,
    /// Next page to fetch when appending
    pub page_index: usize,
    pub page_size: usize,
    /// Last page came back full
    pub has_more: bool,
    /// Bumped by every reset
    pub generation: u64,
    /// Loads started and not yet completed
    pub in_flight: usize,
}

impl Cursor {
    fn new(list: ListName, page_size: usize) -> Self {
        Self {
            list,
            page_index: 0,
            page_size,
            has_more: true,
            generation: 0,
            in_flight: 0,
        }
    }
}

/// A page load in progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub list: ListName,
    pub page_index: usize,
    pub page_size: usize,
    pub generation: u64,
    /// Replace the list instead of appending
    pub reset: bool,
}

impl PageRequest {
    /// Row offset of the requested page
    pub fn offset(&self) -> usize {
        self.page_index * self.page_size
    }
}

/// Cursors for every list
#[derive(Debug, Default)]
pub struct CursorManager {
    cursors: HashMap<ListName, Cursor>,
    sizes: PageSizes,
}

impl CursorManager {
    pub fn new(sizes: PageSizes) -> Self {
        Self {
            cursors: HashMap::new(),
            sizes,
        }
    }

    /// Snapshot of a list's cursor (a fresh one if the list was never loaded)
    pub fn cursor(&self, list: &ListName) -> Cursor {
        self.cursors
            .get(list)
            .cloned()
            .unwrap_or_else(|| Cursor::new(list.clone(), self.sizes.for_list(list)))
    }

    /// Check if `load_more` should fetch: more pages exist and nothing is loading
    pub fn can_load_more(&self, list: &ListName) -> bool {
        let cursor = self.cursor(list);
        cursor.has_more && cursor.in_flight == 0
    }

    /// Start a load
    ///
    /// A reset restarts at page 0 and bumps the generation, so completions of
    /// loads issued before it are ignored.
    pub fn begin(&mut self, list: &ListName, reset: bool) -> PageRequest {
        let size = self.sizes.for_list(list);
        let cursor = self
            .cursors
            .entry(list.clone())
            .or_insert_with(|| Cursor::new(list.clone(), size));

        if reset {
            cursor.generation += 1;
        }
        cursor.in_flight += 1;

        PageRequest {
            list: list.clone(),
            page_index: if reset { 0 } else { cursor.page_index },
            page_size: cursor.page_size,
            generation: cursor.generation,
            reset,
        }
    }

    /// Record a successful load of `count` rows
    ///
    /// Returns false when the request is stale and its rows must be dropped.
    pub fn complete(&mut self, request: &PageRequest, count: usize) -> bool {
        let Some(cursor) = self.cursors.get_mut(&request.list) else {
            return false;
        };
        cursor.in_flight = cursor.in_flight.saturating_sub(1);

        if cursor.generation != request.generation {
            debug!(
                "Dropping stale page {} of {} (generation {} < {})",
                request.page_index, request.list, request.generation, cursor.generation
            );
            return false;
        }

        cursor.page_index = if request.reset {
            1
        } else {
            cursor.page_index.max(request.page_index + 1)
        };
        cursor.has_more = count == request.page_size;
        true
    }

    /// Record a failed load; position and `has_more` are unchanged
    pub fn fail(&mut self, request: &PageRequest) {
        if let Some(cursor) = self.cursors.get_mut(&request.list) {
            cursor.in_flight = cursor.in_flight.saturating_sub(1);
        }
    }

    /// Forget a list's cursor
    pub fn remove(&mut self, list: &ListName) {
        self.cursors.remove(list);
    }

    /// Forget every cursor (session teardown)
    pub fn clear(&mut self) {
        self.cursors.clear();
    }
}
