//! Query parameters and result pages.

use crate::clause::Clause;
use crate::object::RemoteObject;
use serde::{Deserialize, Serialize};

/// Parameters for a filtered, sorted remote query.
///
/// Sorting is ascending only; the sync engine always sorts by the remote
/// modification time so page `k + 1` never precedes page `k`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    /// Filter predicate.
    pub clause: Clause,
    /// Field to sort ascending by, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    /// Requested page size. The remote store may use its own default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
}

impl QueryParams {
    /// Creates unsorted parameters for the given clause.
    pub fn new(clause: Clause) -> Self {
        Self {
            clause,
            order_by: None,
            page_size: None,
        }
    }

    /// Sorts ascending by the given field.
    #[must_use]
    pub fn sort_by_asc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    /// Sets the requested page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

/// Opaque continuation token returned with a page.
///
/// Only meaningful to the remote store that issued it, and only for the
/// duration of one download.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageCursor(String);

impl PageCursor {
    /// Wraps a store-specific token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPage {
    /// Objects in query order.
    pub objects: Vec<RemoteObject>,
    /// Cursor for the next page; `None` when this is the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<PageCursor>,
}

impl QueryPage {
    /// Creates a final page.
    pub fn last(objects: Vec<RemoteObject>) -> Self {
        Self {
            objects,
            next_cursor: None,
        }
    }

    /// Creates a page followed by more results.
    pub fn with_next(objects: Vec<RemoteObject>, next: PageCursor) -> Self {
        Self {
            objects,
            next_cursor: Some(next),
        }
    }

    /// Returns true if another page can be requested.
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}
