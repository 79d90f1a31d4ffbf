use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned identifier. Never reused, even after the item is deleted.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// === Item models ===

/// A to-do entry. Values handed out by the store are snapshots; changes go
/// through the store (or the façade), never through these structs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub text: String,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

/// Field changes accepted by `ItemStore::update`. `completed` is the only
/// mutable field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPatch {
    pub completed: Option<bool>,
}

impl ItemPatch {
    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_none()
    }
}

/// Equality filter on `completed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemFilter {
    #[default]
    All,
    /// `completed = false`
    Active,
    /// `completed = true`
    Completed,
}

impl ItemFilter {
    /// The `completed` value this filter matches, or `None` for every row.
    pub fn completed(&self) -> Option<bool> {
        match self {
            ItemFilter::All => None,
            ItemFilter::Active => Some(false),
            ItemFilter::Completed => Some(true),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// `created_at DESC, id DESC`
    #[default]
    NewestFirst,
    /// `created_at ASC, id ASC`
    OldestFirst,
}

/// A read over the items table. Plain data: the same value can be executed
/// any number of times, each run reflecting the store at that moment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemQuery {
    pub filter: ItemFilter,
    pub order: SortOrder,
}

impl ItemQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: ItemFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub(crate) fn sql(&self) -> &'static str {
        match (self.filter.completed().is_some(), self.order) {
            (false, SortOrder::NewestFirst) => {
                "SELECT id, text, completed, created_at FROM items ORDER BY created_at DESC, id DESC"
            }
            (false, SortOrder::OldestFirst) => {
                "SELECT id, text, completed, created_at FROM items ORDER BY created_at ASC, id ASC"
            }
            (true, SortOrder::NewestFirst) => {
                "SELECT id, text, completed, created_at FROM items WHERE completed = ? ORDER BY created_at DESC, id DESC"
            }
            (true, SortOrder::OldestFirst) => {
                "SELECT id, text, completed, created_at FROM items WHERE completed = ? ORDER BY created_at ASC, id ASC"
            }
        }
    }
}

/// Counters shown alongside a listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStats {
    pub total: usize,
    pub completed: usize,
    pub remaining: usize,
}

impl ItemStats {
    pub fn from_items(items: &[Item]) -> Self {
        let completed = items.iter().filter(|item| item.completed).count();
        Self {
            total: items.len(),
            completed,
            remaining: items.len() - completed,
        }
    }

    /// Whether "clear completed" has anything to do.
    pub fn has_completed(&self) -> bool {
        self.completed > 0
    }
}
