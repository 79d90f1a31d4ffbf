//! The operations a UI layer calls. Each one is a single store mutation, so
//! subscribers see exactly one `items-changed` per successful call.

use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::live::LiveUpdates;
use crate::models::{Item, ItemFilter, ItemId, ItemPatch, ItemQuery, ItemStats};
use crate::store::ItemStore;

#[derive(Clone)]
pub struct TodoService {
    store: ItemStore,
}

impl TodoService {
    pub fn new(store: ItemStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    pub async fn add_item(&self, text: &str) -> StoreResult<Item> {
        self.store.insert(text).await
    }

    /// Flip `completed` based on the stored value. Returns the new value.
    ///
    /// The read and the write are separate steps: two concurrent toggles may
    /// both read the same value, and the later write wins.
    pub async fn toggle_item(&self, id: ItemId) -> StoreResult<bool> {
        let current = self.store.get(id).await?.ok_or(StoreError::NotFound(id))?;
        self.toggle_item_from(id, current.completed).await
    }

    /// Flip `completed` from the caller's snapshot without re-reading it.
    pub async fn toggle_item_from(&self, id: ItemId, known_completed: bool) -> StoreResult<bool> {
        let completed = !known_completed;
        self.store.update(id, ItemPatch::completed(completed)).await?;
        debug!(id = %id, completed, "Toggled item");
        Ok(completed)
    }

    /// Delete by id. Unknown ids are not an error.
    pub async fn delete_item(&self, id: ItemId) -> StoreResult<()> {
        self.store.delete(id).await
    }

    /// Remove every completed item. Returns how many went.
    pub async fn clear_completed(&self) -> StoreResult<u64> {
        self.store.delete_where(true).await
    }

    pub async fn items(&self, filter: ItemFilter) -> StoreResult<Vec<Item>> {
        self.store
            .query(&ItemQuery::new().with_filter(filter))
            .await
    }

    pub async fn stats(&self) -> StoreResult<ItemStats> {
        Ok(ItemStats::from_items(&self.items(ItemFilter::All).await?))
    }

    /// Live full listing, newest first.
    pub async fn observe_items(&self) -> StoreResult<(Vec<Item>, LiveUpdates<Vec<Item>>)> {
        self.store.observe(ItemQuery::default()).await
    }
}
