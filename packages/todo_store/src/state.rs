use std::sync::Arc;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::db::StorageMode;
use crate::error::StoreResult;
use crate::facade::TodoService;
use crate::store::ItemStore;

/// Process-wide handles, created once at startup and shared by `Arc`.
pub struct AppState {
    pub config: StoreConfig,
    pub store: ItemStore,
    pub todos: TodoService,
}

impl AppState {
    pub async fn open(config: StoreConfig) -> StoreResult<Arc<Self>> {
        let store = ItemStore::initialize(&config).await?;

        match store.mode().fallback_warning() {
            Some(error) => warn!(
                "Persistence unavailable, changes will be lost on exit: {}",
                error
            ),
            None => info!("Store ready: {}", store.mode()),
        }

        let todos = TodoService::new(store.clone());
        Ok(Arc::new(Self {
            config,
            store,
            todos,
        }))
    }

    pub fn mode(&self) -> &StorageMode {
        self.store.mode()
    }

    /// Cancel live queries and close the database. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.store.is_closed() {
            return;
        }
        info!("Shutting down store");
        self.store.close().await;
    }
}
