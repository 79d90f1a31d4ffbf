//! Offline to-do storage: a SQLite-backed item store, an in-process change
//! notifier, live query subscriptions that re-run on every committed change,
//! and the small service a UI layer drives.

pub mod config;
pub mod db;
pub mod error;
pub mod facade;
pub mod live;
pub mod models;
pub mod notifier;
pub mod state;
pub mod store;

#[cfg(test)]
mod test_helpers;

pub use config::{FileConfig, StoreConfig, load_config};
pub use db::{Database, MemoryReason, StorageMode};
pub use error::{StoreError, StoreResult};
pub use facade::TodoService;
pub use live::{LiveOptions, LiveQuery, LiveState, LiveUpdates, observe};
pub use models::{Item, ItemFilter, ItemId, ItemPatch, ItemQuery, ItemStats, SortOrder};
pub use notifier::{ChangeNotifier, SubscriptionHandle, SubscriptionId, Topic};
pub use state::AppState;
pub use store::ItemStore;
