use crate::config::StoreConfig;
use crate::db::Database;
use crate::facade::TodoService;
use crate::live::LiveOptions;
use crate::notifier::ChangeNotifier;
use crate::store::ItemStore;

/// Create a fresh ItemStore backed by an in-memory SQLite database.
/// Each call returns an isolated database with all migrations applied.
pub async fn test_store() -> ItemStore {
    let db = Database::open(&StoreConfig::memory())
        .await
        .expect("Failed to open in-memory database");

    ItemStore::new(db, ChangeNotifier::new(), LiveOptions::default())
}

pub async fn test_service() -> TodoService {
    TodoService::new(test_store().await)
}
