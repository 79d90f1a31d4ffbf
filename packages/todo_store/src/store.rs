use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::db::{Database, StorageMode};
use crate::error::{StoreError, StoreResult};
use crate::live::{LiveOptions, LiveUpdates, observe};
use crate::models::{Item, ItemFilter, ItemId, ItemPatch, ItemQuery};
use crate::notifier::{ChangeNotifier, Topic};

/// SQLite-backed item store.
///
/// Mutations are serialized per store: each one holds the write lock across
/// its transaction and the `items-changed` publish, so subscribers only ever
/// re-read committed state. Reads bypass the lock.
#[derive(Clone)]
pub struct ItemStore {
    pool: SqlitePool,
    mode: StorageMode,
    notifier: ChangeNotifier,
    write_lock: Arc<Mutex<()>>,
    live_options: LiveOptions,
}

impl ItemStore {
    /// Open (or create) the configured target, falling back to memory when
    /// it is unavailable. Check [`ItemStore::mode`] to see which one won.
    pub async fn initialize(config: &StoreConfig) -> StoreResult<Self> {
        let db = Database::open(config).await?;
        Ok(Self::new(db, ChangeNotifier::new(), LiveOptions::from(config)))
    }

    pub fn new(db: Database, notifier: ChangeNotifier, live_options: LiveOptions) -> Self {
        let mode = db.mode().clone();
        Self {
            pool: db.pool,
            mode,
            notifier,
            write_lock: Arc::new(Mutex::new(())),
            live_options,
        }
    }

    pub fn mode(&self) -> &StorageMode {
        &self.mode
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub async fn insert(&self, text: &str) -> StoreResult<Item> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StoreError::Validation(
                "item text must not be empty".to_string(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        // Never earlier than the newest row, so listing order follows
        // insertion order even if the wall clock steps back.
        let newest: Option<i64> = sqlx::query_scalar("SELECT MAX(created_at) FROM items")
            .fetch_one(&mut *tx)
            .await?;
        let created_at = Utc::now()
            .timestamp_millis()
            .max(newest.unwrap_or(i64::MIN));

        let result = sqlx::query("INSERT INTO items (text, completed, created_at) VALUES (?, 0, ?)")
            .bind(text)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let item = Item {
            id: ItemId(result.last_insert_rowid()),
            text: text.to_string(),
            completed: false,
            created_at: timestamp(created_at)?,
        };
        debug!(id = %item.id, "Inserted item");

        self.publish_change();
        Ok(item)
    }

    pub async fn get(&self, id: ItemId) -> StoreResult<Option<Item>> {
        let row = sqlx::query("SELECT id, text, completed, created_at FROM items WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_item).transpose()
    }

    /// Apply `patch` to an existing item. Fails with `NotFound` when `id` is
    /// absent.
    pub async fn update(&self, id: ItemId, patch: ItemPatch) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let matched = match patch.completed {
            Some(completed) => sqlx::query("UPDATE items SET completed = ? WHERE id = ?")
                .bind(completed)
                .bind(id.0)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
            None => {
                let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE id = ?")
                    .bind(id.0)
                    .fetch_one(&mut *tx)
                    .await?;
                count as u64
            }
        };

        if matched == 0 {
            return Err(StoreError::NotFound(id));
        }
        tx.commit().await?;
        debug!(id = %id, completed = ?patch.completed, "Updated item");

        self.publish_change();
        Ok(())
    }

    /// Remove an item. Deleting an absent id succeeds and changes nothing.
    pub async fn delete(&self, id: ItemId) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        if removed == 0 {
            debug!(id = %id, "Delete of absent item changed nothing");
        } else {
            debug!(id = %id, "Deleted item");
        }

        self.publish_change();
        Ok(())
    }

    /// Remove every item whose `completed` equals `completed`. Returns the
    /// number removed.
    pub async fn delete_where(&self, completed: bool) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM items WHERE completed = ?")
            .bind(completed)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        info!("Removed {} items with completed = {}", removed, completed);

        self.publish_change();
        Ok(removed)
    }

    /// Lazily stream the items matching `query`, in its order. The stream
    /// holds a pooled connection until it is dropped.
    pub fn query_stream(&self, query: ItemQuery) -> BoxStream<'_, StoreResult<Item>> {
        let mut statement = sqlx::query(query.sql());
        if let Some(completed) = query.filter.completed() {
            statement = statement.bind(completed);
        }
        statement
            .fetch(&self.pool)
            .map(|row| row.map_err(StoreError::from).and_then(|r| row_to_item(&r)))
            .boxed()
    }

    pub async fn query(&self, query: &ItemQuery) -> StoreResult<Vec<Item>> {
        self.query_stream(*query).try_collect().await
    }

    /// Full listing, newest first.
    pub async fn list(&self) -> StoreResult<Vec<Item>> {
        self.query(&ItemQuery::default()).await
    }

    pub async fn count(&self) -> StoreResult<u64> {
        self.count_where(ItemFilter::All).await
    }

    pub async fn count_where(&self, filter: ItemFilter) -> StoreResult<u64> {
        let count: i64 = match filter.completed() {
            Some(completed) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE completed = ?")
                    .bind(completed)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM items")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as u64)
    }

    /// Live version of [`ItemStore::query`]: the initial result plus a stream
    /// that re-runs the query after every committed mutation.
    pub async fn observe(
        &self,
        query: ItemQuery,
    ) -> StoreResult<(Vec<Item>, LiveUpdates<Vec<Item>>)> {
        let store = self.clone();
        observe(
            &self.notifier,
            &[Topic::ItemsChanged],
            self.live_options,
            move || {
                let store = store.clone();
                async move { store.query(&query).await }
            },
        )
        .await
    }

    /// Tear down: cancel every live query and close the pool. Later
    /// operations fail with `StoreError::Closed`.
    pub async fn close(&self) {
        let dropped = self.notifier.shutdown();
        self.pool.close().await;
        info!("Item store closed ({} live subscriptions ended)", dropped);
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn publish_change(&self) {
        let delivered = self.notifier.publish(Topic::ItemsChanged);
        debug!(topic = %Topic::ItemsChanged, delivered, "Published change");
    }
}

fn timestamp(millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        StoreError::Database(sqlx::Error::Decode(
            format!("created_at out of range: {millis}").into(),
        ))
    })
}

fn row_to_item(row: &SqliteRow) -> StoreResult<Item> {
    Ok(Item {
        id: ItemId(row.try_get("id")?),
        text: row.try_get("text")?,
        completed: row.try_get("completed")?,
        created_at: timestamp(row.try_get("created_at")?)?,
    })
}
