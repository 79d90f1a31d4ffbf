use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

/// Which backend `Database::open` ended up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageMode {
    Durable { path: PathBuf },
    Memory { reason: MemoryReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryReason {
    /// Configured with `memory_only` (or the `:memory:` target).
    Requested,
    /// The durable target failed to open; data will not survive a restart.
    Fallback { error: String },
}

impl StorageMode {
    pub fn is_durable(&self) -> bool {
        matches!(self, StorageMode::Durable { .. })
    }

    /// Warning to surface to the user when persistence silently degraded.
    pub fn fallback_warning(&self) -> Option<&str> {
        match self {
            StorageMode::Memory {
                reason: MemoryReason::Fallback { error },
            } => Some(error),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::Durable { path } => write!(f, "durable ({})", path.display()),
            StorageMode::Memory {
                reason: MemoryReason::Requested,
            } => write!(f, "memory-only"),
            StorageMode::Memory {
                reason: MemoryReason::Fallback { .. },
            } => write!(f, "memory-only (fallback)"),
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
    mode: StorageMode,
}

impl Database {
    /// Open the configured target, falling back to memory exactly once.
    ///
    /// Only fails with `StorageUnavailable` when the memory backend cannot be
    /// opened either.
    pub async fn open(config: &StoreConfig) -> StoreResult<Self> {
        if config.memory_only {
            return Self::open_memory(MemoryReason::Requested)
                .await
                .map_err(|e| StoreError::StorageUnavailable(e.to_string()));
        }

        match Self::open_durable(config).await {
            Ok(db) => Ok(db),
            Err(durable_err) => {
                warn!(
                    target_path = %config.target.display(),
                    error = %durable_err,
                    "Durable storage unavailable, falling back to memory-only store"
                );
                let reason = MemoryReason::Fallback {
                    error: durable_err.to_string(),
                };
                Self::open_memory(reason).await.map_err(|memory_err| {
                    StoreError::StorageUnavailable(format!(
                        "durable target failed ({durable_err}); memory fallback failed ({memory_err})"
                    ))
                })
            }
        }
    }

    async fn open_durable(config: &StoreConfig) -> StoreResult<Self> {
        info!("Opening database: {}", config.target.display());

        if let Some(parent) = config.target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::StorageUnavailable(format!(
                    "failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .connect(&config.db_url())
            .await?;
        let pool = prepare_or_close(pool).await?;

        Ok(Self {
            pool,
            mode: StorageMode::Durable {
                path: config.target.clone(),
            },
        })
    }

    async fn open_memory(reason: MemoryReason) -> StoreResult<Self> {
        // Every connection to `sqlite::memory:` is its own database, so the
        // pool is pinned to one connection that is never recycled.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        run_migrations(&pool).await?;

        info!("Opened memory-only database");
        Ok(Self {
            pool,
            mode: StorageMode::Memory { reason },
        })
    }

    pub fn mode(&self) -> &StorageMode {
        &self.mode
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Apply pragmas and migrations to a freshly connected durable pool. The pool
/// is closed if any step fails.
async fn prepare_or_close(pool: SqlitePool) -> StoreResult<SqlitePool> {
    match prepare_durable(&pool).await {
        Ok(()) => Ok(pool),
        Err(e) => {
            pool.close().await;
            Err(e)
        }
    }
}

async fn prepare_durable(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(pool)
        .await?;
    run_migrations(pool).await
}

/// Current schema version - increment when adding migrations
const SCHEMA_VERSION: i64 = 1;

/// Idempotently create the schema. Safe to run on every open.
pub(crate) async fn run_migrations(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch()),
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await?;

    if current_version > SCHEMA_VERSION {
        return Err(StoreError::StorageUnavailable(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    if current_version == SCHEMA_VERSION {
        debug!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!(
        "Migrating database from version {} to {}",
        current_version, SCHEMA_VERSION
    );

    let mut tx = pool.begin().await?;

    // AUTOINCREMENT keeps ids from being reused after the newest row is deleted.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            text TEXT NOT NULL CHECK (length(trim(text)) > 0),
            completed INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_created_at ON items(created_at DESC, id DESC)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_completed ON items(completed)")
        .execute(&mut *tx)
        .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version, description) VALUES (?, ?)")
        .bind(SCHEMA_VERSION)
        .bind("items table")
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}
