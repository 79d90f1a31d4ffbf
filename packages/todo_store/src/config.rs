use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [store]
//                    memory_only = true
//
//   env var:         TODOS_STORE__MEMORY_ONLY=true   (double underscore = nesting)

/// Target name that always selects the memory-only backend.
pub const MEMORY_TARGET: &str = ":memory:";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub store: StoreFileConfig,
    #[serde(default)]
    pub live: LiveFileConfig,
}

/// Persistence tunables (lives under `[store]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreFileConfig {
    /// Persistence target identifier: a file name (resolved against the data
    /// directory), an absolute path, or `:memory:`.
    #[serde(default = "default_target")]
    pub target: String,
    /// Skip the durable target and open the memory-only backend.
    #[serde(default)]
    pub memory_only: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreFileConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            memory_only: false,
            max_connections: default_max_connections(),
        }
    }
}

/// Live query tunables (lives under `[live]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LiveFileConfig {
    /// Drop re-executions whose result equals the previous emission.
    #[serde(default = "default_suppress_duplicates")]
    pub suppress_duplicates: bool,
}

impl Default for LiveFileConfig {
    fn default() -> Self {
        Self {
            suppress_duplicates: default_suppress_duplicates(),
        }
    }
}

fn default_target() -> String {
    "todos.db".to_string()
}
fn default_max_connections() -> u32 {
    4
}
fn default_suppress_duplicates() -> bool {
    true
}

/// Build a figment that layers: defaults → config.toml → TODOS_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `TODOS_STORE__TARGET=/tmp/t.db`  →  `store.target = "/tmp/t.db"`
///   `TODOS_LIVE__SUPPRESS_DUPLICATES=false`  →  `live.suppress_duplicates = false`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("TODOS_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, consumed by the store)
// =============================================================================

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Resolved durable target. Ignored when `memory_only` is set.
    pub target: PathBuf,
    pub memory_only: bool,
    pub max_connections: u32,
    pub suppress_duplicates: bool,
}

impl StoreConfig {
    pub fn from_file(fc: &FileConfig, data_dir: &Path) -> Self {
        let memory_only = fc.store.memory_only || fc.store.target == MEMORY_TARGET;
        let target = PathBuf::from(&fc.store.target);
        let target = if target.is_absolute() {
            target
        } else {
            data_dir.join(target)
        };

        Self {
            target,
            memory_only,
            max_connections: fc.store.max_connections.max(1),
            suppress_duplicates: fc.live.suppress_duplicates,
        }
    }

    /// Durable store at `path` with default tunables.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        let fc = FileConfig::default();
        Self {
            target: path.into(),
            memory_only: false,
            max_connections: fc.store.max_connections,
            suppress_duplicates: fc.live.suppress_duplicates,
        }
    }

    /// Memory-only store with default tunables.
    pub fn memory() -> Self {
        Self {
            memory_only: true,
            ..Self::at_path(MEMORY_TARGET)
        }
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.target.display())
    }
}
