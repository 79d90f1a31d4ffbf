use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::prelude::*;

use todo_store::{AppState, FileConfig, ItemFilter, StoreConfig, load_config};

mod cli;
mod render;

#[derive(Parser)]
#[command(name = "todos")]
#[command(about = "Offline to-do list backed by a local SQLite store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.todos)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Keep everything in memory; nothing survives exit
    #[arg(long, global = true)]
    memory: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new item
    Add(AddArgs),

    /// Flip an item between active and completed
    Toggle(IdArgs),

    /// Delete an item
    Delete(IdArgs),

    /// Remove every completed item
    ClearCompleted,

    /// Print the list (default)
    List(ListArgs),

    /// Print item counts
    Stats,

    /// Re-print the list whenever it changes, until Ctrl-C
    Watch,

    /// Interactive session: type commands, the list redraws on every change
    Shell,
}

#[derive(Parser)]
struct AddArgs {
    /// Item text (words are joined with spaces)
    #[arg(required = true, num_args = 1..)]
    text: Vec<String>,
}

#[derive(Parser)]
struct IdArgs {
    id: i64,
}

#[derive(Parser)]
struct ListArgs {
    /// Which items to show
    #[arg(long, value_enum, default_value = "all")]
    filter: FilterArg,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum FilterArg {
    All,
    Active,
    Completed,
}

impl From<FilterArg> for ItemFilter {
    fn from(arg: FilterArg) -> Self {
        match arg {
            FilterArg::All => ItemFilter::All,
            FilterArg::Active => ItemFilter::Active,
            FilterArg::Completed => ItemFilter::Completed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `list --json` stays machine-readable.
    let default_directive = if cli.debug {
        "todos=debug,todo_store=debug,info"
    } else {
        "todos=info,todo_store=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = store_config(cli.data_dir, cli.memory)?;
    let state = AppState::open(config)
        .await
        .context("Failed to open the to-do store")?;

    let result = match cli.command {
        None => cli::list_command(&state, ItemFilter::All, false).await,
        Some(Commands::Add(args)) => cli::add_command(&state, &args.text.join(" ")).await,
        Some(Commands::Toggle(args)) => cli::toggle_command(&state, args.id).await,
        Some(Commands::Delete(args)) => cli::delete_command(&state, args.id).await,
        Some(Commands::ClearCompleted) => cli::clear_completed_command(&state).await,
        Some(Commands::List(args)) => {
            cli::list_command(&state, args.filter.into(), args.json).await
        }
        Some(Commands::Stats) => cli::stats_command(&state).await,
        Some(Commands::Watch) => cli::watch_command(&state).await,
        Some(Commands::Shell) => cli::shell_command(&state).await,
    };

    state.shutdown().await;
    result
}

/// Resolve the data directory and layer defaults, config.toml and env vars.
fn store_config(data_dir: Option<PathBuf>, force_memory: bool) -> Result<StoreConfig> {
    let data_dir = match data_dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("Could not find home directory")?
            .join(".todos"),
    };

    let file_config: FileConfig = load_config(&data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", data_dir.display()))?;

    let mut config = StoreConfig::from_file(&file_config, &data_dir);
    config.memory_only |= force_memory;
    debug!(?config, "Resolved store configuration");
    Ok(config)
}
