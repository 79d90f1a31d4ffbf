use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use std::future::Future;
use todo_store::{AppState, Item, ItemFilter, ItemId, LiveUpdates, StoreError};

use crate::render;

pub async fn add_command(state: &AppState, text: &str) -> Result<()> {
    let item = state.todos.add_item(text).await?;
    println!("Added {}: {}", item.id, item.text);
    Ok(())
}

pub async fn toggle_command(state: &AppState, id: i64) -> Result<()> {
    let completed = state
        .todos
        .toggle_item(ItemId(id))
        .await
        .with_context(|| format!("Failed to toggle item {id}"))?;
    let now = if completed { "completed" } else { "active" };
    println!("Item {id} is now {now}");
    Ok(())
}

pub async fn delete_command(state: &AppState, id: i64) -> Result<()> {
    state.todos.delete_item(ItemId(id)).await?;
    println!("Deleted {id}");
    Ok(())
}

pub async fn clear_completed_command(state: &AppState) -> Result<()> {
    let removed = state.todos.clear_completed().await?;
    println!("Removed {removed} completed item(s)");
    Ok(())
}

pub async fn list_command(state: &AppState, filter: ItemFilter, json: bool) -> Result<()> {
    let items = state.todos.items(filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        println!("{}", render::storage_line(state.mode()));
        print!("{}", render::list_view(&items));
    }
    Ok(())
}

pub async fn stats_command(state: &AppState) -> Result<()> {
    let stats = state.todos.stats().await?;
    println!("{} item(s), {}", stats.total, render::stats_line(&stats));
    Ok(())
}

/// Print the list, then again after every change, until Ctrl-C.
pub async fn watch_command(state: &AppState) -> Result<()> {
    let (initial, mut updates) = state.todos.observe_items().await?;
    println!("{}", render::storage_line(state.mode()));
    print!("{}", render::list_view(&initial));

    let redraws = follow_updates(&mut updates, tokio::signal::ctrl_c(), |items| {
        println!("---");
        print!("{}", render::list_view(items));
    })
    .await;
    debug!("Watch stopped after {} redraws", redraws);

    updates.cancel();
    Ok(())
}

/// Feed every live snapshot to `redraw` until `stop` resolves or the stream
/// ends. `stop` is polled as one future for the whole loop, so a signal that
/// lands during a redraw is still seen. Returns the number of redraws.
async fn follow_updates<S>(
    updates: &mut LiveUpdates<Vec<Item>>,
    stop: S,
    mut redraw: impl FnMut(&[Item]),
) -> usize
where
    S: Future,
{
    tokio::pin!(stop);
    let mut redraws = 0;

    loop {
        tokio::select! {
            _ = &mut stop => break,
            update = updates.next() => match update {
                Some(Ok(items)) => {
                    redraw(&items);
                    redraws += 1;
                }
                Some(Err(e)) => eprintln!("[todos: {e}]"),
                None => break,
            },
        }
    }
    redraws
}

/// A line typed into `todos shell`.
#[derive(Debug, PartialEq, Eq)]
pub enum ShellCommand {
    Add(String),
    Toggle(ItemId),
    Delete(ItemId),
    ClearCompleted,
    List,
    Help,
    Quit,
}

impl ShellCommand {
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map(|(word, rest)| (word, rest.trim()))
            .unwrap_or((line, ""));

        let command = match word {
            "add" | "a" => Self::Add(rest.to_string()),
            "toggle" | "t" => Self::Toggle(parse_id(rest)?),
            "delete" | "rm" => Self::Delete(parse_id(rest)?),
            "clear" | "clear-completed" => Self::ClearCompleted,
            "list" | "ls" => Self::List,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => bail!("unknown command `{other}` (try `help`)"),
        };
        Ok(Some(command))
    }
}

fn parse_id(arg: &str) -> Result<ItemId> {
    arg.parse::<i64>()
        .map(ItemId)
        .with_context(|| format!("expected an item id, got `{arg}`"))
}

const SHELL_HELP: &str = "\
commands:
  add <text>      add an item
  toggle <id>     flip completed
  delete <id>     delete an item
  clear           remove completed items
  list            print the list
  quit            leave the shell";

/// Read commands from stdin; a live subscription redraws the list after
/// each change.
pub async fn shell_command(state: &AppState) -> Result<()> {
    let (initial, mut updates) = state.todos.observe_items().await?;
    println!("{}", render::storage_line(state.mode()));
    print!("{}", render::list_view(&initial));
    println!("(type `help` for commands)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match ShellCommand::parse(&line) {
                    Ok(Some(ShellCommand::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(e) = run_shell_command(state, command).await {
                            eprintln!("[todos: {e}]");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => eprintln!("[todos: {e}]"),
                }
            }
            update = updates.next() => match update {
                Some(Ok(items)) => print!("{}", render::list_view(&items)),
                Some(Err(e)) => warn!("Live list update failed: {}", e),
                None => break,
            },
        }
    }

    updates.cancel();
    Ok(())
}

async fn run_shell_command(state: &AppState, command: ShellCommand) -> Result<(), StoreError> {
    match command {
        ShellCommand::Add(text) => {
            state.todos.add_item(&text).await?;
        }
        ShellCommand::Toggle(id) => {
            state.todos.toggle_item(id).await?;
        }
        ShellCommand::Delete(id) => state.todos.delete_item(id).await?,
        ShellCommand::ClearCompleted => {
            let removed = state.todos.clear_completed().await?;
            if removed == 0 {
                println!("Nothing to clear");
            }
        }
        ShellCommand::List => {
            print!("{}", render::list_view(&state.todos.items(ItemFilter::All).await?));
        }
        ShellCommand::Help => println!("{SHELL_HELP}"),
        ShellCommand::Quit => {}
    }
    Ok(())
}
