use std::fmt::Write;

use todo_store::{Item, ItemStats, StorageMode};

/// One line per item: `[x]   12  Buy milk`.
pub fn item_line(item: &Item) -> String {
    let mark = if item.completed { "x" } else { " " };
    format!("[{}] {:>4}  {}", mark, item.id.0, item.text)
}

pub fn stats_line(stats: &ItemStats) -> String {
    format!("{} remaining / {} completed", stats.remaining, stats.completed)
}

/// The full list view: items newest first, then the counters.
pub fn list_view(items: &[Item]) -> String {
    let mut out = String::new();
    if items.is_empty() {
        out.push_str("Nothing to do.\n");
        return out;
    }

    for item in items {
        let _ = writeln!(out, "{}", item_line(item));
    }
    let stats = ItemStats::from_items(items);
    let _ = writeln!(out, "\n{}", stats_line(&stats));
    if stats.has_completed() {
        out.push_str("(`clear-completed` removes finished items)\n");
    }
    out
}

/// Where the data lives, as shown to the user.
pub fn storage_line(mode: &StorageMode) -> String {
    match mode.fallback_warning() {
        Some(error) => format!(
            "Storage: {} - changes will be lost on exit ({})",
            mode, error
        ),
        None => format!("Storage: {}", mode),
    }
}
