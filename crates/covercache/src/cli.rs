//! CLI output formatting
//!
//! Renders store entries, counters and fetch reports as tables (human) or
//! JSON, the way `main.rs` prints them.

use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Row, Table};
use covercache_core::cache::{EntrySnapshot, Scope};
use covercache_core::{FetchError, StoreStats};
use serde_json::json;
use std::path::Path;

// ============================================================================
// Entries
// ============================================================================

/// Format store entries as table (human) or JSON
pub fn format_entries(
    entries: &[EntrySnapshot<String>],
    now: DateTime<Utc>,
    json: bool,
    no_color: bool,
) -> String {
    if json {
        let items: Vec<_> = entries
            .iter()
            .map(|entry| {
                json!({
                    "key": entry.key,
                    "value": entry.value,
                    "scope": scope_name(entry.scope),
                    "expires_at": entry.expires_at.map(|at| at.to_rfc3339()),
                })
            })
            .collect();
        return serde_json::to_string_pretty(&items).unwrap_or_else(|_| "[]".to_string());
    }

    if entries.is_empty() {
        return "No cache entries.".to_string();
    }

    let mut table = new_table(&["Key", "Value", "Scope", "Expires"], no_color);
    for entry in entries {
        table.add_row(Row::from(vec![
            truncate(&entry.key, 40),
            truncate(&entry.value, 50),
            scope_name(entry.scope).to_string(),
            format_expiry(entry.expires_at, now),
        ]));
    }

    table.to_string()
}

/// Human expiry relative to `now`
pub fn format_expiry(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = expires_at else {
        return "never".to_string();
    };
    if at <= now {
        return "expired".to_string();
    }

    let secs = (at - now).num_seconds();
    if secs < 60 {
        format!("in {}s", secs)
    } else if secs < 3600 {
        format!("in {}m", secs / 60)
    } else if secs < 86_400 {
        format!("in {}h", secs / 3600)
    } else {
        format!("in {}d", secs / 86_400)
    }
}

fn scope_name(scope: Scope) -> &'static str {
    match scope {
        Scope::Persisted => "persisted",
        Scope::Session => "session",
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Format store counters (human or JSON)
pub fn format_stats(stats: &StoreStats, path: &Path, json: bool) -> String {
    if json {
        let value = json!({
            "path": path.display().to_string(),
            "persisted_entries": stats.persisted_entries,
            "session_entries": stats.session_entries,
            "loaded": stats.loaded,
            "flushes": stats.flushes,
            "flush_failures": stats.flush_failures,
        });
        return serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string());
    }

    let lines = [
        format!("Cache file:       {}", path.display()),
        format!("Persisted:        {}", stats.persisted_entries),
        format!("Session:          {}", stats.session_entries),
        format!("Loaded:           {}", if stats.loaded { "yes" } else { "no" }),
        format!("Flushes:          {}", stats.flushes),
        format!("Flush failures:   {}", stats.flush_failures),
    ];
    lines.join("\n")
}

// ============================================================================
// Fetch
// ============================================================================

/// Outcome seen by one consumer of a shared download
#[derive(Debug, Clone)]
pub struct ConsumerReport {
    pub consumer: usize,
    pub result: Result<usize, FetchError>,
}

/// Format the result of a `fetch` run
pub fn format_fetch_report(
    url: &str,
    reports: &[ConsumerReport],
    invocations: u32,
    json: bool,
    no_color: bool,
) -> String {
    if json {
        let consumers: Vec<_> = reports
            .iter()
            .map(|report| match &report.result {
                Ok(bytes) => json!({ "consumer": report.consumer, "bytes": bytes }),
                Err(e) => json!({ "consumer": report.consumer, "error": e.to_string() }),
            })
            .collect();
        let value = json!({
            "url": url,
            "producer_invocations": invocations,
            "consumers": consumers,
        });
        return serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string());
    }

    let mut table = new_table(&["Consumer", "Result"], no_color);
    for report in reports {
        let result = match &report.result {
            Ok(bytes) => format_bytes(*bytes),
            Err(e) => truncate(&e.to_string(), 60),
        };
        table.add_row(Row::from(vec![report.consumer.to_string(), result]));
    }

    format!(
        "{}\n{}\nProducer invocations: {}",
        url, table, invocations
    )
}

// ============================================================================
// Utilities
// ============================================================================

fn new_table(headers: &[&str], no_color: bool) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    if no_color {
        table.set_header(headers.to_vec());
    } else {
        table.set_header(
            headers
                .iter()
                .map(|h| Cell::new(h).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    }
    table
}

pub fn format_bytes(bytes: usize) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MiB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

fn truncate(s: &str, max: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max {
        s.to_string()
    } else {
        // Char-based so multi-byte text never splits
        s.chars().take(max.saturating_sub(1)).collect::<String>() + "…"
    }
}

// ============================================================================
// Tests
// ============================================================================
