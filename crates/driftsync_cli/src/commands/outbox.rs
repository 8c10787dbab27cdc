//! Outbox command implementation.

use driftsync_protocol::Timestamp;
use driftsync_store::{LocalStore, Tables};
use serde::Serialize;

/// One outbox row as shown to operators.
#[derive(Debug, Serialize)]
pub struct OutboxRow {
    /// Queue position.
    pub sequence: u64,
    /// Record type.
    pub record_type: String,
    /// Record id.
    pub id: String,
    /// Queue state.
    pub status: &'static str,
    /// Whether the change is a tombstone.
    pub deleted: bool,
    /// Modification time carried by the change.
    pub updated_at: Timestamp,
    /// Retry ticket state, if any.
    pub ticket: Option<String>,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Next scheduled attempt.
    pub next_retry_at: Option<Timestamp>,
    /// Last failure message.
    pub last_error: Option<String>,
}

/// Lists outbox rows in queue order, optionally keeping one status.
pub fn collect(tables: &Tables, status: Option<&str>) -> Vec<OutboxRow> {
    tables
        .changes()
        .into_iter()
        .filter(|row| status.map_or(true, |s| row.status.as_str() == s))
        .map(|row| {
            let ticket = tables.ticket(&row.key());
            OutboxRow {
                sequence: row.sequence,
                record_type: row.record_type.to_string(),
                id: row.id.to_string(),
                status: row.status.as_str(),
                deleted: row.lifecycle.is_deleted(),
                updated_at: row.updated_at,
                ticket: ticket.map(|t| t.state.to_string()),
                attempts: ticket.map_or(0, |t| t.attempt_count),
                next_retry_at: ticket.map(|t| t.next_retry_at),
                last_error: ticket.map(|t| t.last_error.clone()),
            }
        })
        .collect()
}

/// Runs the outbox command.
pub fn run(
    store: &LocalStore,
    status: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let rows = store.read(|tables| collect(tables, status));

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => print_text_output(&rows),
    }
    Ok(())
}

fn print_text_output(rows: &[OutboxRow]) {
    if rows.is_empty() {
        println!("Outbox is empty.");
        return;
    }
    println!(
        "{:>6}  {:<12} {:<20} {:<10} {:<12} {:>8}  {}",
        "SEQ", "STATUS", "KEY", "TICKET", "NEXT RETRY", "ATTEMPTS", "LAST ERROR"
    );
    for row in rows {
        let key = format!("{}/{}", row.record_type, row.id);
        let key = if row.deleted { format!("{key} (x)") } else { key };
        println!(
            "{:>6}  {:<12} {:<20} {:<10} {:<12} {:>8}  {}",
            row.sequence,
            row.status,
            key,
            row.ticket.as_deref().unwrap_or("-"),
            super::show(row.next_retry_at),
            row.attempts,
            row.last_error.as_deref().unwrap_or(""),
        );
    }
    println!();
    println!("{} row(s)", rows.len());
}
