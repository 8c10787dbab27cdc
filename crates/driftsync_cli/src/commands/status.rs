//! Status command implementation.

use driftsync_engine::{abandoned, pending_count};
use driftsync_protocol::Timestamp;
use driftsync_store::{LocalStore, Tables};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Store summary.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Store path.
    pub path: String,
    /// Live records.
    pub live_records: usize,
    /// Tombstoned records.
    pub tombstones: usize,
    /// Outbox rows per status.
    pub outbox: BTreeMap<&'static str, usize>,
    /// Changes still owed to the server.
    pub pending: usize,
    /// Changes whose retries ran out.
    pub abandoned: usize,
    /// Retry tickets of any state.
    pub tickets: usize,
    /// Pull cursor timestamp.
    pub last_sync_timestamp: Timestamp,
    /// Pull cursor offset.
    pub page_offset: u64,
    /// Audit entries.
    pub audit_entries: usize,
}

/// Summarizes `tables`.
pub fn collect(tables: &Tables, path: &Path) -> StatusReport {
    let mut outbox = BTreeMap::new();
    for row in tables.changes() {
        *outbox.entry(row.status.as_str()).or_insert(0) += 1;
    }
    let tombstones = tables.records().filter(|r| r.is_deleted()).count();
    let cursor = tables.cursor();

    StatusReport {
        path: path.display().to_string(),
        live_records: tables.records().count() - tombstones,
        tombstones,
        outbox,
        pending: pending_count(tables),
        abandoned: abandoned(tables).len(),
        tickets: tables.tickets().count(),
        last_sync_timestamp: cursor.last_sync_timestamp,
        page_offset: cursor.page_offset,
        audit_entries: tables.audit().len(),
    }
}

/// Runs the status command.
pub fn run(store: &LocalStore, path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = store.read(|tables| collect(tables, path));

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text_output(&report),
    }
    Ok(())
}

fn print_text_output(report: &StatusReport) {
    println!("Store: {}", report.path);
    println!();
    println!("Records:");
    println!("  Live:       {}", report.live_records);
    println!("  Tombstones: {}", report.tombstones);
    println!();
    println!("Outbox:");
    if report.outbox.is_empty() {
        println!("  (empty)");
    }
    for (status, count) in &report.outbox {
        println!("  {:<20} {}", status, count);
    }
    println!("  Pending:   {}", report.pending);
    println!("  Abandoned: {}", report.abandoned);
    println!("  Tickets:   {}", report.tickets);
    println!();
    println!("Cursor:");
    println!("  Last sync: {}", report.last_sync_timestamp);
    println!("  Offset:    {}", report.page_offset);
    println!();
    println!("Audit entries: {}", report.audit_entries);
}
