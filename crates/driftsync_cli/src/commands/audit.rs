//! Audit command implementation.

use driftsync_store::{AuditEntry, LocalStore, Tables};

/// Returns the last `limit` audit entries (all when `None`), optionally of
/// one kind.
///
/// `kind` may be an exact kind name or `conflict` for every conflict kind.
pub fn collect(tables: &Tables, limit: Option<usize>, kind: Option<&str>) -> Vec<AuditEntry> {
    let matching: Vec<&AuditEntry> = tables
        .audit()
        .iter()
        .filter(|entry| match kind {
            None => true,
            Some("conflict") => entry.kind.is_conflict(),
            Some(name) => entry.kind.as_str() == name,
        })
        .collect();
    let skip = limit.map_or(0, |n| matching.len().saturating_sub(n));
    matching.into_iter().skip(skip).cloned().collect()
}

/// Runs the audit command.
pub fn run(
    store: &LocalStore,
    limit: Option<usize>,
    kind: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = store.read(|tables| collect(tables, limit, kind));

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        _ => print_text_output(&entries),
    }
    Ok(())
}

fn print_text_output(entries: &[AuditEntry]) {
    if entries.is_empty() {
        println!("No audit entries.");
        return;
    }
    for entry in entries {
        println!(
            "#{:<6} {:>15}  {:<22} {}",
            entry.sequence, entry.at, entry.kind, entry.key
        );
        if let Some(before) = &entry.before {
            println!("        before: {} @ {}", payload(before), before.updated_at);
        }
        if let Some(after) = &entry.after {
            println!("        after:  {} @ {}", payload(after), after.updated_at);
        }
        if !entry.detail.is_empty() {
            println!("        {}", entry.detail);
        }
    }
}

fn payload(record: &driftsync_protocol::SyncableRecord) -> String {
    if record.is_deleted() {
        return "(deleted)".to_string();
    }
    serde_json::to_string(&record.payload).unwrap_or_default()
}
