//! Maintenance commands that physically remove settled data.

use driftsync_engine::{purgeable_tombstones, ChangeTracker};
use driftsync_protocol::{Clock, SystemClock};
use driftsync_store::LocalStore;
use std::sync::Arc;
use std::time::Duration;

fn hours(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(3600))
}

/// Removes tombstones deleted more than `older_than_hours` ago.
pub fn tombstones(
    store: Arc<LocalStore>,
    older_than_hours: u64,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cutoff = clock.now().saturating_sub(hours(older_than_hours));

    if dry_run {
        let keys = store.read(|tables| purgeable_tombstones(tables, cutoff));
        for key in &keys {
            println!("  {key}");
        }
        println!("{} tombstone(s) would be purged.", keys.len());
        return Ok(());
    }

    let purged = ChangeTracker::new(store, clock).purge_tombstones(cutoff)?;
    tracing::info!(purged, older_than_hours, "tombstones purged");
    println!("Purged {purged} tombstone(s).");
    Ok(())
}

/// Removes applied and conflicted outbox rows older than the retention window.
pub fn outbox(
    store: Arc<LocalStore>,
    retention_hours: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let now = clock.now();
    let pruned = ChangeTracker::new(store, clock).prune_applied(now, hours(retention_hours))?;
    tracing::info!(pruned, retention_hours, "outbox pruned");
    println!("Pruned {pruned} settled outbox row(s).");
    Ok(())
}

/// Drops audit entries older than the retention window, then the oldest
/// entries beyond `keep_last`.
pub fn audit(
    store: Arc<LocalStore>,
    retention_hours: u64,
    keep_last: usize,
) -> Result<usize, Box<dyn std::error::Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let now = clock.now();
    let pruned =
        ChangeTracker::new(store, clock).prune_audit(now, hours(retention_hours), keep_last)?;
    tracing::info!(pruned, retention_hours, keep_last, "audit log pruned");
    println!("Pruned {pruned} audit entr{}.", if pruned == 1 { "y" } else { "ies" });
    Ok(pruned)
}
