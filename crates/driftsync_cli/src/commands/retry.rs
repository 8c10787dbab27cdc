//! Retry command implementations.

use driftsync_engine::{abandoned, RetryConfig, RetryController, SyncError};
use driftsync_protocol::SystemClock;
use driftsync_store::{LocalStore, RetryTicket};
use std::sync::Arc;

/// Lists abandoned retry tickets.
pub fn list(store: &LocalStore, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let tickets = store.read(abandoned);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&tickets)?),
        _ => print_text_output(&tickets),
    }
    Ok(())
}

fn print_text_output(tickets: &[RetryTicket]) {
    if tickets.is_empty() {
        println!("No abandoned changes.");
        return;
    }
    for ticket in tickets {
        println!(
            "{}  kind={} attempts={} gave up at {}",
            ticket.change_id, ticket.kind, ticket.attempt_count, ticket.next_retry_at
        );
        println!("    {}", ticket.last_error);
    }
    println!();
    println!(
        "{} abandoned change(s). Use `retry` to try again or `discard` to drop.",
        tickets.len()
    );
}

fn controller() -> RetryController {
    RetryController::new(RetryConfig::default(), Arc::new(SystemClock))
}

/// Schedules a change for immediate retry with a fresh attempt budget.
pub fn force(
    store: Arc<LocalStore>,
    record_type: &str,
    id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let key = super::key(record_type, id);
    let retry = controller();
    store.transaction(|txn| retry.force_retry(txn, &key))?;
    println!("{key} will be retried on the next sync cycle.");
    Ok(())
}

/// Drops a change's retry ticket and marks it failed.
pub fn discard(
    store: Arc<LocalStore>,
    record_type: &str,
    id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let key = super::key(record_type, id);
    let retry = controller();
    store.transaction(|txn| retry.discard(txn, &key))?;
    println!("{key} discarded; it will not be pushed again.");
    Ok(())
}
