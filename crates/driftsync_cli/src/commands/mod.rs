//! CLI command implementations.

pub mod audit;
pub mod outbox;
pub mod purge;
pub mod retry;
pub mod status;

use driftsync_protocol::{ChangeKey, Timestamp};
use driftsync_store::{LocalStore, StoreConfig};
use std::path::Path;
use std::sync::Arc;

/// Opens an existing store file; never creates one.
pub fn open(path: &Path) -> Result<Arc<LocalStore>, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No store found at {}", path.display()).into());
    }
    let store = LocalStore::open(path, StoreConfig::new().create_if_missing(false))?;
    Ok(Arc::new(store))
}

/// Builds a change key from command arguments.
pub fn key(record_type: &str, id: &str) -> ChangeKey {
    ChangeKey::new(record_type, id)
}

/// Formats an optional timestamp for text output.
pub fn show(at: Option<Timestamp>) -> String {
    at.map_or_else(|| "-".to_string(), |t| t.to_string())
}
