//! Server-side record storage and change log.

use driftsync_protocol::{ChangeKey, Clock, Timestamp, WireChange};
use parking_lot::RwLock;
use std::collections::HashMap;

/// An accepted change and the time the server stored it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChange {
    /// Server storage timestamp; strictly increasing across the log.
    pub stored_at: Timestamp,
    /// The change as accepted.
    pub change: WireChange,
}

/// What happened when a change was offered to the store.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Offer {
    /// Newer than what the server held; stored and logged.
    Stored(Timestamp),
    /// Byte-for-byte what the server already holds.
    Replay,
    /// Not newer; the server keeps its value.
    Stale(WireChange),
}

#[derive(Debug, Default)]
pub(crate) struct State {
    records: HashMap<ChangeKey, WireChange>,
    log: Vec<StoredChange>,
    high_water: Timestamp,
}

impl State {
    pub(crate) fn contains(&self, key: &ChangeKey) -> bool {
        self.records.contains_key(key)
    }

    /// Offers a change under last-write-wins.
    ///
    /// Only a strictly newer `updated_at` replaces the current value.
    pub(crate) fn offer(&mut self, change: &WireChange, now: Timestamp) -> Offer {
        let key = change.key();
        if let Some(current) = self.records.get(&key) {
            if current == change {
                return Offer::Replay;
            }
            if change.updated_at <= current.updated_at {
                return Offer::Stale(current.clone());
            }
        }

        let stored_at = now.max(self.high_water.next());
        self.high_water = stored_at;
        self.records.insert(key, change.clone());
        self.log.push(StoredChange {
            stored_at,
            change: change.clone(),
        });
        Offer::Stored(stored_at)
    }

    pub(crate) fn high_water(&self) -> Timestamp {
        self.high_water
    }

    /// Changes stored after `since`, skipping `offset` and taking `limit`.
    ///
    /// Returns the page and whether more entries follow it.
    pub(crate) fn page(&self, since: Timestamp, offset: u64, limit: u32) -> (Vec<WireChange>, bool) {
        // The log is sorted by stored_at.
        let start = self.log.partition_point(|entry| entry.stored_at <= since);
        let visible = &self.log[start..];
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let limit = limit as usize;

        let page: Vec<WireChange> = visible
            .iter()
            .skip(offset)
            .take(limit)
            .map(|entry| entry.change.clone())
            .collect();
        let has_more = visible.len() > offset.saturating_add(limit);
        (page, has_more)
    }
}

/// The remote store: current values plus an append-only change log.
#[derive(Debug, Default)]
pub struct RemoteStore {
    state: RwLock<State>,
}

impl RemoteStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a record.
    pub fn get(&self, key: &ChangeKey) -> Option<WireChange> {
        self.state.read().records.get(key).cloned()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// Returns true if no record is held.
    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    /// Number of entries in the change log.
    pub fn log_len(&self) -> usize {
        self.state.read().log.len()
    }

    /// Latest storage timestamp handed out.
    pub fn high_water(&self) -> Timestamp {
        self.state.read().high_water
    }

    /// Full change log, oldest first.
    pub fn log(&self) -> Vec<StoredChange> {
        self.state.read().log.clone()
    }

    /// Writes a change directly, bypassing validation. Seeds server data.
    pub fn seed(&self, change: &WireChange, clock: &dyn Clock) -> bool {
        matches!(self.state.write().offer(change, clock.now()), Offer::Stored(_))
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        f(&self.state.read())
    }

    pub(crate) fn write<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.write())
    }
}
