//! Dependency-ordered batching of outbox rows.

use crate::error::SyncResult;
use driftsync_protocol::{ChangeRecord, PushRequest, RecordType, TypeOrder, WireMessage};
use std::collections::BTreeMap;

/// A size- and count-bounded run of changes of one record type.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Type shared by every change in the batch.
    pub record_type: RecordType,
    /// Changes in enqueue order.
    pub changes: Vec<ChangeRecord>,
    /// Encoded size of the push request carrying this batch.
    pub serialized_size: usize,
}

impl Batch {
    /// Wire form of the batch.
    pub fn to_request(&self) -> PushRequest {
        PushRequest::new(self.changes.iter().map(ChangeRecord::to_wire).collect())
    }

    /// Number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Splits the batch into two halves, keeping enqueue order.
    pub fn split(mut self) -> SyncResult<(Batch, Batch)> {
        let back = self.changes.split_off(self.changes.len() / 2);
        let front = Self::sized(self.record_type.clone(), self.changes)?;
        let back = Self::sized(self.record_type, back)?;
        Ok((front, back))
    }

    fn sized(record_type: RecordType, changes: Vec<ChangeRecord>) -> SyncResult<Batch> {
        let mut batch = Batch {
            record_type,
            changes,
            serialized_size: 0,
        };
        batch.serialized_size = batch.to_request().encode()?.len();
        Ok(batch)
    }
}

/// Result of sorting the outbox.
#[derive(Debug, Default)]
pub struct SortOutput {
    /// Batches in transmission order.
    pub batches: Vec<Batch>,
    /// Changes too large to fit any batch, with their encoded size.
    pub oversized: Vec<(ChangeRecord, usize)>,
}

/// Orders pending changes so parents are sent before children.
#[derive(Debug, Clone)]
pub struct DependencySorter<'a> {
    order: &'a TypeOrder,
    max_payload_size: usize,
    max_changes: usize,
}

impl<'a> DependencySorter<'a> {
    /// Creates a sorter for the given type order and size bound.
    pub fn new(order: &'a TypeOrder, max_payload_size: usize) -> Self {
        Self {
            order,
            max_payload_size,
            max_changes: usize::MAX,
        }
    }

    /// Also caps the number of changes per batch.
    pub fn with_max_changes(mut self, max_changes: usize) -> Self {
        self.max_changes = max_changes.max(1);
        self
    }

    /// Groups `changes` by type, orders the groups by priority and splits
    /// each group at the payload and count bounds.
    ///
    /// Types missing from the configured order come last, by name.
    pub fn sort(&self, mut changes: Vec<ChangeRecord>) -> SyncResult<SortOutput> {
        changes.sort_by_key(|c| c.sequence);

        let mut groups: BTreeMap<(usize, RecordType), Vec<ChangeRecord>> = BTreeMap::new();
        for change in changes {
            let rank = self
                .order
                .priority(&change.record_type)
                .unwrap_or(usize::MAX);
            groups
                .entry((rank, change.record_type.clone()))
                .or_default()
                .push(change);
        }

        let envelope = PushRequest::envelope_size();
        let mut output = SortOutput::default();
        for ((_, record_type), group) in groups {
            let mut current = Batch {
                record_type: record_type.clone(),
                changes: Vec::new(),
                serialized_size: envelope,
            };
            for change in group {
                let size = change.to_wire().encoded_size()?;
                if envelope + size > self.max_payload_size {
                    output.oversized.push((change, size));
                    continue;
                }
                let full = current.serialized_size + size > self.max_payload_size
                    || current.len() >= self.max_changes;
                if full && !current.is_empty() {
                    let done = std::mem::replace(
                        &mut current,
                        Batch {
                            record_type: record_type.clone(),
                            changes: Vec::new(),
                            serialized_size: envelope,
                        },
                    );
                    output.batches.push(done);
                }
                current.serialized_size += size;
                current.changes.push(change);
            }
            if !current.is_empty() {
                output.batches.push(current);
            }
        }

        tracing::debug!(
            batches = output.batches.len(),
            oversized = output.oversized.len(),
            "sorted outbox"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_protocol::{Payload, RecordSchema, SyncableRecord, Timestamp};
    use proptest::prelude::*;
    use serde_json::json;

    fn order() -> TypeOrder {
        TypeOrder::new(vec![
            RecordSchema::new("user"),
            RecordSchema::new("tally_session").reference("user_id", "user"),
            RecordSchema::new("tally_line").reference("session_id", "tally_session"),
        ])
        .unwrap()
    }

    fn change(record_type: &str, id: &str, sequence: u64) -> ChangeRecord {
        let record = SyncableRecord::new(
            record_type,
            id,
            Payload::new(),
            Timestamp::from_millis(1_000),
        );
        ChangeRecord::from_record(&record, sequence, Timestamp::from_millis(1_000))
    }

    fn flatten(output: &SortOutput) -> Vec<String> {
        output
            .batches
            .iter()
            .flat_map(|b| b.changes.iter().map(|c| c.key().to_string()))
            .collect()
    }

    #[test]
    fn parents_precede_children() {
        let order = order();
        let sorter = DependencySorter::new(&order, 64 * 1024);
        let output = sorter
            .sort(vec![
                change("tally_line", "tl1", 1),
                change("user", "u1", 2),
                change("tally_session", "ts1", 3),
            ])
            .unwrap();

        assert_eq!(
            flatten(&output),
            vec!["user/u1", "tally_session/ts1", "tally_line/tl1"]
        );
        assert_eq!(output.batches.len(), 3);
    }

    #[test]
    fn unknown_types_come_last_by_name() {
        let order = order();
        let sorter = DependencySorter::new(&order, 64 * 1024);
        let output = sorter
            .sort(vec![
                change("zeta", "z1", 1),
                change("alpha", "a1", 2),
                change("user", "u1", 3),
            ])
            .unwrap();
        assert_eq!(flatten(&output), vec!["user/u1", "alpha/a1", "zeta/z1"]);
    }

    #[test]
    fn groups_split_at_payload_bound() {
        let order = order();
        let one = change("user", "u0", 0).to_wire().encoded_size().unwrap();
        let limit = PushRequest::envelope_size() + one * 2;
        let sorter = DependencySorter::new(&order, limit);

        let output = sorter
            .sort((0..5).map(|i| change("user", &format!("u{i}"), i)).collect())
            .unwrap();

        let sizes: Vec<usize> = output.batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        for batch in &output.batches {
            assert!(batch.serialized_size <= limit);
            assert!(batch.to_request().encode().unwrap().len() <= limit);
        }
    }

    #[test]
    fn groups_split_at_change_count() {
        let order = order();
        let sorter = DependencySorter::new(&order, 64 * 1024 * 1024).with_max_changes(500);

        let output = sorter
            .sort((0..1_200).map(|i| change("user", &format!("u{i}"), i)).collect())
            .unwrap();

        let sizes: Vec<usize> = output.batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![500, 500, 200]);
        assert_eq!(output.batches[1].changes[0].id.as_str(), "u500");
    }

    #[test]
    fn oversized_changes_are_set_aside() {
        let order = order();
        let sorter = DependencySorter::new(&order, 200);
        let mut big = change("user", "big", 1);
        big.payload
            .insert("blob".into(), json!("x".repeat(500)));

        let output = sorter.sort(vec![big, change("user", "u1", 2)]).unwrap();
        assert_eq!(output.oversized.len(), 1);
        assert!(output.oversized[0].1 > 200);
        assert_eq!(flatten(&output), vec!["user/u1"]);
    }

    proptest! {
        #[test]
        fn shuffled_input_keeps_type_priority(
            keys in proptest::collection::vec((0usize..3, 0u64..1_000), 1..40),
        ) {
            let order = order();
            let types = ["user", "tally_session", "tally_line"];
            let changes: Vec<ChangeRecord> = keys
                .iter()
                .enumerate()
                .map(|(i, (t, seq))| change(types[*t], &format!("r{i}"), *seq))
                .collect();

            let output = DependencySorter::new(&order, 2048).sort(changes).unwrap();
            let flat: Vec<&ChangeRecord> =
                output.batches.iter().flat_map(|b| b.changes.iter()).collect();

            prop_assert_eq!(flat.len(), keys.len());
            for pair in flat.windows(2) {
                let a = order.priority(&pair[0].record_type).unwrap();
                let b = order.priority(&pair[1].record_type).unwrap();
                prop_assert!(a <= b);
                if a == b {
                    prop_assert!(pair[0].sequence <= pair[1].sequence);
                }
            }
        }
    }
}
