//! Last-write-wins conflict resolution.

use crate::change::{ChangeRecord, WireChange};
use crate::record::{SyncableRecord, Timestamp};
use serde::{Deserialize, Serialize};

/// Outcome of comparing a local record with an incoming remote one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The remote value is newer (or there is no local value); apply it.
    AcceptRemote,
    /// The local value is newer; keep it and push it again.
    KeepLocal,
    /// Both carry the same timestamp; treated as already consistent.
    NoOp,
}

/// Anything carrying a modification timestamp.
pub trait Versioned {
    /// Last modification time.
    fn updated_at(&self) -> Timestamp;
}

impl Versioned for SyncableRecord {
    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }
}

impl Versioned for ChangeRecord {
    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }
}

impl Versioned for WireChange {
    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }
}

/// Decides which side wins.
///
/// The result depends only on the sign of `remote.updated_at - local.updated_at`;
/// payloads are never inspected.
pub fn resolve<L, R>(local: Option<&L>, remote: &R) -> Resolution
where
    L: Versioned + ?Sized,
    R: Versioned + ?Sized,
{
    let Some(local) = local else {
        return Resolution::AcceptRemote;
    };
    match remote.updated_at().cmp(&local.updated_at()) {
        std::cmp::Ordering::Greater => Resolution::AcceptRemote,
        std::cmp::Ordering::Less => Resolution::KeepLocal,
        std::cmp::Ordering::Equal => Resolution::NoOp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Payload;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(updated_at: i64, payload: Payload) -> SyncableRecord {
        SyncableRecord::new("voter", "v1", payload, Timestamp::from_millis(updated_at))
    }

    #[test]
    fn missing_local_accepts_remote() {
        let remote = record(5, Payload::new());
        assert_eq!(
            resolve::<SyncableRecord, _>(None, &remote),
            Resolution::AcceptRemote
        );
    }

    #[test]
    fn compares_timestamps() {
        let local = record(10, Payload::new());
        assert_eq!(
            resolve(Some(&local), &record(11, Payload::new())),
            Resolution::AcceptRemote
        );
        assert_eq!(
            resolve(Some(&local), &record(9, Payload::new())),
            Resolution::KeepLocal
        );
        assert_eq!(
            resolve(Some(&local), &record(10, Payload::new())),
            Resolution::NoOp
        );
    }

    #[test]
    fn tombstone_is_just_another_write() {
        let local = record(10, Payload::new());
        let remote = record(5, Payload::new()).tombstoned(Timestamp::from_millis(20), "clerk");
        assert_eq!(resolve(Some(&local), &remote), Resolution::AcceptRemote);
    }

    fn arb_payload() -> impl Strategy<Value = Payload> {
        proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..4).prop_map(|fields| {
            fields
                .into_iter()
                .map(|(k, v)| (k, json!(v)))
                .collect::<Payload>()
        })
    }

    proptest! {
        #[test]
        fn outcome_depends_only_on_timestamp_sign(
            t1 in -1_000_000i64..1_000_000,
            t2 in -1_000_000i64..1_000_000,
            local_payload in arb_payload(),
            remote_payload in arb_payload(),
        ) {
            let local = record(t1, local_payload);
            let remote = record(t2, remote_payload);
            let expected = match (t2 - t1).signum() {
                1 => Resolution::AcceptRemote,
                -1 => Resolution::KeepLocal,
                _ => Resolution::NoOp,
            };
            prop_assert_eq!(resolve(Some(&local), &remote), expected);
            prop_assert_eq!(resolve(Some(&local), &record(t2, Payload::new())), expected);
        }
    }
}
