//! Wire messages exchanged between a publisher [`crate::publisher::Server`] and a
//! subscriber-side [`crate::subscriber::Feed`].
//!
//! Field order and variant tags are part of the wire contract: don't reorder fields
//! or re-tag variants of [`ChangeMsg`] without a version bump, since
//! `limit_start` must be observed exactly once per `(sub, shard)` and replaying an
//! old mangled key against a newer encoding would desync a subscriber's shadow
//! window.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datum::Datum;

/// Per-(publisher, subscriber) monotonic sequence number. Starts at 0, never
/// decreases, increments by one per outgoing envelope.
pub type Stamp = u64;

/// Stamp value meaning "no further messages are coming" (used by
/// `Server::get_stamp` when the caller is no longer registered).
pub const STAMP_NONE: Stamp = u64::MAX;

/// Process-wide unique identity of one publisher (one storage shard).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublisherId(pub Uuid);

impl PublisherId {
    pub fn new() -> Self {
        PublisherId(Uuid::new_v4())
    }
}

impl Default for PublisherId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "publisher({})", self.0)
    }
}

/// Identity of a limit subscription, minted by the subscriber and used by both sides
/// to key limit-manager state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        SubscriptionId(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub({})", self.0)
    }
}

/// A mangled key, see [`crate::mangle`].
pub type MangledKey = String;

/// `(sindex_value, row)`; `sindex_value` is `Datum::Null` for primary-keyed limit
/// windows.
pub type Item = (Datum, Datum);

/// `(mangled_key, (sindex_value, row))`, the unit exchanged in `limit_start` /
/// `limit_change`.
pub type KeyedItem = (MangledKey, Item);

/// The tagged union of messages a publisher sends to a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChangeMsg {
    /// A single row mutation.
    Change(ChangeRecord),
    /// This publisher no longer serves this subscriber (table gone, shard drained).
    Stop,
    /// The initial contents of a limit window, sent exactly once per `(sub, shard)`.
    LimitStart {
        sub_id: SubscriptionId,
        start_data: Vec<KeyedItem>,
    },
    /// An incremental change to a limit window.
    LimitChange {
        sub_id: SubscriptionId,
        old_key: Option<MangledKey>,
        new_val: Option<KeyedItem>,
    },
    /// The limit manager serving `sub_id` aborted; carries a human-readable cause.
    LimitStop { sub_id: SubscriptionId, error: String },
}

/// `old_indexes`/`new_indexes` are keyed by secondary-index name; each maps to the
/// multiset of index values the row held under that index before/after the write.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChangeRecord {
    pub old_indexes: HashMap<String, Vec<Datum>>,
    pub new_indexes: HashMap<String, Vec<Datum>>,
    pub old_val: Option<Datum>,
    pub new_val: Option<Datum>,
}

/// An envelope as it travels the wire: publisher identity + stamp + payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampedMsg {
    pub publisher_id: PublisherId,
    pub stamp: Stamp,
    pub msg: ChangeMsg,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_msg_round_trips_through_json() {
        let msg = StampedMsg {
            publisher_id: PublisherId::new(),
            stamp: 7,
            msg: ChangeMsg::LimitStart {
                sub_id: SubscriptionId::new(),
                start_data: vec![("k".to_string(), (Datum::Null, Datum::from(1)))],
            },
        };
        let encoded = serde_json::to_string(&msg).expect("encode");
        let decoded: StampedMsg = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.stamp, 7);
        match decoded.msg {
            ChangeMsg::LimitStart { start_data, .. } => assert_eq!(start_data.len(), 1),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
