//! Contracts for the external collaborator this crate does not implement: the
//! storage/query read interface. `Subscription::start` and `LimitManager::commit`'s
//! refill step are the only call sites that cross this boundary.
//!
//! A reference in-memory implementation lives in [`crate::testutil`] for tests.

use async_trait::async_trait;

use crate::config::ChangefeedConfig;
use crate::datum::Datum;
use crate::error::Result;
use crate::mailbox::Addr;
use crate::mangle::Sorting;
use crate::wire::{PublisherId, Stamp};

/// Response to `subscribe_read`: every publisher mailbox serving the table, paired
/// with that publisher's identity.
pub struct SubscribeResponse {
    pub publisher_addrs: Vec<Addr<crate::wire::StampedMsg>>,
    pub publisher_ids: Vec<PublisherId>,
}

/// Response to `point_stamp_read`: the stamp and value observed at subscription
/// start time for one primary key.
pub struct PointStampReadResponse {
    pub start_stamp: Stamp,
    pub initial_val: Option<Datum>,
}

/// Response to `limit_subscribe_read`.
pub struct LimitSubscribeResponse {
    pub shard_count: usize,
    pub limit_addrs: Vec<Addr<LimitStopRequest>>,
}

/// Sent to a publisher's limit-stop mailbox when a limit subscriber goes away.
#[derive(Debug, Clone)]
pub struct LimitStopRequest {
    pub subscriber_addr: Addr<crate::wire::StampedMsg>,
    pub sindex: Option<String>,
    pub sub_id: crate::wire::SubscriptionId,
}

/// A limit subscription's declared shape: which rows it ranges over, how many it
/// keeps, and the direction it sorts in.
#[derive(Debug, Clone)]
pub struct LimitSpec {
    pub sindex: Option<String>,
    pub sorting: Sorting,
    pub limit: usize,
}

/// Direction-aware bound used to ask the read interface for "the next `n` rows past
/// the window's current edge": opens the primary or secondary range at the last item
/// currently in the window.
#[derive(Debug, Clone)]
pub struct RefillQuery {
    pub sindex: Option<String>,
    pub sorting: Sorting,
    /// Exclusive start bound: the sort key of the window's current worst-ranked
    /// element, or `None` to read from the beginning.
    pub start: Option<crate::mangle::SortKey>,
    pub limit: usize,
}

/// The read-side contract the storage/query layers expose to the changefeed core.
/// All methods are fallible because the underlying table may be re-sharded,
/// unavailable, or the query may be malformed.
#[async_trait]
pub trait NamespaceInterface: Send + Sync {
    /// Subscribes to every publisher serving the table, returning their mailboxes
    /// and identities so the caller can build a [`crate::subscriber::Feed`].
    async fn subscribe_read(
        &self,
        reply_to: Addr<crate::wire::StampedMsg>,
    ) -> Result<SubscribeResponse>;

    /// Reads the current next-stamp of every publisher, used by range
    /// subscriptions to know which envelopes predate their subscription.
    async fn stamp_read(
        &self,
        reply_to: Addr<crate::wire::StampedMsg>,
    ) -> Result<std::collections::HashMap<PublisherId, Stamp>>;

    /// Reads the stamp and current value for one primary key, used by point
    /// subscriptions.
    async fn point_stamp_read(
        &self,
        reply_to: Addr<crate::wire::StampedMsg>,
        key: &Datum,
    ) -> Result<PointStampReadResponse>;

    /// Registers a new limit subscription on every shard and returns the shard
    /// count (how many `limit_start` messages to expect) and the mailboxes to send
    /// `limit_stop` requests to on teardown.
    async fn limit_subscribe_read(
        &self,
        reply_to: Addr<crate::wire::StampedMsg>,
        sub_id: crate::wire::SubscriptionId,
        spec: LimitSpec,
        config: ChangefeedConfig,
    ) -> Result<LimitSubscribeResponse>;

    /// Reads up to `query.limit` rows past `query.start` in `query.sorting` order,
    /// used by `LimitManager::commit` to refill an underflowing window.
    async fn range_read(&self, query: RefillQuery) -> Result<Vec<crate::wire::KeyedItem>>;
}
