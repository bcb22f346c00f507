//! Subscriber-side per-table multiplexer.
//!
//! One [`Feed`] per table a subscriber is interested in, owning one [`OrderedQueue`]
//! per publisher and the registries of locally-attached subscriptions.
//! `dispatch_change` extracts a row's primary key via `pkey_field`, since the wire
//! envelope itself carries no dedicated key field.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use log::warn;
use parking_lot::RwLock;

use crate::config::ChangefeedConfig;
use crate::datum::{self, Datum};
use crate::error::{Error, Result};
use crate::external::NamespaceInterface;
use crate::mailbox::{Addr, MailboxManager, PeerId};
use crate::mangle::LimitOrder;
use crate::ordering::OrderedQueue;
use crate::wire::{ChangeMsg, PublisherId, StampedMsg, SubscriptionId};

use super::subscription::{LimitSubscription, PointSubscription, RangePredicate, RangeSubscription, Subscription};

fn canon_key(key: &Datum) -> String {
    serde_json::to_string(key).unwrap_or_default()
}

/// Per-table subscriber-side multiplexer. Shared by every subscription the
/// subscriber holds against this table.
pub struct Feed {
    addr: Addr<StampedMsg>,
    ns: Arc<dyn NamespaceInterface>,
    pkey_field: String,
    config: ChangefeedConfig,
    queues: RwLock<HashMap<PublisherId, OrderedQueue>>,
    point_subs: RwLock<HashMap<String, Vec<Arc<PointSubscription>>>>,
    range_subs: RwLock<Vec<Arc<RangeSubscription>>>,
    limit_subs: RwLock<HashMap<SubscriptionId, Arc<LimitSubscription>>>,
    detached: AtomicBool,
    sub_count: AtomicUsize,
}

impl Feed {
    /// Issues the `subscribe_read` construction sequence: opens this feed's own
    /// mailbox, asks the namespace interface for every publisher serving the table,
    /// seeds one ordered queue per publisher, then spawns the dispatch loop and one
    /// disconnect watcher per distinct publisher peer.
    pub async fn new(
        ns: Arc<dyn NamespaceInterface>,
        mailboxes: MailboxManager,
        pkey_field: String,
        config: ChangefeedConfig,
    ) -> Result<Arc<Self>> {
        let (peer, _handle) = mailboxes.new_peer();
        let (addr, mailbox) = mailboxes.open::<StampedMsg>(peer, config.mailbox_channel_size);

        let resp = ns.subscribe_read(addr.clone()).await?;
        let mut queues = HashMap::new();
        for publisher_id in &resp.publisher_ids {
            queues.insert(*publisher_id, OrderedQueue::new());
        }

        let feed = Arc::new(Feed {
            addr,
            ns,
            pkey_field,
            config,
            queues: RwLock::new(queues),
            point_subs: RwLock::new(HashMap::new()),
            range_subs: RwLock::new(Vec::new()),
            limit_subs: RwLock::new(HashMap::new()),
            detached: AtomicBool::new(false),
            sub_count: AtomicUsize::new(0),
        });

        {
            let feed = Arc::clone(&feed);
            tokio::spawn(async move {
                let mut mailbox = mailbox;
                while let Some(env) = mailbox.recv().await {
                    feed.handle_envelope(env);
                }
            });
        }

        let mut seen_peers: HashSet<PeerId> = HashSet::new();
        for publisher_addr in &resp.publisher_addrs {
            if seen_peers.insert(publisher_addr.peer()) {
                let feed = Arc::clone(&feed);
                let mailboxes = mailboxes.clone();
                let peer = publisher_addr.peer();
                tokio::spawn(async move {
                    mailboxes.disconnect_watcher(peer).await;
                    feed.detach(Error::Disconnected);
                });
            }
        }

        Ok(feed)
    }

    /// This feed's own mailbox address, handed to the namespace interface by every
    /// subscription's `start` so that read-time state and the ordered live stream
    /// share one stamp sequence per publisher.
    pub fn addr(&self) -> Addr<StampedMsg> {
        self.addr.clone()
    }

    pub fn ns(&self) -> &Arc<dyn NamespaceInterface> {
        &self.ns
    }

    pub fn config(&self) -> &ChangefeedConfig {
        &self.config
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(AtomicOrdering::SeqCst)
    }

    /// Number of subscriptions currently attached. The Client registry evicts a feed
    /// only once this reaches zero.
    pub fn num_subs(&self) -> usize {
        self.sub_count.load(AtomicOrdering::SeqCst)
    }

    pub fn attach_point(self: &Arc<Self>, key: Datum) -> Arc<PointSubscription> {
        let canon = canon_key(&key);
        let sub = Arc::new(PointSubscription::new(key, self.config.array_size_limit));
        self.point_subs.write().entry(canon).or_default().push(Arc::clone(&sub));
        self.sub_count.fetch_add(1, AtomicOrdering::SeqCst);
        sub
    }

    pub fn detach_point(&self, sub: &Arc<PointSubscription>) {
        let canon = canon_key(sub.key());
        let mut subs = self.point_subs.write();
        if let Some(bucket) = subs.get_mut(&canon) {
            bucket.retain(|s| !Arc::ptr_eq(s, sub));
            if bucket.is_empty() {
                subs.remove(&canon);
            }
        }
        drop(subs);
        self.sub_count.fetch_sub(1, AtomicOrdering::SeqCst);
    }

    pub fn attach_range(self: &Arc<Self>, predicate: RangePredicate) -> Arc<RangeSubscription> {
        let sub = Arc::new(RangeSubscription::new(predicate, self.config.array_size_limit));
        self.range_subs.write().push(Arc::clone(&sub));
        self.sub_count.fetch_add(1, AtomicOrdering::SeqCst);
        sub
    }

    pub fn detach_range(&self, sub: &Arc<RangeSubscription>) {
        self.range_subs.write().retain(|s| !Arc::ptr_eq(s, sub));
        self.sub_count.fetch_sub(1, AtomicOrdering::SeqCst);
    }

    pub fn attach_limit(self: &Arc<Self>, sub_id: SubscriptionId, order: LimitOrder, limit: usize) -> Arc<LimitSubscription> {
        let sub = Arc::new(LimitSubscription::new(sub_id, order, limit, self.config.array_size_limit));
        self.limit_subs.write().insert(sub_id, Arc::clone(&sub));
        self.sub_count.fetch_add(1, AtomicOrdering::SeqCst);
        sub
    }

    /// Removes `sub` from the registry and, for each shard it registered with,
    /// asks that shard's `Server` to drop its `LimitManager`: a limit manager lives
    /// only as long as the subscriber that created it.
    pub async fn detach_limit(&self, sub: &Arc<LimitSubscription>) {
        self.limit_subs.write().remove(&sub.sub_id());
        self.sub_count.fetch_sub(1, AtomicOrdering::SeqCst);
        for stop_addr in sub.teardown_addrs() {
            let _ = stop_addr
                .send(crate::external::LimitStopRequest {
                    subscriber_addr: self.addr.clone(),
                    sindex: None,
                    sub_id: sub.sub_id(),
                })
                .await;
        }
    }

    fn handle_envelope(&self, env: StampedMsg) {
        let publisher_id = env.publisher_id;
        let drained = {
            let queues = self.queues.read();
            match queues.get(&publisher_id) {
                Some(queue) => queue.push_and_drain(env),
                // A publisher we weren't subscribed to at construction time; the
                // table must have been re-sharded underneath us. Drop it rather
                // than desync an unrelated queue.
                None => return,
            }
        };
        for msg in drained {
            self.dispatch(msg);
        }
    }

    fn dispatch(&self, env: StampedMsg) {
        match env.msg {
            ChangeMsg::Change(record) => self.dispatch_change(env.publisher_id, env.stamp, record),
            ChangeMsg::Stop => self.detach(Error::Disconnected),
            ChangeMsg::LimitStart { sub_id, start_data } => {
                if let Some(sub) = self.limit_subs.read().get(&sub_id).cloned() {
                    sub.on_limit_start(start_data);
                }
            }
            ChangeMsg::LimitChange { sub_id, old_key, new_val } => {
                if let Some(sub) = self.limit_subs.read().get(&sub_id).cloned() {
                    sub.on_limit_change(old_key, new_val);
                }
            }
            ChangeMsg::LimitStop { sub_id, error } => {
                if let Some(sub) = self.limit_subs.read().get(&sub_id).cloned() {
                    sub.on_limit_stop(error);
                }
            }
        }
    }

    fn dispatch_change(&self, publisher_id: PublisherId, stamp: u64, record: crate::wire::ChangeRecord) {
        let pkey = record
            .new_val
            .as_ref()
            .and_then(|v| datum::get_field(v, &self.pkey_field))
            .or_else(|| record.old_val.as_ref().and_then(|v| datum::get_field(v, &self.pkey_field)))
            .cloned();
        if let Some(pkey) = &pkey {
            let canon = canon_key(pkey);
            if let Some(subs) = self.point_subs.read().get(&canon) {
                for sub in subs {
                    sub.add_el(stamp, record.new_val.clone());
                }
            }
        }
        for sub in self.range_subs.read().iter() {
            sub.dispatch_change(publisher_id, stamp, pkey.as_ref(), &record);
        }
    }

    /// Latches `err` on every attached subscription and marks this feed detached.
    /// Idempotent: a second caller (e.g. a second peer disconnecting) is a no-op.
    pub fn detach(&self, err: Error) {
        if self.detached.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        warn!("feed on pkey field {:?} aborting {} subscriptions: {err}", self.pkey_field, self.sub_count.load(AtomicOrdering::SeqCst));
        for bucket in self.point_subs.read().values() {
            for sub in bucket {
                sub.core().latch_error(err.clone());
            }
        }
        for sub in self.range_subs.read().iter() {
            sub.core().latch_error(err.clone());
        }
        for sub in self.limit_subs.read().values() {
            sub.core().latch_error(err.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{PointStampReadResponse, SubscribeResponse};
    use crate::mangle::Sorting;
    use crate::wire::ChangeRecord;
    use serde_json::json;
    use std::time::Duration;

    struct StubNs {
        publisher_addrs: Vec<Addr<StampedMsg>>,
        publisher_ids: Vec<PublisherId>,
    }

    #[async_trait::async_trait]
    impl NamespaceInterface for StubNs {
        async fn subscribe_read(&self, _reply_to: Addr<StampedMsg>) -> Result<SubscribeResponse> {
            Ok(SubscribeResponse {
                publisher_addrs: self.publisher_addrs.clone(),
                publisher_ids: self.publisher_ids.clone(),
            })
        }
        async fn stamp_read(&self, _reply_to: Addr<StampedMsg>) -> Result<HashMap<PublisherId, u64>> {
            Ok(self.publisher_ids.iter().map(|id| (*id, 0)).collect())
        }
        async fn point_stamp_read(&self, _reply_to: Addr<StampedMsg>, _key: &Datum) -> Result<PointStampReadResponse> {
            Ok(PointStampReadResponse { start_stamp: 0, initial_val: None })
        }
        async fn limit_subscribe_read(
            &self,
            _reply_to: Addr<StampedMsg>,
            _sub_id: SubscriptionId,
            _spec: crate::external::LimitSpec,
            _config: ChangefeedConfig,
        ) -> Result<crate::external::LimitSubscribeResponse> {
            unimplemented!()
        }
        async fn range_read(&self, _query: crate::external::RefillQuery) -> Result<Vec<crate::wire::KeyedItem>> {
            Ok(Vec::new())
        }
    }

    async fn feed_with_one_publisher() -> (Arc<Feed>, Addr<StampedMsg>, PublisherId) {
        let mailboxes = MailboxManager::new();
        let (peer, _handle) = mailboxes.new_peer();
        let (pub_addr, _pub_mailbox) = mailboxes.open::<StampedMsg>(peer, 8);
        let publisher_id = PublisherId::new();
        let ns = Arc::new(StubNs { publisher_addrs: vec![pub_addr.clone()], publisher_ids: vec![publisher_id] });
        let feed = Feed::new(ns, mailboxes, "id".to_string(), ChangefeedConfig::default()).await.expect("feed");
        (feed, pub_addr, publisher_id)
    }

    #[tokio::test]
    async fn point_sub_receives_matching_change() {
        let (feed, _pub_addr, publisher_id) = feed_with_one_publisher().await;
        let sub = feed.attach_point(json!("k"));

        let record = ChangeRecord {
            old_val: Some(json!({"id": "k", "v": 1})),
            new_val: Some(json!({"id": "k", "v": 2})),
            ..Default::default()
        };
        feed.handle_envelope(StampedMsg { publisher_id, stamp: 0, msg: ChangeMsg::Change(record) });

        let batch = sub
            .get_els(10, Duration::from_millis(50), &super::super::subscription::Interruptor::new())
            .await
            .expect("batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["new_val"]["v"], json!(2));
    }

    #[tokio::test]
    async fn unrelated_point_key_is_ignored() {
        let (feed, _pub_addr, publisher_id) = feed_with_one_publisher().await;
        let sub = feed.attach_point(json!("other"));

        let record = ChangeRecord {
            old_val: Some(json!({"id": "k", "v": 1})),
            new_val: Some(json!({"id": "k", "v": 2})),
            ..Default::default()
        };
        feed.handle_envelope(StampedMsg { publisher_id, stamp: 0, msg: ChangeMsg::Change(record) });

        let batch = sub
            .get_els(10, Duration::from_millis(10), &super::super::subscription::Interruptor::new())
            .await
            .expect("empty batch");
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn stop_message_detaches_feed_and_latches_error() {
        let (feed, _pub_addr, publisher_id) = feed_with_one_publisher().await;
        let predicate = RangePredicate { sindex: None, left: json!(0), right: None };
        let sub = feed.attach_range(predicate);

        feed.handle_envelope(StampedMsg { publisher_id, stamp: 0, msg: ChangeMsg::Stop });
        assert!(feed.is_detached());

        let err = sub
            .get_els(10, Duration::from_millis(10), &super::super::subscription::Interruptor::new())
            .await
            .expect_err("latched error");
        assert!(matches!(err, Error::Disconnected));
    }

    #[tokio::test]
    async fn attach_and_detach_limit_updates_sub_count() {
        let (feed, _pub_addr, _publisher_id) = feed_with_one_publisher().await;
        let sub = feed.attach_limit(SubscriptionId::new(), LimitOrder::new(Sorting::Descending), 3);
        assert_eq!(feed.num_subs(), 1);
        feed.detach_limit(&sub).await;
        assert_eq!(feed.num_subs(), 0);
    }

    /// Each publisher keeps its own monotonic stamp sequence; the feed only
    /// guarantees per-publisher order, so an out-of-order envelope from publisher B
    /// must not block or reorder publisher A's already-delivered stream.
    #[tokio::test]
    async fn two_publishers_interleave_independently() {
        let mailboxes = MailboxManager::new();
        let (peer_a, _handle_a) = mailboxes.new_peer();
        let (pub_addr_a, _mailbox_a) = mailboxes.open::<StampedMsg>(peer_a, 8);
        let (peer_b, _handle_b) = mailboxes.new_peer();
        let (pub_addr_b, _mailbox_b) = mailboxes.open::<StampedMsg>(peer_b, 8);
        let publisher_a = PublisherId::new();
        let publisher_b = PublisherId::new();
        let ns = Arc::new(StubNs {
            publisher_addrs: vec![pub_addr_a, pub_addr_b],
            publisher_ids: vec![publisher_a, publisher_b],
        });
        let feed = Feed::new(ns, mailboxes, "id".to_string(), ChangefeedConfig::default()).await.expect("feed");
        let sub = feed.attach_range(RangePredicate { sindex: None, left: json!(null), right: None });
        sub.start(feed.ns().as_ref(), feed.addr()).await.expect("start");

        let record = |v: i64| ChangeRecord { old_val: None, new_val: Some(json!({"id": format!("k{v}"), "v": v})), ..Default::default() };
        // publisher_b's stamp 1 arrives before its stamp 0: held back until the
        // prefix fills in. publisher_a's independent stream is unaffected.
        feed.handle_envelope(StampedMsg { publisher_id: publisher_b, stamp: 1, msg: ChangeMsg::Change(record(20)) });
        feed.handle_envelope(StampedMsg { publisher_id: publisher_a, stamp: 0, msg: ChangeMsg::Change(record(1)) });

        let batch = sub
            .get_els(10, Duration::from_millis(50), &super::super::subscription::Interruptor::new())
            .await
            .expect("batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["new_val"]["v"], json!(1));

        feed.handle_envelope(StampedMsg { publisher_id: publisher_b, stamp: 0, msg: ChangeMsg::Change(record(10)) });
        let batch = sub
            .get_els(10, Duration::from_millis(50), &super::super::subscription::Interruptor::new())
            .await
            .expect("batch");
        let vs: Vec<_> = batch.iter().map(|e| e["new_val"]["v"].clone()).collect();
        assert_eq!(vs, vec![json!(10), json!(20)]);
    }
}
