//! Subscriber-side registry of feeds, one process-wide instance.
//!
//! Holds at most one [`Feed`] per table id, find-or-create then attach outside the
//! lock. Evicts a feed only once its subscription count reaches zero, re-checking
//! under the write lock in case a new subscriber raced in.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ChangefeedConfig;
use crate::datum::Datum;
use crate::error::Result;
use crate::external::NamespaceInterface;
use crate::mailbox::MailboxManager;
use crate::mangle::LimitOrder;
use crate::wire::SubscriptionId;

use super::feed::Feed;
use super::subscription::{LimitSubscription, PointSubscription, RangePredicate, RangeSubscription};

/// Process-wide registry mapping table id to its (shared) [`Feed`].
#[derive(Default)]
pub struct Client {
    feeds: RwLock<HashMap<String, Arc<Feed>>>,
}

impl Client {
    pub fn new() -> Self {
        Client { feeds: RwLock::new(HashMap::new()) }
    }

    /// Finds or creates the `Feed` for `table_id`. The namespace interface is only
    /// consulted on creation; concurrent callers racing to create the same table's
    /// feed will have one winner and the rest observe it already inserted.
    async fn find_or_create_feed(
        &self,
        table_id: &str,
        ns: Arc<dyn NamespaceInterface>,
        mailboxes: MailboxManager,
        pkey_field: String,
        config: ChangefeedConfig,
    ) -> Result<Arc<Feed>> {
        if let Some(feed) = self.feeds.read().get(table_id) {
            if !feed.is_detached() {
                return Ok(Arc::clone(feed));
            }
        }
        let feed = Feed::new(ns, mailboxes, pkey_field, config).await?;
        let mut feeds = self.feeds.write();
        match feeds.get(table_id) {
            Some(existing) if !existing.is_detached() => Ok(Arc::clone(existing)),
            _ => {
                feeds.insert(table_id.to_string(), Arc::clone(&feed));
                Ok(feed)
            }
        }
    }

    /// Re-checks `table_id`'s entry under the write lock and removes it if it is
    /// still the same, now-empty feed. A subscriber may have attached a new
    /// subscription to it between the caller's decrement and this call.
    fn maybe_remove_feed(&self, table_id: &str, feed: &Arc<Feed>) {
        let mut feeds = self.feeds.write();
        if let Some(current) = feeds.get(table_id) {
            if Arc::ptr_eq(current, feed) && (feed.num_subs() == 0 || feed.is_detached()) {
                feeds.remove(table_id);
            }
        }
    }

    pub async fn new_point_subscription(
        &self,
        table_id: &str,
        key: Datum,
        ns: Arc<dyn NamespaceInterface>,
        mailboxes: MailboxManager,
        pkey_field: String,
        config: ChangefeedConfig,
    ) -> Result<(Arc<Feed>, Arc<PointSubscription>)> {
        let feed = self.find_or_create_feed(table_id, ns, mailboxes, pkey_field, config).await?;
        let sub = feed.attach_point(key);
        sub.start(feed.ns().as_ref(), feed.addr()).await?;
        Ok((feed, sub))
    }

    pub async fn new_range_subscription(
        &self,
        table_id: &str,
        predicate: RangePredicate,
        ns: Arc<dyn NamespaceInterface>,
        mailboxes: MailboxManager,
        pkey_field: String,
        config: ChangefeedConfig,
    ) -> Result<(Arc<Feed>, Arc<RangeSubscription>)> {
        let feed = self.find_or_create_feed(table_id, ns, mailboxes, pkey_field, config).await?;
        let sub = feed.attach_range(predicate);
        sub.start(feed.ns().as_ref(), feed.addr()).await?;
        Ok((feed, sub))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn new_limit_subscription(
        &self,
        table_id: &str,
        order: LimitOrder,
        limit: usize,
        spec: crate::external::LimitSpec,
        ns: Arc<dyn NamespaceInterface>,
        mailboxes: MailboxManager,
        pkey_field: String,
        config: ChangefeedConfig,
    ) -> Result<(Arc<Feed>, Arc<LimitSubscription>)> {
        let feed = self.find_or_create_feed(table_id, ns, mailboxes, pkey_field, config.clone()).await?;
        let sub_id = SubscriptionId::new();
        let sub = feed.attach_limit(sub_id, order, limit);
        sub.start(feed.ns().as_ref(), feed.addr(), spec, config).await?;
        Ok((feed, sub))
    }

    pub fn detach_point(&self, table_id: &str, feed: &Arc<Feed>, sub: &Arc<PointSubscription>) {
        feed.detach_point(sub);
        self.maybe_remove_feed(table_id, feed);
    }

    pub fn detach_range(&self, table_id: &str, feed: &Arc<Feed>, sub: &Arc<RangeSubscription>) {
        feed.detach_range(sub);
        self.maybe_remove_feed(table_id, feed);
    }

    pub async fn detach_limit(&self, table_id: &str, feed: &Arc<Feed>, sub: &Arc<LimitSubscription>) {
        feed.detach_limit(sub).await;
        self.maybe_remove_feed(table_id, feed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{PointStampReadResponse, SubscribeResponse};
    use crate::wire::{PublisherId, StampedMsg};
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    struct EmptyNs;

    #[async_trait::async_trait]
    impl NamespaceInterface for EmptyNs {
        async fn subscribe_read(&self, _reply_to: crate::mailbox::Addr<StampedMsg>) -> Result<SubscribeResponse> {
            Ok(SubscribeResponse { publisher_addrs: Vec::new(), publisher_ids: Vec::new() })
        }
        async fn stamp_read(&self, _reply_to: crate::mailbox::Addr<StampedMsg>) -> Result<StdHashMap<PublisherId, u64>> {
            Ok(StdHashMap::new())
        }
        async fn point_stamp_read(
            &self,
            _reply_to: crate::mailbox::Addr<StampedMsg>,
            _key: &Datum,
        ) -> Result<PointStampReadResponse> {
            Ok(PointStampReadResponse { start_stamp: 0, initial_val: None })
        }
        async fn limit_subscribe_read(
            &self,
            _reply_to: crate::mailbox::Addr<StampedMsg>,
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

    #[tokio::test]
    async fn repeated_point_subscription_on_same_table_shares_one_feed() {
        let client = Client::new();
        let mailboxes = MailboxManager::new();
        let ns: Arc<dyn NamespaceInterface> = Arc::new(EmptyNs);

        let (feed_a, sub_a) = client
            .new_point_subscription("table1", json!("a"), Arc::clone(&ns), mailboxes.clone(), "id".to_string(), ChangefeedConfig::default())
            .await
            .expect("first subscription");
        let (feed_b, sub_b) = client
            .new_point_subscription("table1", json!("b"), Arc::clone(&ns), mailboxes.clone(), "id".to_string(), ChangefeedConfig::default())
            .await
            .expect("second subscription");

        assert!(Arc::ptr_eq(&feed_a, &feed_b));
        assert_eq!(feed_a.num_subs(), 2);

        client.detach_point("table1", &feed_a, &sub_a);
        assert_eq!(feed_a.num_subs(), 1);
        client.detach_point("table1", &feed_b, &sub_b);
        assert_eq!(feed_b.num_subs(), 0);
        assert!(client.feeds.read().get("table1").is_none());
    }

    /// A registry entry left behind by a feed that has since detached (e.g. its
    /// publisher peer disconnected) must never be handed back out: the next
    /// subscriber on that table gets a freshly built, live feed instead of racing
    /// into a torn-down one.
    #[tokio::test]
    async fn subscribing_against_a_detached_registry_entry_builds_a_fresh_feed() {
        let client = Client::new();
        let mailboxes = MailboxManager::new();
        let ns: Arc<dyn NamespaceInterface> = Arc::new(EmptyNs);

        let stale = Feed::new(Arc::clone(&ns), mailboxes.clone(), "id".to_string(), ChangefeedConfig::default())
            .await
            .expect("stale feed");
        stale.detach(crate::error::Error::Disconnected);
        client.feeds.write().insert("table1".to_string(), Arc::clone(&stale));

        let (feed, sub) = client
            .new_point_subscription("table1", json!("a"), ns, mailboxes, "id".to_string(), ChangefeedConfig::default())
            .await
            .expect("subscription succeeds despite the stale entry");

        assert!(!Arc::ptr_eq(&feed, &stale));
        assert!(!feed.is_detached());
        assert_eq!(feed.num_subs(), 1);
        drop(sub);
    }
}
