//! In-memory reference [`NamespaceInterface`], for tests and single-process
//! embedding.
//!
//! A single in-memory table with no real sharding, wired to one [`Server`] so the
//! publisher/limit-manager machinery runs end-to-end against ordinary `HashMap`
//! storage instead of a B-tree.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::ChangefeedConfig;
use crate::datum::{self, Datum};
use crate::error::{Error, Result};
use crate::external::{
    LimitSpec, LimitSubscribeResponse, NamespaceInterface, PointStampReadResponse, RefillQuery, SubscribeResponse,
};
use crate::mailbox::{Addr, MailboxManager, PeerHandle};
use crate::mangle::{self, LimitOrder, SortKey};
use crate::publisher::Server;
use crate::region::Region;
use crate::wire::{ChangeMsg, ChangeRecord, KeyedItem, PublisherId, Stamp, StampedMsg, SubscriptionId};

fn canon(key: &Datum) -> String {
    serde_json::to_string(key).unwrap_or_default()
}

/// Single-shard, single-table in-memory namespace backing the integration tests.
/// Declare any secondary indexes up front with [`MockNamespace::declare_sindex`];
/// writes go through [`MockNamespace::insert`]/[`MockNamespace::delete`].
pub struct MockNamespace {
    pkey_field: String,
    server: Arc<Server>,
    publisher_addr: Addr<StampedMsg>,
    publisher_peer_handle: PeerHandle,
    rows: RwLock<HashMap<String, Datum>>,
    sindexes: RwLock<Vec<String>>,
}

impl MockNamespace {
    pub fn new(pkey_field: impl Into<String>, mailboxes: MailboxManager) -> Arc<Self> {
        let server = Server::new(mailboxes.clone());
        let (shard_peer, publisher_peer_handle) = mailboxes.new_peer();
        // Only this address's peer identity matters (disconnect watching); nothing
        // is ever sent through it, so the paired receiver is dropped immediately.
        let (publisher_addr, _unused) = mailboxes.open::<StampedMsg>(shard_peer, 1);
        Arc::new(MockNamespace {
            pkey_field: pkey_field.into(),
            server,
            publisher_addr,
            publisher_peer_handle,
            rows: RwLock::new(HashMap::new()),
            sindexes: RwLock::new(Vec::new()),
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Simulates this namespace's publisher shard going away, so every feed
    /// subscribed through it observes a disconnect.
    pub fn disconnect_publisher(&self) {
        self.publisher_peer_handle.disconnect();
    }

    pub fn declare_sindex(&self, name: impl Into<String>) {
        self.sindexes.write().push(name.into());
    }

    pub async fn insert(&self, row: Datum) -> Result<()> {
        let pkey = datum::get_field(&row, &self.pkey_field)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("row missing primary key field {:?}", self.pkey_field)))?;
        self.write(pkey, Some(row)).await
    }

    pub async fn delete(&self, pkey: Datum) -> Result<()> {
        self.write(pkey, None).await
    }

    fn sorted_rows(&self, sindex: &Option<String>, order: &LimitOrder) -> Vec<(SortKey, KeyedItem)> {
        let mut items: Vec<(SortKey, KeyedItem)> = self
            .rows
            .read()
            .iter()
            .map(|(canon_key, row)| {
                let sindex_value = match sindex {
                    Some(name) => datum::get_field(row, name).cloned().unwrap_or(Datum::Null),
                    None => Datum::Null,
                };
                let mangled = mangle::mangle(canon_key.as_bytes(), mangle::IsPrimary::Yes, None);
                let sort_key = (sindex_value.clone(), mangled.clone());
                (sort_key, (mangled, (sindex_value, row.clone())))
            })
            .collect();
        items.sort_by(|a, b| order.cmp_sort_keys(&a.0, &b.0));
        items
    }

    async fn write(&self, pkey: Datum, new_row: Option<Datum>) -> Result<()> {
        let canon_key = canon(&pkey);
        let raw = canon_key.clone().into_bytes();

        let old_row = {
            let mut rows = self.rows.write();
            let old = rows.get(&canon_key).cloned();
            match &new_row {
                Some(row) => {
                    rows.insert(canon_key.clone(), row.clone());
                }
                None => {
                    rows.remove(&canon_key);
                }
            }
            old
        };

        let sindexes = self.sindexes.read().clone();
        let mut old_indexes = HashMap::new();
        let mut new_indexes = HashMap::new();
        for name in &sindexes {
            if let Some(v) = old_row.as_ref().and_then(|r| datum::get_field(r, name)) {
                old_indexes.insert(name.clone(), vec![v.clone()]);
            }
            if let Some(v) = new_row.as_ref().and_then(|r| datum::get_field(r, name)) {
                new_indexes.insert(name.clone(), vec![v.clone()]);
            }
        }
        let record = ChangeRecord { old_indexes, new_indexes, old_val: old_row.clone(), new_val: new_row.clone() };
        self.server.send_all(&raw, ChangeMsg::Change(record));

        let mangled = mangle::mangle(&raw, mangle::IsPrimary::Yes, None);
        let mut sindex_keys: Vec<Option<String>> = vec![None];
        sindex_keys.extend(sindexes.into_iter().map(Some));

        let had_old = old_row.is_some();
        for sindex in sindex_keys {
            let mangled = mangled.clone();
            let new_row_for_closure = new_row.clone();
            self.server
                .foreach_limit(sindex.as_deref(), Some(raw.as_slice()), move |manager| {
                    let mangled = mangled.clone();
                    let new_row_for_closure = new_row_for_closure.clone();
                    async move {
                        if had_old {
                            manager.del(mangled.clone());
                        }
                        if let Some(row) = new_row_for_closure {
                            let sindex_value = match manager.sindex() {
                                Some(name) => datum::get_field(&row, name).cloned().unwrap_or(Datum::Null),
                                None => Datum::Null,
                            };
                            manager.add(mangled, sindex_value, row);
                        }
                        Ok(())
                    }
                })
                .await;
            self.server.commit_limit_managers(sindex.as_deref(), self).await;
        }
        Ok(())
    }
}

#[async_trait]
impl NamespaceInterface for MockNamespace {
    async fn subscribe_read(&self, reply_to: Addr<StampedMsg>) -> Result<SubscribeResponse> {
        self.server.add_client(reply_to, Region::universe());
        Ok(SubscribeResponse {
            publisher_addrs: vec![self.publisher_addr.clone()],
            publisher_ids: vec![self.server.publisher_id()],
        })
    }

    async fn stamp_read(&self, reply_to: Addr<StampedMsg>) -> Result<HashMap<PublisherId, Stamp>> {
        let mut map = HashMap::new();
        map.insert(self.server.publisher_id(), self.server.get_stamp(&reply_to));
        Ok(map)
    }

    async fn point_stamp_read(&self, reply_to: Addr<StampedMsg>, key: &Datum) -> Result<PointStampReadResponse> {
        let initial_val = self.rows.read().get(&canon(key)).cloned();
        Ok(PointStampReadResponse { start_stamp: self.server.get_stamp(&reply_to), initial_val })
    }

    async fn limit_subscribe_read(
        &self,
        reply_to: Addr<StampedMsg>,
        sub_id: SubscriptionId,
        spec: LimitSpec,
        _config: ChangefeedConfig,
    ) -> Result<LimitSubscribeResponse> {
        let order = LimitOrder::new(spec.sorting);
        let mut items = self.sorted_rows(&spec.sindex, &order);
        if items.len() > spec.limit {
            items.drain(0..items.len() - spec.limit);
        }
        let initial_items: Vec<KeyedItem> = items.into_iter().map(|(_, keyed)| keyed).collect();
        self.server
            .add_limit_client(reply_to, Region::universe(), sub_id, spec.sindex.clone(), spec.sorting, spec.limit, initial_items)
            .await?;
        Ok(LimitSubscribeResponse { shard_count: 1, limit_addrs: vec![self.server.limit_stop_addr()] })
    }

    async fn range_read(&self, query: RefillQuery) -> Result<Vec<KeyedItem>> {
        let order = LimitOrder::new(query.sorting);
        let mut items = self.sorted_rows(&query.sindex, &order);
        if let Some(start) = &query.start {
            items.retain(|(sort_key, _)| order.cmp_sort_keys(sort_key, start) == std::cmp::Ordering::Less);
        }
        if items.len() > query.limit {
            items.drain(0..items.len() - query.limit);
        }
        Ok(items.into_iter().map(|(_, keyed)| keyed).collect())
    }
}

/// Several independent [`MockNamespace`] shards behind one [`NamespaceInterface`],
/// each with its own `Server` and publisher identity. Unlike [`MockNamespace`],
/// `limit_subscribe_read` here reports `shard_count > 1`, so a `LimitSubscription`
/// actually exercises its multi-shard `need_init`/`got_init` initialization path and
/// must merge each shard's independently-maintained top-N window into one shadow
/// window client-side.
///
/// Rows are not partitioned automatically; tests route writes to a specific shard
/// via [`MultiShardMockNamespace::shard`] so a scenario's shard layout is explicit.
pub struct MultiShardMockNamespace {
    shards: Vec<Arc<MockNamespace>>,
}

impl MultiShardMockNamespace {
    pub fn new(pkey_field: impl Into<String>, mailboxes: MailboxManager, shard_count: usize) -> Arc<Self> {
        let pkey_field = pkey_field.into();
        let shards = (0..shard_count)
            .map(|_| MockNamespace::new(pkey_field.clone(), mailboxes.clone()))
            .collect();
        Arc::new(MultiShardMockNamespace { shards })
    }

    pub fn shard(&self, idx: usize) -> &Arc<MockNamespace> {
        &self.shards[idx]
    }

    pub fn declare_sindex(&self, name: impl Into<String>) {
        let name = name.into();
        for shard in &self.shards {
            shard.declare_sindex(name.clone());
        }
    }
}

#[async_trait]
impl NamespaceInterface for MultiShardMockNamespace {
    async fn subscribe_read(&self, reply_to: Addr<StampedMsg>) -> Result<SubscribeResponse> {
        let mut publisher_addrs = Vec::new();
        let mut publisher_ids = Vec::new();
        for shard in &self.shards {
            let resp = shard.subscribe_read(reply_to.clone()).await?;
            publisher_addrs.extend(resp.publisher_addrs);
            publisher_ids.extend(resp.publisher_ids);
        }
        Ok(SubscribeResponse { publisher_addrs, publisher_ids })
    }

    async fn stamp_read(&self, reply_to: Addr<StampedMsg>) -> Result<HashMap<PublisherId, Stamp>> {
        let mut map = HashMap::new();
        for shard in &self.shards {
            map.extend(shard.stamp_read(reply_to.clone()).await?);
        }
        Ok(map)
    }

    async fn point_stamp_read(&self, reply_to: Addr<StampedMsg>, key: &Datum) -> Result<PointStampReadResponse> {
        for shard in &self.shards {
            if shard.rows.read().contains_key(&canon(key)) {
                return shard.point_stamp_read(reply_to, key).await;
            }
        }
        self.shards[0].point_stamp_read(reply_to, key).await
    }

    /// Asks every shard to create its own `LimitManager` and report its own initial
    /// top-N window; `shard_count` is the real number of shards, so the subscriber
    /// waits for all of them before emitting the combined initial dump.
    async fn limit_subscribe_read(
        &self,
        reply_to: Addr<StampedMsg>,
        sub_id: SubscriptionId,
        spec: LimitSpec,
        config: ChangefeedConfig,
    ) -> Result<LimitSubscribeResponse> {
        let mut limit_addrs = Vec::new();
        for shard in &self.shards {
            let resp = shard.limit_subscribe_read(reply_to.clone(), sub_id, spec.clone(), config.clone()).await?;
            limit_addrs.extend(resp.limit_addrs);
        }
        Ok(LimitSubscribeResponse { shard_count: self.shards.len(), limit_addrs })
    }

    async fn range_read(&self, query: RefillQuery) -> Result<Vec<KeyedItem>> {
        let order = LimitOrder::new(query.sorting);
        let mut items: Vec<(SortKey, KeyedItem)> = Vec::new();
        for shard in &self.shards {
            items.extend(shard.sorted_rows(&query.sindex, &order));
        }
        items.sort_by(|a, b| order.cmp_sort_keys(&a.0, &b.0));
        if let Some(start) = &query.start {
            items.retain(|(sort_key, _)| order.cmp_sort_keys(sort_key, start) == std::cmp::Ordering::Less);
        }
        if items.len() > query.limit {
            items.drain(0..items.len() - query.limit);
        }
        Ok(items.into_iter().map(|(_, keyed)| keyed).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn insert_then_point_stamp_read_sees_current_row() {
        let mailboxes = MailboxManager::new();
        let ns = MockNamespace::new("id", mailboxes.clone());
        ns.insert(json!({"id": "k", "v": 1})).await.expect("insert");

        let (peer, _handle) = mailboxes.new_peer();
        let (addr, _mailbox) = mailboxes.open::<StampedMsg>(peer, 8);
        ns.server.add_client(addr.clone(), Region::universe());
        let resp = ns.point_stamp_read(addr, &json!("k")).await.expect("read");
        assert_eq!(resp.initial_val, Some(json!({"id": "k", "v": 1})));
    }

    #[tokio::test]
    async fn limit_subscribe_returns_top_n_by_sindex() {
        let mailboxes = MailboxManager::new();
        let ns = MockNamespace::new("id", mailboxes.clone());
        ns.declare_sindex("score");
        for (id, score) in [("a", 5), ("b", 4), ("c", 3), ("d", 2)] {
            ns.insert(json!({"id": id, "score": score})).await.expect("insert");
        }

        let (peer, _handle) = mailboxes.new_peer();
        let (addr, _mailbox) = mailboxes.open::<StampedMsg>(peer, 8);
        let resp = ns
            .limit_subscribe_read(
                addr,
                SubscriptionId::new(),
                LimitSpec { sindex: Some("score".to_string()), sorting: crate::mangle::Sorting::Descending, limit: 2 },
                ChangefeedConfig::default(),
            )
            .await
            .expect("limit_subscribe_read");
        assert_eq!(resp.shard_count, 1);
    }
}
