//! Server-side sorted top-N window for one limit subscription on one shard.
//!
//! `add`/`del` stage a batch, `commit` reconciles the staging buffers against the
//! window under one held lock, refilling from storage when the window underflows and
//! pairing deletions against insertions into `limit_change` messages.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::external::{NamespaceInterface, RefillQuery};
use crate::mailbox::Addr;
use crate::mangle::{LimitOrder, SortKey, Sorting};
use crate::region::Region;
use crate::wire::{
    ChangeMsg, Item, KeyedItem, MangledKey, PublisherId, Stamp, StampedMsg, SubscriptionId,
};

struct WindowEntry {
    sort_key: SortKey,
    mangled: MangledKey,
    item: Item,
}

struct State {
    window: Vec<WindowEntry>,
    pending_added: Vec<(MangledKey, Item)>,
    pending_deleted: Vec<MangledKey>,
    aborted: bool,
}

/// Maintains a materialized top-`limit` window for one limit subscription, matching
/// it against inserts/deletes and refilling from storage when it underflows.
pub struct LimitManager {
    publisher_id: PublisherId,
    sub_id: SubscriptionId,
    sindex: Option<String>,
    region: Region,
    limit: usize,
    order: LimitOrder,
    addr: Addr<StampedMsg>,
    /// Shared with this subscriber's `ClientInfo.stamp` in `Server`: limit messages
    /// share the same per-(publisher, subscriber) stamp sequence as ordinary changes,
    /// since both travel the same `Feed` ordered queue.
    stamp: Arc<Mutex<Stamp>>,
    state: Mutex<State>,
}

impl LimitManager {
    /// `initial_items` is the window's starting content, already read by the caller
    /// (the `limit_subscribe_read` collaborator) before the manager existed. It is
    /// sorted and truncated to `limit` here, matching `limit_start`'s "send exactly
    /// once" contract: the caller emits `limit_start` using the same content this
    /// constructor settles on.
    pub fn new(
        publisher_id: PublisherId,
        sub_id: SubscriptionId,
        sindex: Option<String>,
        region: Region,
        sorting: Sorting,
        limit: usize,
        addr: Addr<StampedMsg>,
        stamp: Arc<Mutex<Stamp>>,
        initial_items: Vec<KeyedItem>,
    ) -> Self {
        let order = LimitOrder::new(sorting);
        let mut window: Vec<WindowEntry> = initial_items
            .into_iter()
            .map(|(mangled, item)| WindowEntry {
                sort_key: (item.0.clone(), mangled.clone()),
                mangled,
                item,
            })
            .collect();
        window.sort_by(|a, b| order.cmp_sort_keys(&a.sort_key, &b.sort_key));
        if window.len() > limit {
            window.drain(0..window.len() - limit);
        }
        LimitManager {
            publisher_id,
            sub_id,
            sindex,
            region,
            limit,
            order,
            addr,
            stamp,
            state: Mutex::new(State {
                window,
                pending_added: Vec::new(),
                pending_deleted: Vec::new(),
                aborted: false,
            }),
        }
    }

    pub fn sindex(&self) -> Option<&str> {
        self.sindex.as_deref()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn sub_id(&self) -> SubscriptionId {
        self.sub_id
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// The window's starting content, for callers that need to emit `limit_start`
    /// once this manager is constructed.
    pub fn initial_window(&self) -> Vec<KeyedItem> {
        self.state
            .lock()
            .window
            .iter()
            .map(|e| (e.mangled.clone(), e.item.clone()))
            .collect()
    }

    /// Stages an insert/update for the next `commit`.
    pub fn add(&self, mangled: MangledKey, sindex_value: crate::datum::Datum, row: crate::datum::Datum) {
        self.state.lock().pending_added.push((mangled, (sindex_value, row)));
    }

    /// Stages a delete for the next `commit`.
    pub fn del(&self, mangled: MangledKey) {
        self.state.lock().pending_deleted.push(mangled);
    }

    fn next_stamp(&self) -> Stamp {
        let mut s = self.stamp.lock();
        let stamp = *s;
        *s += 1;
        stamp
    }

    async fn send(&self, msg: ChangeMsg) {
        let stamp = self.next_stamp();
        let _ = self
            .addr
            .send(StampedMsg { publisher_id: self.publisher_id, stamp, msg })
            .await;
    }

    /// Sends this manager's starting window as a `limit_start`, assigning it the
    /// next stamp in this subscriber's sequence. Must be sent exactly once, right
    /// after construction.
    pub async fn send_limit_start(&self, start_data: Vec<KeyedItem>) {
        self.send(ChangeMsg::LimitStart { sub_id: self.sub_id, start_data }).await;
    }

    /// Marks the manager aborted and sends a `limit_stop`. Once aborted, `commit` is
    /// a no-op; the manager is pruned by the next `Server::foreach_limit` sweep.
    pub async fn abort(&self, err: impl Into<String>) {
        self.state.lock().aborted = true;
        self.send(ChangeMsg::LimitStop { sub_id: self.sub_id, error: err.into() }).await;
    }

    /// Reconciles the staged `pending_added`/`pending_deleted` against the window,
    /// refills from storage through `ns` if the window underflows, and emits the
    /// resulting `limit_change` messages. A no-op if already aborted.
    pub async fn commit(&self, ns: &dyn NamespaceInterface) -> Result<()> {
        if self.is_aborted() {
            return Ok(());
        }

        let (mut real_deleted, mut real_added, refill_query) = {
            let mut state = self.state.lock();
            let pending_deleted = std::mem::take(&mut state.pending_deleted);
            let pending_added = std::mem::take(&mut state.pending_added);

            let mut real_deleted = Vec::new();
            let mut real_added = Vec::new();

            // Step 1: apply deletes.
            for mangled in pending_deleted {
                if let Some(pos) = state.window.iter().position(|e| e.mangled == mangled) {
                    state.window.remove(pos);
                    real_deleted.push(mangled);
                }
            }

            // Step 2: apply inserts/updates.
            for (mangled, item) in pending_added {
                if let Some(pos) = state.window.iter().position(|e| e.mangled == mangled) {
                    state.window.remove(pos);
                }
                let sort_key = (item.0.clone(), mangled.clone());
                let pos = state
                    .window
                    .binary_search_by(|e| self.order.cmp_sort_keys(&e.sort_key, &sort_key))
                    .unwrap_or_else(|pos| pos);
                state.window.insert(pos, WindowEntry { sort_key, mangled: mangled.clone(), item: item.clone() });
                real_added.push((mangled, item));
            }

            // Step 3: truncate_top, drop the worst entries (front of the
            // ascending-by-eviction-order window) beyond `limit`.
            while state.window.len() > self.limit {
                let dropped = state.window.remove(0);
                if let Some(pos) = real_added.iter().position(|(m, _)| *m == dropped.mangled) {
                    real_added.remove(pos);
                } else {
                    real_deleted.push(dropped.mangled);
                }
            }

            let refill_query = if state.window.len() < self.limit {
                Some(RefillQuery {
                    sindex: self.sindex.clone(),
                    sorting: self.order.sorting(),
                    start: state.window.first().map(|e| e.sort_key.clone()),
                    limit: self.limit - state.window.len(),
                })
            } else {
                None
            };

            (real_deleted, real_added, refill_query)
        };

        // Step 4: refill from storage if underflowed. The read happens outside the
        // lock (it's a suspension point); the window is re-acquired to merge results.
        if let Some(query) = refill_query {
            match ns.range_read(query).await {
                Ok(rows) => {
                    let mut state = self.state.lock();
                    for (mangled, item) in rows {
                        if let Some(pos) = real_deleted.iter().position(|m| *m == mangled) {
                            real_deleted.remove(pos);
                        } else {
                            real_added.push((mangled.clone(), item.clone()));
                        }
                        let sort_key = (item.0.clone(), mangled.clone());
                        let pos = state
                            .window
                            .binary_search_by(|e| self.order.cmp_sort_keys(&e.sort_key, &sort_key))
                            .unwrap_or_else(|pos| pos);
                        state.window.insert(pos, WindowEntry { sort_key, mangled, item });
                    }
                }
                Err(err) => {
                    self.abort(err.to_string()).await;
                    return Err(err);
                }
            }
        }

        // Step 5: pair deletions against insertions into `limit_change` messages.
        let paired = real_deleted.len().min(real_added.len());
        let mut messages = Vec::with_capacity(real_deleted.len().max(real_added.len()));
        for (old_key, new_val) in real_deleted.drain(..paired).zip(real_added.drain(..paired)) {
            messages.push(ChangeMsg::LimitChange { sub_id: self.sub_id, old_key: Some(old_key), new_val: Some(new_val) });
        }
        for old_key in real_deleted {
            messages.push(ChangeMsg::LimitChange { sub_id: self.sub_id, old_key: Some(old_key), new_val: None });
        }
        for new_val in real_added {
            messages.push(ChangeMsg::LimitChange { sub_id: self.sub_id, old_key: None, new_val: Some(new_val) });
        }
        for msg in messages {
            self.send(msg).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MailboxManager;
    use serde_json::json;

    fn item(score: i64, key: &str) -> KeyedItem {
        (key.to_string(), (json!(score), json!({"score": score})))
    }

    fn manager(limit: usize, sorting: Sorting, initial: Vec<KeyedItem>) -> (LimitManager, crate::mailbox::Mailbox<StampedMsg>) {
        let mgr = MailboxManager::new();
        let (peer, _handle) = mgr.new_peer();
        let (addr, mailbox) = mgr.open::<StampedMsg>(peer, 32);
        let lm = LimitManager::new(
            PublisherId::new(),
            SubscriptionId::new(),
            None,
            Region::universe(),
            sorting,
            limit,
            addr,
            Arc::new(Mutex::new(0)),
            initial,
        );
        (lm, mailbox)
    }

    struct NoRefill;

    #[async_trait::async_trait]
    impl NamespaceInterface for NoRefill {
        async fn subscribe_read(
            &self,
            _reply_to: Addr<StampedMsg>,
        ) -> Result<crate::external::SubscribeResponse> {
            unimplemented!()
        }
        async fn stamp_read(
            &self,
            _reply_to: Addr<StampedMsg>,
        ) -> Result<std::collections::HashMap<PublisherId, Stamp>> {
            unimplemented!()
        }
        async fn point_stamp_read(
            &self,
            _reply_to: Addr<StampedMsg>,
            _key: &crate::datum::Datum,
        ) -> Result<crate::external::PointStampReadResponse> {
            unimplemented!()
        }
        async fn limit_subscribe_read(
            &self,
            _reply_to: Addr<StampedMsg>,
            _sub_id: SubscriptionId,
            _spec: crate::external::LimitSpec,
            _config: crate::config::ChangefeedConfig,
        ) -> Result<crate::external::LimitSubscribeResponse> {
            unimplemented!()
        }
        async fn range_read(&self, _query: RefillQuery) -> Result<Vec<KeyedItem>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn insert_above_capacity_evicts_worst() {
        let (lm, mut mailbox) = manager(
            3,
            Sorting::Descending,
            vec![item(5, "a"), item(4, "b"), item(3, "c")],
        );
        lm.add("d".to_string(), json!(6), json!({"score": 6}));
        lm.commit(&NoRefill).await.expect("commit");
        let msg = mailbox.recv().await.expect("message");
        match msg.msg {
            ChangeMsg::LimitChange { old_key, new_val, .. } => {
                assert_eq!(old_key.as_deref(), Some("c"));
                assert_eq!(new_val.unwrap().0, "d");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_triggers_refill() {
        let (lm, mut mailbox) = manager(
            3,
            Sorting::Descending,
            vec![item(5, "a"), item(4, "b"), item(3, "c")],
        );
        lm.del("a".to_string());
        lm.commit(&NoRefill).await.expect("commit");
        let msg = mailbox.recv().await.expect("message");
        match msg.msg {
            ChangeMsg::LimitChange { old_key, new_val, .. } => {
                assert_eq!(old_key.as_deref(), Some("a"));
                assert!(new_val.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn intra_batch_update_is_a_single_move() {
        let (lm, mut mailbox) = manager(3, Sorting::Ascending, vec![item(1, "a"), item(2, "b")]);
        lm.add("a".to_string(), json!(9), json!({"score": 9}));
        lm.commit(&NoRefill).await.expect("commit");
        let msg = mailbox.recv().await.expect("message");
        match msg.msg {
            ChangeMsg::LimitChange { old_key, new_val, .. } => {
                assert_eq!(old_key, None);
                assert_eq!(new_val.unwrap().0, "a");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
