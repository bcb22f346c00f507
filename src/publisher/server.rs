//! Publisher-side change server: one instance per storage shard.
//!
//! Holds the set of subscribers registered for this shard's table, assigns
//! per-subscriber stamps, and fans change messages out to them: a per-subscriber
//! region-filtered fan-out with an embedded limit-manager registry.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::error::Result;
use crate::external::{LimitStopRequest, NamespaceInterface};
use crate::mailbox::{Addr, MailboxManager};
use crate::mangle::Sorting;
use crate::region::Region;
use crate::wire::{ChangeMsg, KeyedItem, PublisherId, Stamp, StampedMsg, SubscriptionId, STAMP_NONE};

use super::limit_manager::LimitManager;

struct ClientInfo {
    regions: Vec<Region>,
    /// Shared with every `LimitManager` registered for this subscriber: limit
    /// messages and ordinary changes share one per-(publisher, subscriber) stamp
    /// sequence.
    stamp: Arc<parking_lot::Mutex<Stamp>>,
    limit_managers: HashMap<Option<String>, Vec<Arc<LimitManager>>>,
}

/// Per-storage-shard publisher. Created at shard activation, holds every registered
/// subscriber, assigns stamps, and fans out change messages.
pub struct Server {
    publisher_id: PublisherId,
    mailboxes: MailboxManager,
    clients: RwLock<HashMap<Addr<StampedMsg>, ClientInfo>>,
    stop_notify: Arc<Notify>,
    /// Mailbox a `NamespaceInterface::limit_subscribe_read` implementation hands out
    /// as one of `LimitSubscribeResponse::limit_addrs`, letting a subscriber that
    /// detaches a limit subscription without disconnecting its peer ask this shard
    /// to drop just that one manager.
    limit_stop_addr: Addr<LimitStopRequest>,
}

impl Server {
    pub fn new(mailboxes: MailboxManager) -> Arc<Self> {
        let (peer, _handle) = mailboxes.new_peer();
        let (limit_stop_addr, limit_stop_mailbox) = mailboxes.open::<LimitStopRequest>(peer, 256);
        let server = Arc::new(Server {
            publisher_id: PublisherId::new(),
            mailboxes,
            clients: RwLock::new(HashMap::new()),
            stop_notify: Arc::new(Notify::new()),
            limit_stop_addr,
        });
        {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let mut mailbox = limit_stop_mailbox;
                while let Some(req) = mailbox.recv().await {
                    server.remove_limit_client(&req.subscriber_addr, req.sindex.as_deref(), req.sub_id);
                }
            });
        }
        server
    }

    pub fn publisher_id(&self) -> PublisherId {
        self.publisher_id
    }

    /// The mailbox address to hand out as a `limit_addrs` entry so a detaching
    /// limit subscription can ask this shard to drop its manager.
    pub fn limit_stop_addr(&self) -> Addr<LimitStopRequest> {
        self.limit_stop_addr.clone()
    }

    fn remove_limit_client(&self, addr: &Addr<StampedMsg>, sindex: Option<&str>, sub_id: SubscriptionId) {
        let mut clients = self.clients.write();
        if let Some(info) = clients.get_mut(addr) {
            if let Some(managers) = info.limit_managers.get_mut(&sindex.map(str::to_string)) {
                managers.retain(|m| m.sub_id() != sub_id);
            }
        }
    }

    /// Registers `addr` as interested in `region`. Idempotent: a repeated
    /// `(addr, region)` pair appends the region rather than duplicating the
    /// subscriber's background watcher task. Necessary when a single subscriber
    /// address is registered against several regions because its shard is
    /// oversharded relative to the table.
    pub fn add_client(self: &Arc<Self>, addr: Addr<StampedMsg>, region: Region) {
        let mut clients = self.clients.write();
        if let Some(info) = clients.get_mut(&addr) {
            info.regions.push(region);
            return;
        }
        clients.insert(
            addr.clone(),
            ClientInfo {
                regions: vec![region],
                stamp: Arc::new(parking_lot::Mutex::new(0)),
                limit_managers: HashMap::new(),
            },
        );
        drop(clients);

        let server = Arc::clone(self);
        let peer = addr.peer();
        let watch_addr = addr.clone();
        let stop_notify = Arc::clone(&self.stop_notify);
        tokio::spawn(async move {
            tokio::select! {
                _ = server.mailboxes.disconnect_watcher(peer) => {
                    info!("publisher {}: subscriber {peer:?} disconnected", server.publisher_id);
                }
                _ = stop_notify.notified() => {
                    info!("publisher {}: stopping subscriber {peer:?}", server.publisher_id);
                }
            }
            let _ = watch_addr
                .send(StampedMsg { publisher_id: server.publisher_id, stamp: STAMP_NONE, msg: ChangeMsg::Stop })
                .await;
            server.remove_client(&watch_addr);
        });
    }

    fn remove_client(&self, addr: &Addr<StampedMsg>) {
        // Duplicate removal (peer disconnect racing an explicit stop, or the same
        // shard spanning multiple regions) is a no-op.
        self.clients.write().remove(addr);
    }

    /// Creates a `LimitManager` for `addr` under `spec.sindex` and emits its
    /// `limit_start` immediately.
    pub async fn add_limit_client(
        self: &Arc<Self>,
        addr: Addr<StampedMsg>,
        region: Region,
        sub_id: SubscriptionId,
        sindex: Option<String>,
        sorting: Sorting,
        limit: usize,
        initial_items: Vec<KeyedItem>,
    ) -> Result<()> {
        let stamp = {
            let mut clients = self.clients.write();
            clients
                .entry(addr.clone())
                .or_insert_with(|| ClientInfo {
                    regions: Vec::new(),
                    stamp: Arc::new(parking_lot::Mutex::new(0)),
                    limit_managers: HashMap::new(),
                })
                .stamp
                .clone()
        };
        let manager = Arc::new(LimitManager::new(
            self.publisher_id,
            sub_id,
            sindex.clone(),
            region,
            sorting,
            limit,
            addr.clone(),
            stamp,
            initial_items,
        ));
        {
            let mut clients = self.clients.write();
            if let Some(info) = clients.get_mut(&addr) {
                info.limit_managers.entry(sindex).or_default().push(Arc::clone(&manager));
            }
        }
        manager.send_limit_start(manager.initial_window()).await;
        Ok(())
    }

    /// For every registered subscriber whose region list contains `key`, assigns the
    /// next stamp and transmits `(publisher_id, stamp, msg)`. The stamp read and
    /// increment happen in a no-suspend critical section per subscriber:
    /// `send_no_suspend` never awaits.
    pub fn send_all(&self, key: &[u8], msg: ChangeMsg) {
        let clients = self.clients.read();
        for (addr, info) in clients.iter() {
            if info.regions.iter().any(|r| r.contains_key(key)) {
                let stamp = {
                    let mut s = info.stamp.lock();
                    let stamp = *s;
                    *s += 1;
                    stamp
                };
                let _ = addr.send_no_suspend(StampedMsg { publisher_id: self.publisher_id, stamp, msg: msg.clone() });
            }
        }
    }

    /// Invokes `f` on every non-aborted limit manager under `sindex` whose region
    /// contains `pkey` (when given). Managers that report an error from `f` are
    /// aborted and pruned on the next sweep.
    pub async fn foreach_limit<F, Fut>(&self, sindex: Option<&str>, pkey: Option<&[u8]>, f: F)
    where
        F: Fn(Arc<LimitManager>) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let managers: Vec<Arc<LimitManager>> = {
            let clients = self.clients.read();
            clients
                .values()
                .filter_map(|info| info.limit_managers.get(&sindex.map(str::to_string)))
                .flatten()
                .filter(|m| !m.is_aborted())
                .filter(|m| pkey.map(|k| m.region().contains_key(k)).unwrap_or(true))
                .cloned()
                .collect()
        };
        for manager in managers {
            if let Err(err) = f(Arc::clone(&manager)).await {
                manager.abort(err.to_string()).await;
            }
        }
        self.prune_aborted_limit_managers();
    }

    fn prune_aborted_limit_managers(&self) {
        let mut clients = self.clients.write();
        for info in clients.values_mut() {
            for managers in info.limit_managers.values_mut() {
                managers.retain(|m| !m.is_aborted());
            }
        }
    }

    /// Commits every non-aborted limit manager under `sindex`; used by the write
    /// pipeline after staging `add`/`del` calls via `foreach_limit`.
    pub async fn commit_limit_managers(&self, sindex: Option<&str>, ns: &dyn NamespaceInterface) {
        let managers: Vec<Arc<LimitManager>> = {
            let clients = self.clients.read();
            clients
                .values()
                .filter_map(|info| info.limit_managers.get(&sindex.map(str::to_string)))
                .flatten()
                .cloned()
                .collect()
        };
        for manager in managers {
            let _ = manager.commit(ns).await;
        }
        self.prune_aborted_limit_managers();
    }

    /// Signals every registered subscriber's stopped-condition; their background
    /// watchers send `stop` and remove themselves.
    pub fn stop_all(&self) {
        self.stop_notify.notify_waiters();
    }

    /// The next stamp that will be assigned to `addr`, or `STAMP_NONE` if it isn't
    /// registered. Used by subscribers to correlate a read-time snapshot with later
    /// change events.
    pub fn get_stamp(&self, addr: &Addr<StampedMsg>) -> Stamp {
        self.clients
            .read()
            .get(addr)
            .map(|info| *info.stamp.lock())
            .unwrap_or(STAMP_NONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn repeated_add_client_accumulates_regions_without_duplicate_watcher() {
        let mailboxes = MailboxManager::new();
        let server = Server::new(mailboxes.clone());
        let (peer, _handle) = mailboxes.new_peer();
        let (addr, _mailbox) = mailboxes.open::<StampedMsg>(peer, 8);

        server.add_client(addr.clone(), Region::range(b"a".to_vec(), Some(b"m".to_vec())));
        server.add_client(addr.clone(), Region::range(b"m".to_vec(), None));

        let clients = server.clients.read();
        let info = clients.get(&addr).expect("registered");
        assert_eq!(info.regions.len(), 2);
    }

    #[tokio::test]
    async fn send_all_only_reaches_matching_region() {
        let mailboxes = MailboxManager::new();
        let server = Server::new(mailboxes.clone());
        let (peer, _handle) = mailboxes.new_peer();
        let (addr, mut mailbox) = mailboxes.open::<StampedMsg>(peer, 8);
        server.add_client(addr, Region::range(b"a".to_vec(), Some(b"m".to_vec())));

        server.send_all(b"z", ChangeMsg::Stop);
        server.send_all(b"a", ChangeMsg::Stop);

        let msg = mailbox.recv().await.expect("one matching message");
        assert_eq!(msg.stamp, 0);
    }

    #[tokio::test]
    async fn peer_disconnect_sends_stop_and_deregisters() {
        let mailboxes = MailboxManager::new();
        let server = Server::new(mailboxes.clone());
        let (peer, handle) = mailboxes.new_peer();
        let (addr, mut mailbox) = mailboxes.open::<StampedMsg>(peer, 8);
        server.add_client(addr.clone(), Region::universe());

        handle.disconnect();
        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), mailbox.recv())
            .await
            .expect("resolved")
            .expect("stop message");
        assert!(matches!(msg.msg, ChangeMsg::Stop));

        // give the background task a chance to finish removing the entry
        tokio::task::yield_now().await;
        assert_eq!(server.get_stamp(&addr), STAMP_NONE);
    }

    #[tokio::test]
    async fn limit_client_receives_limit_start() {
        let mailboxes = MailboxManager::new();
        let server = Server::new(mailboxes.clone());
        let (peer, _handle) = mailboxes.new_peer();
        let (addr, mut mailbox) = mailboxes.open::<StampedMsg>(peer, 8);
        let sub_id = SubscriptionId::new();

        server
            .add_limit_client(
                addr,
                Region::universe(),
                sub_id,
                None,
                Sorting::Descending,
                2,
                vec![("a".to_string(), (json!(null), json!({"score": 1})))],
            )
            .await
            .expect("add_limit_client");

        let msg = mailbox.recv().await.expect("limit_start");
        match msg.msg {
            ChangeMsg::LimitStart { sub_id: got, start_data } => {
                assert_eq!(got, sub_id);
                assert_eq!(start_data.len(), 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn limit_stop_request_removes_only_the_named_manager() {
        let mailboxes = MailboxManager::new();
        let server = Server::new(mailboxes.clone());
        let (peer, _handle) = mailboxes.new_peer();
        let (addr, mut mailbox) = mailboxes.open::<StampedMsg>(peer, 8);
        let keep_id = SubscriptionId::new();
        let drop_id = SubscriptionId::new();

        server
            .add_limit_client(addr.clone(), Region::universe(), keep_id, None, Sorting::Descending, 2, Vec::new())
            .await
            .expect("add_limit_client keep");
        server
            .add_limit_client(addr.clone(), Region::universe(), drop_id, None, Sorting::Descending, 2, Vec::new())
            .await
            .expect("add_limit_client drop");
        mailbox.recv().await.expect("keep limit_start");
        mailbox.recv().await.expect("drop limit_start");

        server
            .limit_stop_addr()
            .send(LimitStopRequest { subscriber_addr: addr.clone(), sindex: None, sub_id: drop_id })
            .await
            .expect("send stop request");
        tokio::task::yield_now().await;

        let clients = server.clients.read();
        let info = clients.get(&addr).expect("still registered");
        let managers = info.limit_managers.get(&None).expect("sindex bucket present");
        assert_eq!(managers.len(), 1);
        assert_eq!(managers[0].sub_id(), keep_id);
    }
}
