//! Subscriber-facing subscriptions: point, range, and limit.
//!
//! Each variant holds its own filter/state and a delivery core shared through
//! [`SubscriptionCore`]; `get_els` is the common blocking batch-pull contract.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;

use crate::datum::{self, Datum};
use crate::error::{Error, Result};
use crate::external::{LimitSpec, NamespaceInterface};
use crate::mailbox::Addr;
use crate::mangle::{LimitOrder, SortKey};
use crate::wire::{
    ChangeRecord, Item, KeyedItem, MangledKey, PublisherId, Stamp, StampedMsg, SubscriptionId,
};

/// Cooperative cancellation signal passed to `get_els`.
#[derive(Clone, Default)]
pub struct Interruptor {
    notify: Arc<Notify>,
}

impl Interruptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

struct CoreState {
    buffer: VecDeque<Datum>,
    error: Option<Error>,
    skipped: u64,
}

/// Shared delivery buffer + latched-error + skip-counter machinery common to every
/// subscription variant.
pub struct SubscriptionCore {
    state: Mutex<CoreState>,
    notify: Notify,
    array_size_limit: usize,
    /// Point subscriptions coalesce: a new value replaces rather than queues behind
    /// the previous one, since only the latest value is ever meaningful.
    coalesce: bool,
}

impl SubscriptionCore {
    pub fn new(array_size_limit: usize, coalesce: bool) -> Self {
        SubscriptionCore {
            state: Mutex::new(CoreState { buffer: VecDeque::new(), error: None, skipped: 0 }),
            notify: Notify::new(),
            array_size_limit,
            coalesce,
        }
    }

    pub fn push(&self, datum: Datum) {
        let mut s = self.state.lock();
        if self.coalesce {
            s.buffer.clear();
            s.buffer.push_back(datum);
        } else if s.buffer.len() >= self.array_size_limit {
            s.skipped += s.buffer.len() as u64 + 1;
            s.buffer.clear();
        } else {
            s.buffer.push_back(datum);
        }
        drop(s);
        self.notify.notify_waiters();
    }

    pub fn latch_error(&self, err: Error) {
        let mut s = self.state.lock();
        if s.error.is_none() {
            s.error = Some(err);
        }
        drop(s);
        self.notify.notify_waiters();
    }

    pub fn has_error(&self) -> bool {
        self.state.lock().error.is_some()
    }
}

/// Pulls the next non-empty batch out of `core`, or blocks until data, timeout, or
/// interruption. The common contract every [`Subscription`] exposes.
pub async fn core_get_els(
    core: &SubscriptionCore,
    max_batch: usize,
    timeout: Duration,
    interruptor: &Interruptor,
) -> Result<Vec<Datum>> {
    loop {
        {
            let mut s = core.state.lock();
            if let Some(err) = &s.error {
                return Err(err.clone());
            }
            if s.skipped > 0 {
                let n = s.skipped;
                s.skipped = 0;
                return Ok(vec![json!({
                    "error": format!("Changefeed cache over array size limit, skipped {n} elements.")
                })]);
            }
            if !s.buffer.is_empty() {
                let mut out = Vec::new();
                while out.len() < max_batch.max(1) {
                    match s.buffer.pop_front() {
                        Some(d) => out.push(d),
                        None => break,
                    }
                }
                return Ok(out);
            }
        }
        tokio::select! {
            _ = core.notify.notified() => continue,
            _ = interruptor.wait() => return Err(Error::Interrupted),
            _ = tokio::time::sleep(timeout) => return Ok(Vec::new()),
        }
    }
}

/// Common contract every subscription variant exposes to the query runtime.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn core(&self) -> &SubscriptionCore;

    async fn get_els(&self, max_batch: usize, timeout: Duration, interruptor: &Interruptor) -> Result<Vec<Datum>> {
        core_get_els(self.core(), max_batch, timeout, interruptor).await
    }
}

// ---------------------------------------------------------------------------------
// Point subscription
// ---------------------------------------------------------------------------------

struct PointState {
    stamp: Stamp,
    value: Option<Datum>,
}

/// Subscribes to a single primary key. `add_el` is called by the owning [`Feed`]
/// whenever a dispatched change's extracted primary key equals `key`.
///
/// [`Feed`]: crate::subscriber::Feed
pub struct PointSubscription {
    core: SubscriptionCore,
    key: Datum,
    state: Mutex<PointState>,
}

impl PointSubscription {
    pub fn new(key: Datum, array_size_limit: usize) -> Self {
        PointSubscription {
            core: SubscriptionCore::new(array_size_limit, true),
            key,
            state: Mutex::new(PointState { stamp: 0, value: None }),
        }
    }

    pub fn key(&self) -> &Datum {
        &self.key
    }

    /// Reads the start stamp and initial value. Races against `add_el` calls that
    /// may already be arriving because this subscription is attached to the feed's
    /// registry before `start` resolves: only overrides the value if no value has
    /// landed yet, or if the freshly-read stamp is strictly newer than whatever
    /// already arrived (the "first legal stamp" rule, stricter than the ongoing
    /// `>=` rule `add_el` uses for every later update).
    pub async fn start(&self, ns: &dyn NamespaceInterface, reply_to: Addr<StampedMsg>) -> Result<()> {
        let resp = ns.point_stamp_read(reply_to, &self.key).await?;
        let mut s = self.state.lock();
        if s.value.is_none() || resp.start_stamp > s.stamp {
            s.stamp = resp.start_stamp;
            s.value = resp.initial_val;
        }
        Ok(())
    }

    pub fn add_el(&self, stamp: Stamp, new_val: Option<Datum>) {
        let mut s = self.state.lock();
        if stamp >= s.stamp {
            let old = s.value.clone();
            s.stamp = stamp;
            s.value = new_val.clone();
            drop(s);
            self.core.push(json!({ "old_val": old, "new_val": new_val }));
        }
    }
}

#[async_trait]
impl Subscription for PointSubscription {
    fn core(&self) -> &SubscriptionCore {
        &self.core
    }
}

// ---------------------------------------------------------------------------------
// Range subscription
// ---------------------------------------------------------------------------------

/// Inclusive-left, exclusive-right predicate over a primary or secondary-index
/// value, evaluated with [`datum::cmp`].
pub struct RangePredicate {
    pub sindex: Option<String>,
    pub left: Datum,
    pub right: Option<Datum>,
}

impl RangePredicate {
    pub fn contains(&self, value: &Datum) -> bool {
        datum::cmp(value, &self.left) != std::cmp::Ordering::Less
            && self
                .right
                .as_ref()
                .map(|r| datum::cmp(value, r) == std::cmp::Ordering::Less)
                .unwrap_or(true)
    }
}

struct RangeState {
    start_stamps: HashMap<PublisherId, Stamp>,
}

/// Subscribes to every row in the table (or a secondary index) matching `predicate`.
pub struct RangeSubscription {
    core: SubscriptionCore,
    pub predicate: RangePredicate,
    state: Mutex<RangeState>,
}

impl RangeSubscription {
    pub fn new(predicate: RangePredicate, array_size_limit: usize) -> Self {
        RangeSubscription {
            core: SubscriptionCore::new(array_size_limit, false),
            predicate,
            state: Mutex::new(RangeState { start_stamps: HashMap::new() }),
        }
    }

    pub async fn start(&self, ns: &dyn NamespaceInterface, reply_to: Addr<StampedMsg>) -> Result<()> {
        let stamps = ns.stamp_read(reply_to).await?;
        self.state.lock().start_stamps = stamps;
        Ok(())
    }

    /// Enqueues `datum` iff this publisher's start stamp has been observed and
    /// `stamp` is at or after it. A not-yet-started feed (empty `start_stamps`) or
    /// an unknown publisher silently drops the event.
    pub fn add_el(&self, publisher_id: PublisherId, stamp: Stamp, datum: Datum) {
        let s = self.state.lock();
        let admit = s.start_stamps.get(&publisher_id).map(|start| stamp >= *start).unwrap_or(false);
        drop(s);
        if admit {
            self.core.push(datum);
        }
    }

    /// Dispatches one `change` message against this subscription: synthesizes
    /// `{old_val, new_val}` pairs, including the secondary-index multiset
    /// reconciliation for sindex-backed ranges. `pkey` is the row's primary-key
    /// value (the same one `Feed` uses for point-sub lookup), needed here because a
    /// non-sindex range is evaluated against the primary key's value, not the whole
    /// row.
    pub fn dispatch_change(&self, publisher_id: PublisherId, stamp: Stamp, pkey: Option<&Datum>, record: &ChangeRecord) {
        match &self.predicate.sindex {
            None => {
                let matches = pkey.map(|k| self.predicate.contains(k)).unwrap_or(false);
                let old_match = matches && record.old_val.is_some();
                let new_match = matches && record.new_val.is_some();
                if old_match || new_match {
                    self.add_el(
                        publisher_id,
                        stamp,
                        json!({
                            "old_val": if old_match { record.old_val.clone() } else { None },
                            "new_val": if new_match { record.new_val.clone() } else { None },
                        }),
                    );
                }
            }
            Some(sindex) => {
                let old_matches = record
                    .old_indexes
                    .get(sindex)
                    .map(|vs| vs.iter().filter(|d| self.predicate.contains(d)).count())
                    .unwrap_or(0);
                let new_matches = record
                    .new_indexes
                    .get(sindex)
                    .map(|vs| vs.iter().filter(|d| self.predicate.contains(d)).count())
                    .unwrap_or(0);
                let shared = old_matches.min(new_matches);
                for _ in 0..shared {
                    self.add_el(
                        publisher_id,
                        stamp,
                        json!({ "old_val": record.old_val.clone(), "new_val": record.new_val.clone() }),
                    );
                }
                for _ in shared..old_matches {
                    self.add_el(publisher_id, stamp, json!({ "old_val": record.old_val.clone(), "new_val": null }));
                }
                for _ in shared..new_matches {
                    self.add_el(publisher_id, stamp, json!({ "old_val": null, "new_val": record.new_val.clone() }));
                }
            }
        }
    }
}

#[async_trait]
impl Subscription for RangeSubscription {
    fn core(&self) -> &SubscriptionCore {
        &self.core
    }
}

// ---------------------------------------------------------------------------------
// Limit subscription
// ---------------------------------------------------------------------------------

struct WindowEntry {
    sort_key: SortKey,
    mangled: MangledKey,
    item: Item,
}

struct LimitState {
    need_init: usize,
    got_init: usize,
    queued: Vec<(Option<MangledKey>, Option<KeyedItem>)>,
    window: Vec<WindowEntry>,
}

fn active_start(len: usize, limit: usize) -> usize {
    len.saturating_sub(limit)
}

fn binary_insert(window: &mut Vec<WindowEntry>, order: &LimitOrder, mangled: MangledKey, item: Item) -> usize {
    let sort_key = (item.0.clone(), mangled.clone());
    let pos = window
        .binary_search_by(|e| order.cmp_sort_keys(&e.sort_key, &sort_key))
        .unwrap_or_else(|p| p);
    window.insert(pos, WindowEntry { sort_key, mangled, item });
    pos
}

/// Subscriber-side mirror of every shard's top-N window for one limit subscription.
/// Maintains the union of all shards' contributions sorted by the subscription's
/// comparator; the tail `spec.limit` elements are "active" (delivered), the rest are
/// retained as promotion candidates for when an active element is removed.
pub struct LimitSubscription {
    core: SubscriptionCore,
    sub_id: SubscriptionId,
    spec_limit: usize,
    order: LimitOrder,
    state: Mutex<LimitState>,
    /// Mailboxes to notify on teardown (sent a stop request by the owning `Feed`),
    /// populated once `start` resolves.
    teardown_addrs: Mutex<Vec<Addr<crate::external::LimitStopRequest>>>,
}

impl LimitSubscription {
    pub fn new(sub_id: SubscriptionId, order: LimitOrder, limit: usize, array_size_limit: usize) -> Self {
        LimitSubscription {
            core: SubscriptionCore::new(array_size_limit, false),
            sub_id,
            spec_limit: limit,
            order,
            state: Mutex::new(LimitState { need_init: usize::MAX, got_init: 0, queued: Vec::new(), window: Vec::new() }),
            teardown_addrs: Mutex::new(Vec::new()),
        }
    }

    pub fn sub_id(&self) -> SubscriptionId {
        self.sub_id
    }

    pub async fn start(
        &self,
        ns: &dyn NamespaceInterface,
        reply_to: Addr<StampedMsg>,
        spec: LimitSpec,
        config: crate::config::ChangefeedConfig,
    ) -> Result<()> {
        let resp = ns.limit_subscribe_read(reply_to, self.sub_id, spec, config).await?;
        self.state.lock().need_init = resp.shard_count;
        *self.teardown_addrs.lock() = resp.limit_addrs;
        Ok(())
    }

    /// Mailboxes to notify when tearing this subscription down (one per shard).
    pub fn teardown_addrs(&self) -> Vec<Addr<crate::external::LimitStopRequest>> {
        self.teardown_addrs.lock().clone()
    }

    /// Applies one shard's `limit_start` contribution. Once every shard has reported
    /// in, emits the initial dump (`old_val == new_val` for every active element)
    /// and replays anything queued while initializing.
    pub fn on_limit_start(&self, start_data: Vec<KeyedItem>) {
        let mut s = self.state.lock();
        for (mangled, item) in start_data {
            binary_insert(&mut s.window, &self.order, mangled, item);
        }
        s.got_init += 1;
        if s.got_init < s.need_init {
            return;
        }
        let active_from = active_start(s.window.len(), self.spec_limit);
        let dump: Vec<Item> = s.window[active_from..].iter().map(|e| e.item.clone()).collect();
        let queued = std::mem::take(&mut s.queued);
        drop(s);
        for (_, row) in dump {
            self.core.push(json!({ "old_val": row, "new_val": row }));
        }
        for (old_key, new_val) in queued {
            self.apply(old_key, new_val);
        }
    }

    /// Applies one `limit_change`, queuing it verbatim if initialization hasn't
    /// completed across every shard yet.
    pub fn on_limit_change(&self, old_key: Option<MangledKey>, new_val: Option<KeyedItem>) {
        let still_initializing = {
            let mut s = self.state.lock();
            if s.got_init < s.need_init {
                s.queued.push((old_key.clone(), new_val.clone()));
                true
            } else {
                false
            }
        };
        if !still_initializing {
            self.apply(old_key, new_val);
        }
    }

    pub fn on_limit_stop(&self, error: String) {
        self.core.latch_error(Error::LimitAborted(self.sub_id, error));
    }

    fn apply(&self, old_key: Option<MangledKey>, new_val: Option<KeyedItem>) {
        let mut s = self.state.lock();
        let limit = self.spec_limit;
        let mut old_send: Option<Item> = None;
        let mut new_send: Option<Item> = None;

        match (old_key, new_val) {
            (Some(old_key), Some((mangled, item))) if old_key == mangled => {
                let old_start = active_start(s.window.len(), limit);
                if let Some(pos) = s.window.iter().position(|e| e.mangled == old_key) {
                    let was_active = pos >= old_start;
                    let removed = s.window.remove(pos);
                    if was_active {
                        old_send = Some(removed.item);
                    }
                }
                let pos = binary_insert(&mut s.window, &self.order, mangled, item.clone());
                let new_start = active_start(s.window.len(), limit);
                if pos >= new_start {
                    new_send = Some(item);
                }
            }
            (Some(old_key), new_val) => {
                let old_start = active_start(s.window.len(), limit);
                if let Some(pos) = s.window.iter().position(|e| e.mangled == old_key) {
                    let was_active = pos >= old_start;
                    let removed = s.window.remove(pos);
                    if was_active {
                        old_send = Some(removed.item);
                        if old_start > 0 {
                            if let Some(promoted) = s.window.get(old_start - 1) {
                                new_send = Some(promoted.item.clone());
                            }
                        }
                    }
                }
                if let Some((mangled, item)) = new_val {
                    let pre_insert_len = s.window.len();
                    let pos = binary_insert(&mut s.window, &self.order, mangled, item.clone());
                    let new_start = active_start(s.window.len(), limit);
                    if pos >= new_start {
                        new_send = Some(item);
                        if old_send.is_none() && pre_insert_len >= limit {
                            old_send = s.window.get(new_start - 1).map(|e| e.item.clone());
                        }
                    }
                }
            }
            (None, Some((mangled, item))) => {
                let pre_insert_len = s.window.len();
                let pos = binary_insert(&mut s.window, &self.order, mangled, item.clone());
                let new_start = active_start(s.window.len(), limit);
                if pos >= new_start {
                    new_send = Some(item);
                    if pre_insert_len >= limit {
                        old_send = s.window.get(new_start - 1).map(|e| e.item.clone());
                    }
                }
            }
            (None, None) => {}
        }
        drop(s);

        if old_send.is_some() || new_send.is_some() {
            self.core.push(json!({
                "old_val": old_send.map(|(_, row)| row),
                "new_val": new_send.map(|(_, row)| row),
            }));
        }
    }
}

#[async_trait]
impl Subscription for LimitSubscription {
    fn core(&self) -> &SubscriptionCore {
        &self.core
    }
}
