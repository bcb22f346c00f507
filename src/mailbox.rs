//! In-process mailbox / messaging substrate.
//!
//! The production messaging transport (peer-to-peer network codecs, TLS, cluster
//! membership) is an external collaborator: this module provides a minimal concrete
//! stand-in good enough to drive [`crate::publisher`] and [`crate::subscriber`]
//! end-to-end in a single process, built on `tokio::sync::mpsc`. A clustered
//! deployment swaps this module for the production RPC layer without touching
//! `Server`, `Feed`, or `LimitManager`.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::error::{Error, Result};

static NEXT_ADDR_ID: AtomicU64 = AtomicU64::new(0);

/// A send handle to a mailbox. Cheap to clone; equality/hash are by the mailbox's
/// identity, not its contents, so `Addr<T>` can key the subscriber registries in
/// [`crate::publisher::Server`].
pub struct Addr<T> {
    id: u64,
    peer: PeerId,
    sender: mpsc::Sender<T>,
}

impl<T> Clone for Addr<T> {
    fn clone(&self) -> Self {
        Addr {
            id: self.id,
            peer: self.peer,
            sender: self.sender.clone(),
        }
    }
}

impl<T> PartialEq for Addr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<T> Eq for Addr<T> {}
impl<T> std::hash::Hash for Addr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl<T> std::fmt::Debug for Addr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Addr({})", self.id)
    }
}

impl<T> Addr<T> {
    /// The peer (connection) this mailbox lives behind. Used to key disconnect
    /// watchers: many mailboxes (e.g. a subscriber's `stop` mailbox and its change
    /// mailbox) can share one peer.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Best-effort send; a full channel applies async backpressure (the caller
    /// awaits, it doesn't drop).
    pub async fn send(&self, msg: T) -> Result<()> {
        self.sender.send(msg).await.map_err(|_| Error::MailboxClosed)
    }

    /// Non-blocking send used from a no-suspend critical section: the stamp
    /// increment and the send that follows it must not cross an await point.
    pub fn send_no_suspend(&self, msg: T) -> Result<()> {
        self.sender.try_send(msg).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => Error::MailboxClosed,
            mpsc::error::TrySendError::Closed(_) => Error::MailboxClosed,
        })
    }
}

/// The receive half of a mailbox.
pub struct Mailbox<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T> Mailbox<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }
}

/// Identity of a peer connection. All mailboxes opened against the same peer share a
/// disconnect watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

/// Mints mailboxes and peer connections.
#[derive(Clone)]
pub struct MailboxManager {
    peers: Arc<Mutex<std::collections::HashMap<PeerId, Arc<Notify>>>>,
    next_peer: Arc<AtomicU64>,
}

impl Default for MailboxManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxManager {
    pub fn new() -> Self {
        MailboxManager {
            peers: Arc::new(Mutex::new(std::collections::HashMap::new())),
            next_peer: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Registers a new peer connection (e.g. one cluster node) and returns its id
    /// plus a handle the test harness / transport layer uses to simulate a
    /// disconnect.
    pub fn new_peer(&self) -> (PeerId, PeerHandle) {
        let id = PeerId(self.next_peer.fetch_add(1, AtomicOrdering::Relaxed));
        let notify = Arc::new(Notify::new());
        self.peers.lock().insert(id, notify.clone());
        (id, PeerHandle { id, notify, peers: self.peers.clone() })
    }

    /// Opens a bounded mailbox behind the given peer.
    pub fn open<T>(&self, peer: PeerId, channel_size: usize) -> (Addr<T>, Mailbox<T>) {
        let (sender, receiver) = mpsc::channel(channel_size.max(1));
        let id = NEXT_ADDR_ID.fetch_add(1, AtomicOrdering::Relaxed);
        (Addr { id, peer, sender }, Mailbox { receiver })
    }

    /// Resolves when `peer` disconnects. Resolves immediately if the peer is
    /// already gone or was never registered (a disconnect that raced ahead of the
    /// watcher being installed must not be missed, matching `disconnect_watcher_t`
    /// semantics).
    pub async fn disconnect_watcher(&self, peer: PeerId) {
        let notify = self.peers.lock().get(&peer).cloned();
        match notify {
            Some(notify) => notify.notified().await,
            None => {}
        }
    }
}

/// Handle used to simulate a peer going away; dropping it has no effect (unlike a
/// real network connection, there's no implicit teardown-on-drop here, so tests are
/// explicit about when a disconnect fires).
pub struct PeerHandle {
    id: PeerId,
    notify: Arc<Notify>,
    peers: Arc<Mutex<std::collections::HashMap<PeerId, Arc<Notify>>>>,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Fires every outstanding and future `disconnect_watcher` call for this peer.
    pub fn disconnect(&self) {
        self.peers.lock().remove(&self.id);
        self.notify.notify_waiters();
    }
}
