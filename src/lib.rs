//! Distributed changefeed engine.
//!
//! A publish/subscribe subsystem that lets clients subscribe to live changes on a
//! table. Subscribers receive a sequence of `{old_val, new_val}` records describing
//! every mutation relevant to their query predicate.
//!
//! Three subscription flavors are supported: a single primary-key point, a range over
//! the primary or a secondary index, and a sorted top-N "limit" window kept
//! materialized as rows are inserted, deleted, and re-ranked.
//!
//! Module layout, leaves first: [`wire`] and [`mangle`] define the on-wire envelope
//! and key encoding; [`ordering`] merges per-publisher envelopes into stamp order;
//! [`publisher`] assigns stamps and fans changes out to subscribers; [`subscriber`]
//! multiplexes publisher streams back into individual subscriptions.

pub mod config;
pub mod datum;
pub mod error;
pub mod mailbox;
pub mod mangle;
pub mod ordering;
pub mod region;
pub mod wire;

pub mod external;
pub mod publisher;
pub mod subscriber;

#[cfg(any(test, feature = "test-support"))]
pub mod testutil;

pub use datum::Datum;
pub use error::{Error, Result};
pub use publisher::{LimitManager, Server};
pub use subscriber::{Client, Feed, Subscription};
pub use wire::{ChangeMsg, PublisherId, Stamp, StampedMsg, SubscriptionId};
