//! Subscriber side: one [`Feed`] multiplexes every publisher's stream for a table
//! into the subscriptions registered through a process-wide [`Client`].

mod client;
mod feed;
mod subscription;

pub use client::Client;
pub use feed::Feed;
pub use subscription::{
    core_get_els, Interruptor, LimitSubscription, PointSubscription, RangePredicate, RangeSubscription,
    Subscription, SubscriptionCore,
};
