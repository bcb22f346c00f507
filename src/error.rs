//! Crate-wide error type.
//!
//! One flat enum, hand-rolled `Display`/`std::error::Error` impls. No subscription ever
//! sees a raw downstream error type; everything is normalized to a variant here before
//! it's latched on a subscription or sent over the wire as a `limit_stop`/`stop`.

use std::fmt;

use crate::wire::SubscriptionId;

#[derive(Debug, Clone)]
pub enum Error {
    /// The query runtime or peer cancelled the in-flight operation.
    Interrupted,
    /// The publisher's peer is gone, or the table it served is unavailable.
    Disconnected,
    /// A limit subscription's manager hit a storage error during refill and aborted.
    LimitAborted(SubscriptionId, String),
    /// A subscription create-time argument is invalid (e.g. limit exceeds
    /// `array_size_limit`).
    InvalidArgument(String),
    /// The read interface (storage / admin table layer) returned an error.
    ReadFailed(String),
    /// A mailbox send failed because the receiving end is gone.
    MailboxClosed,
    /// A mangled key could not be decoded.
    BadMangledKey(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Interrupted => write!(f, "interrupted"),
            Error::Disconnected => write!(f, "Disconnected from peer."),
            Error::LimitAborted(sub_id, msg) => {
                write!(f, "limit subscription {sub_id} aborted: {msg}")
            }
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::ReadFailed(msg) => write!(f, "read failed: {msg}"),
            Error::MailboxClosed => write!(f, "mailbox closed"),
            Error::BadMangledKey(msg) => write!(f, "bad mangled key: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
