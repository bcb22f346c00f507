//! Changefeed configuration.
//!
//! The handful of knobs that bound per-subscription memory and batch latency.

use serde::{Deserialize, Serialize};

/// Per-subscriber tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangefeedConfig {
    /// Maximum number of buffered, undelivered rows a single range/point
    /// subscription will hold before dropping its backlog and reporting a
    /// skipped-count error to the caller.
    /// Default: 100_000
    pub array_size_limit: usize,

    /// How long `get_els` blocks waiting for data before returning an empty batch.
    /// Default: 30s
    #[serde(with = "duration_ms")]
    pub batch_timeout: std::time::Duration,

    /// Channel capacity for the in-process mailbox substrate (see [`crate::mailbox`]).
    /// Default: 4096
    pub mailbox_channel_size: usize,
}

impl Default for ChangefeedConfig {
    fn default() -> Self {
        Self {
            array_size_limit: 100_000,
            batch_timeout: std::time::Duration::from_secs(30),
            mailbox_channel_size: 4096,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
