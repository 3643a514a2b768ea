//! Broker configuration.

use std::time::Duration;

use serde::Deserialize;
use warren_core::content_types;

/// Settings shared by every subscription and the outbound channel of a
/// broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BrokerConfig {
    /// Maximum unacknowledged deliveries per subscription. Also bounds how
    /// many deliveries a consumer processes concurrently.
    pub prefetch_count: u16,
    /// Bounded queue size of the outbound publish worker.
    pub outbound_channel_capacity: usize,
    /// Content type used to encode published messages.
    pub publish_content_type: String,
    /// Interval between outbound worker statistics logs.
    pub outbound_tick_interval_ms: u64,
    /// How long `Connection::close` waits for in-flight deliveries.
    pub drain_timeout_ms: u64,
    /// Messages whose failed attempts the default in-memory attempt store
    /// remembers; the least recently used are forgotten first.
    pub attempt_store_capacity: usize,
}

impl BrokerConfig {
    #[must_use]
    pub fn outbound_tick_interval(&self) -> Duration {
        Duration::from_millis(self.outbound_tick_interval_ms)
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Prefetch count as a concurrency limit; never zero.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        usize::from(self.prefetch_count.max(1))
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            outbound_channel_capacity: 256,
            publish_content_type: content_types::JSON.to_string(),
            outbound_tick_interval_ms: 60_000,
            drain_timeout_ms: 30_000,
            attempt_store_capacity: 10_000,
        }
    }
}
