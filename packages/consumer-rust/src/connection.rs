//! A connected broker: running consumers plus the outbound channel.

use std::fmt;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::BrokerConfig;
use crate::consumer::Consumer;
use crate::outbound::OutboundChannel;

/// Handle to a connected broker. Dropping it signals the consumer loops to
/// stop without waiting for them; call [`close`](Self::close) to drain.
pub struct Connection {
    config: BrokerConfig,
    shutdown: watch::Sender<bool>,
    consumers: Vec<Arc<Consumer>>,
    loops: Vec<JoinHandle<()>>,
    outbound: OutboundChannel,
}

impl Connection {
    pub(crate) fn new(
        config: BrokerConfig,
        shutdown: watch::Sender<bool>,
        consumers: Vec<Arc<Consumer>>,
        loops: Vec<JoinHandle<()>>,
        outbound: OutboundChannel,
    ) -> Self {
        Self {
            config,
            shutdown,
            consumers,
            loops,
            outbound,
        }
    }

    #[must_use]
    pub fn consumers(&self) -> &[Arc<Consumer>] {
        &self.consumers
    }

    /// The consumer subscribed to `queue`.
    #[must_use]
    pub fn consumer(&self, queue: &str) -> Option<&Arc<Consumer>> {
        self.consumers.iter().find(|c| c.queue() == queue)
    }

    #[must_use]
    pub fn outbound(&self) -> &OutboundChannel {
        &self.outbound
    }

    /// Deliveries received but not yet settled, across all consumers.
    #[must_use]
    pub fn unsettled(&self) -> usize {
        self.consumers
            .iter()
            .map(|c| c.channel().outstanding_count())
            .sum()
    }

    /// Stops taking deliveries, waits up to the configured drain timeout for
    /// the consumer loops to finish the ones they started, then stops the
    /// outbound channel.
    ///
    /// Returns `false` if the drain timed out; the loops still running at
    /// that point are aborted and their unsettled deliveries go back to the
    /// broker when the channel closes.
    pub async fn close(mut self) -> bool {
        tracing::info!(consumers = self.consumers.len(), "closing connection");
        self.shutdown.send_replace(true);

        let drain = join_all(self.loops.iter_mut());
        let joined = tokio::time::timeout(self.config.drain_timeout(), drain).await;
        let drained = match joined {
            Ok(joined) => {
                for error in joined.into_iter().filter_map(Result::err) {
                    tracing::error!(error = %error, "consumer loop panicked");
                }
                true
            }
            Err(_) => {
                tracing::warn!(
                    unsettled = self.unsettled(),
                    "drain timeout expired, aborting consumers"
                );
                for handle in &self.loops {
                    handle.abort();
                }
                false
            }
        };

        self.outbound.stop().await;
        tracing::info!(drained, "connection closed");
        drained
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("consumers", &self.consumers.len())
            .field("unsettled", &self.unsettled())
            .field("closed", &*self.shutdown.borrow())
            .finish_non_exhaustive()
    }
}
