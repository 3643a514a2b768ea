//! Subscriptions declared on a broker before it connects.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::attempts::AttemptStore;
use crate::classify::MessageClassifier;
use crate::consumer::Consumer;
use crate::dispatch::build_pipeline;
use crate::error::SetupError;
use crate::handler::{Handler, HandlerSet};
use crate::outbound::OutboundChannel;
use crate::reply::{InboundChannel, ReplyEngine};
use crate::report::FailureReporter;
use crate::transport::Channel;

/// Upper bound on delivery attempts for an at-least-once subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: NonZeroU32,
}

impl RetryPolicy {
    /// A message that failed `max_attempts` times is dropped and reported
    /// instead of being requeued again.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::InvalidRetryBound`] when `max_attempts` is zero.
    pub fn new(max_attempts: u32) -> Result<Self, SetupError> {
        NonZeroU32::new(max_attempts)
            .map(|max_attempts| Self { max_attempts })
            .ok_or(SetupError::InvalidRetryBound(max_attempts))
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.get()
    }

    /// Whether `failures` failed attempts use up the bound.
    #[must_use]
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts.get()
    }
}

/// Delivery guarantee of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuaranteeMode {
    /// Acknowledged on receipt, before handlers run. A failure is reported
    /// and the message is gone.
    AtMostOnce,
    /// Acknowledged after handlers succeed; failures are requeued until the
    /// retry bound is reached.
    AtLeastOnce(RetryPolicy),
}

impl GuaranteeMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AtMostOnce => "at_most_once",
            Self::AtLeastOnce(_) => "at_least_once",
        }
    }
}

/// Collects the handlers of one subscription.
#[derive(Debug, Default)]
pub struct SubscriptionBuilder {
    handlers: HandlerSet,
}

impl SubscriptionBuilder {
    /// Adds a handler for messages decoded as `T`. Several handlers may be
    /// added for the same type; each of them sees every such message.
    pub fn consume<T, H>(&mut self, handler: H) -> &mut Self
    where
        T: Send + Sync + 'static,
        H: Handler<T>,
    {
        self.handlers.add::<T, H>(handler);
        self
    }
}

/// A declared subscription: queue, guarantee mode and handlers.
pub struct ConsumingPromise {
    queue: Arc<str>,
    mode: GuaranteeMode,
    handlers: Arc<HandlerSet>,
}

impl ConsumingPromise {
    pub(crate) fn new<F>(queue: &str, mode: GuaranteeMode, configure: F) -> Result<Self, SetupError>
    where
        F: FnOnce(&mut SubscriptionBuilder),
    {
        if queue.is_empty() {
            return Err(SetupError::EmptyQueue);
        }
        let mut builder = SubscriptionBuilder::default();
        configure(&mut builder);
        if builder.handlers.is_empty() {
            return Err(SetupError::NoHandlers {
                queue: queue.to_string(),
            });
        }
        Ok(Self {
            queue: Arc::from(queue),
            mode,
            handlers: Arc::new(builder.handlers),
        })
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[must_use]
    pub fn mode(&self) -> GuaranteeMode {
        self.mode
    }

    #[must_use]
    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    /// Builds the consumer serving this subscription on `channel`. Copies of
    /// messages without an id are republished through `outbound`.
    #[must_use]
    pub fn build_consumer(
        &self,
        classifier: MessageClassifier,
        channel: Arc<dyn Channel>,
        reporter: Arc<dyn FailureReporter>,
        attempts: Arc<dyn AttemptStore>,
        outbound: OutboundChannel,
    ) -> Consumer {
        Consumer {
            queue: Arc::clone(&self.queue),
            mode: self.mode,
            classifier,
            pipeline: build_pipeline(Arc::clone(&self.handlers)),
            channel: InboundChannel::new(channel),
            replies: ReplyEngine::new(Arc::clone(&self.queue), reporter),
            attempts,
            outbound,
        }
    }
}

impl fmt::Debug for ConsumingPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumingPromise")
            .field("queue", &self.queue)
            .field("mode", &self.mode)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
