//! Broker replies: acknowledgment bookkeeping and failure reporting.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use warren_core::{ChannelId, Delivery, DeliveryTag};

use crate::error::ReplyError;
use crate::report::{FailureRecord, FailureReporter};
use crate::result::{AggregateConsumingResult, ConsumingError, ReplyAction};
use crate::transport::Channel;

pub const REPLIES_TOTAL: &str = "warren_replies_total";

// ---------------------------------------------------------------------------
// InboundChannel
// ---------------------------------------------------------------------------

/// A transport channel plus the set of deliveries it handed out that have
/// not been settled yet.
///
/// Each delivery is settled at most once, and only on the channel that
/// delivered it. Delivery tags grow strictly per channel and deliveries are
/// tracked in arrival order, so a tag at or below the highest one seen that
/// is no longer outstanding was settled.
pub struct InboundChannel {
    channel: Arc<dyn Channel>,
    outstanding: Mutex<Outstanding>,
}

#[derive(Debug, Default)]
struct Outstanding {
    tags: HashSet<DeliveryTag>,
    highest: Option<DeliveryTag>,
}

impl InboundChannel {
    #[must_use]
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            outstanding: Mutex::new(Outstanding::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Starts tracking a delivery received on this channel.
    ///
    /// # Errors
    ///
    /// `ChannelMismatch` if the delivery came from another channel,
    /// `DuplicateDelivery` if its tag is already outstanding,
    /// `AlreadySettled` if it was settled before.
    pub fn track(&self, delivery: &Delivery) -> Result<(), ReplyError> {
        self.check_channel(delivery)?;
        let tag = delivery.delivery_tag();
        let mut outstanding = self.outstanding.lock();
        if outstanding.tags.contains(&tag) {
            return Err(ReplyError::DuplicateDelivery {
                channel: self.id(),
                tag,
            });
        }
        if outstanding.highest.is_some_and(|highest| tag <= highest) {
            return Err(ReplyError::AlreadySettled {
                channel: self.id(),
                tag,
            });
        }
        outstanding.tags.insert(tag);
        outstanding.highest = Some(tag);
        Ok(())
    }

    /// Number of tracked deliveries not yet settled.
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().tags.len()
    }

    fn check_channel(&self, delivery: &Delivery) -> Result<(), ReplyError> {
        if delivery.channel() != self.id() {
            return Err(ReplyError::ChannelMismatch {
                expected: delivery.channel(),
                actual: self.id(),
                tag: delivery.delivery_tag(),
            });
        }
        Ok(())
    }

    /// Removes the tag so no second reply can be issued for it.
    fn claim(&self, delivery: &Delivery) -> Result<DeliveryTag, ReplyError> {
        self.check_channel(delivery)?;
        let tag = delivery.delivery_tag();
        if !self.outstanding.lock().tags.remove(&tag) {
            return Err(ReplyError::AlreadySettled {
                channel: self.id(),
                tag,
            });
        }
        Ok(tag)
    }
}

impl fmt::Debug for InboundChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundChannel")
            .field("id", &self.id())
            .field("outstanding", &self.outstanding_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ReplyEngine
// ---------------------------------------------------------------------------

/// Turns consuming results into broker replies for one subscription.
#[derive(Debug, Clone)]
pub struct ReplyEngine {
    queue: Arc<str>,
    reporter: Arc<dyn FailureReporter>,
}

impl ReplyEngine {
    #[must_use]
    pub fn new(queue: Arc<str>, reporter: Arc<dyn FailureReporter>) -> Self {
        Self { queue, reporter }
    }

    /// Issues `action` for `delivery` on `channel`.
    ///
    /// # Errors
    ///
    /// `ChannelMismatch` when `channel` did not deliver the message,
    /// `AlreadySettled` on a second reply, `Transport` when the broker call
    /// fails.
    pub async fn settle(
        &self,
        action: ReplyAction,
        delivery: &Delivery,
        channel: &InboundChannel,
    ) -> Result<(), ReplyError> {
        let tag = match channel.claim(delivery) {
            Ok(tag) => tag,
            Err(error) => {
                tracing::error!(queue = %self.queue, error = %error, "reply contract violated");
                return Err(error);
            }
        };

        match action {
            ReplyAction::Ack | ReplyAction::Republish => channel.channel.ack(tag).await?,
            ReplyAction::Requeue => channel.channel.reject(tag, true).await?,
        }

        metrics::counter!(
            REPLIES_TOTAL,
            "queue" => self.queue.to_string(),
            "action" => action.as_str()
        )
        .increment(1);
        tracing::debug!(
            queue = %self.queue,
            delivery_tag = tag.0,
            action = action.as_str(),
            "delivery settled"
        );
        Ok(())
    }

    /// Replies according to `result` and reports terminal failures.
    ///
    /// Success and terminal failures are acknowledged; retryable failures are
    /// requeued. A terminal failure is reported once the acknowledgment went
    /// through.
    ///
    /// # Errors
    ///
    /// Same as [`settle`](Self::settle).
    pub async fn reply(
        &self,
        result: &AggregateConsumingResult,
        delivery: &Delivery,
        channel: &InboundChannel,
        attempt: u32,
    ) -> Result<ReplyAction, ReplyError> {
        let action = result.action();
        self.settle(action, delivery, channel).await?;
        if let AggregateConsumingResult::ReiteratedConsumingFailure { errors } = result {
            self.report(delivery, attempt, errors.clone());
        }
        Ok(action)
    }

    /// Hands a terminal failure to the reporter.
    pub fn report(&self, delivery: &Delivery, attempt: u32, errors: Vec<ConsumingError>) {
        self.reporter
            .report(FailureRecord::new(&self.queue, delivery, attempt, errors));
    }
}
