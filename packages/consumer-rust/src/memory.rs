//! In-process transport.
//!
//! Behaves like a broker with one exclusive consumer per queue: messages
//! published before the queue is consumed wait in a backlog, every delivery
//! gets a fresh tag on its channel, and a requeue redelivers the message with
//! the redelivered flag set. Every settlement is recorded so that tests can
//! assert on exactly what the broker was told.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use warren_core::{ChannelId, Delivery, DeliveryTag, Properties};

use crate::error::TransportError;
use crate::transport::{Channel, InboundStream, OutboundEnvelope, Publisher, Transport};

const INBOUND_CAPACITY: usize = 1024;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    Discard,
}

/// One settlement issued on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRecord {
    pub channel: ChannelId,
    pub tag: DeliveryTag,
    pub message_id: Option<String>,
    pub settlement: Settlement,
}

#[derive(Debug, Clone)]
struct Pending {
    properties: Properties,
    body: Bytes,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    backlog: VecDeque<Pending>,
    channel: Option<Arc<MemoryChannel>>,
}

#[derive(Debug, Default)]
struct Shared {
    next_channel: AtomicU64,
    queues: Mutex<HashMap<String, QueueState>>,
    replies: Mutex<Vec<ReplyRecord>>,
    published: Mutex<Vec<OutboundEnvelope>>,
}

impl Shared {
    async fn enqueue(&self, queue: &str, pending: Pending) {
        let channel = {
            let mut queues = self.queues.lock();
            let state = queues.entry(queue.to_string()).or_default();
            match &state.channel {
                Some(channel) if channel.is_open() => Arc::clone(channel),
                _ => {
                    state.backlog.push_back(pending);
                    return;
                }
            }
        };
        if let Err(pending) = channel.deliver(pending).await {
            self.push_backlog(queue, pending);
        }
    }

    fn push_backlog(&self, queue: &str, pending: Pending) {
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .backlog
            .push_back(pending);
    }
}

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

/// An in-process broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a message on `queue`, delivering it right away if the queue is
    /// being consumed.
    pub async fn enqueue(&self, queue: &str, properties: Properties, body: impl Into<Bytes>) {
        let pending = Pending {
            properties,
            body: body.into(),
            redelivered: false,
        };
        self.shared.enqueue(queue, pending).await;
    }

    /// Every settlement issued so far, in order.
    #[must_use]
    pub fn replies(&self) -> Vec<ReplyRecord> {
        self.shared.replies.lock().clone()
    }

    /// Every envelope published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<OutboundEnvelope> {
        self.shared.published.lock().clone()
    }

    /// Messages waiting for a consumer on `queue`.
    #[must_use]
    pub fn backlog_len(&self, queue: &str) -> usize {
        self.shared
            .queues
            .lock()
            .get(queue)
            .map_or(0, |state| state.backlog.len())
    }

    /// Deliveries on `queue` that were neither acked nor rejected.
    #[must_use]
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.shared
            .queues
            .lock()
            .get(queue)
            .and_then(|state| state.channel.as_ref())
            .map_or(0, |channel| channel.unacked.lock().len())
    }

    /// Stops delivering on `queue`. The consumer's delivery stream ends once
    /// it has drained what was already sent; settlements stay possible.
    pub fn close_queue(&self, queue: &str) {
        let channel = self
            .shared
            .queues
            .lock()
            .get(queue)
            .and_then(|state| state.channel.clone());
        if let Some(channel) = channel {
            channel.close();
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_inbound(&self, queue: &str, prefetch: u16) -> Result<InboundStream, TransportError> {
        let id = ChannelId(self.shared.next_channel.fetch_add(1, Ordering::SeqCst) + 1);

        let (channel, receiver, backlog) = {
            let mut queues = self.shared.queues.lock();
            let state = queues.entry(queue.to_string()).or_default();
            if state.channel.as_ref().is_some_and(|c| c.is_open()) {
                return Err(TransportError::Other(format!(
                    "queue {queue} already has a consumer"
                )));
            }
            let backlog = std::mem::take(&mut state.backlog);
            let (sender, receiver) = mpsc::channel(INBOUND_CAPACITY.max(backlog.len()));
            let channel = Arc::new(MemoryChannel {
                id,
                queue: queue.to_string(),
                next_tag: AtomicU64::new(0),
                unacked: Mutex::new(HashMap::new()),
                sender: Mutex::new(Some(sender)),
                shared: Arc::downgrade(&self.shared),
            });
            state.channel = Some(Arc::clone(&channel));
            (channel, receiver, backlog)
        };

        tracing::debug!(queue, channel = %id, prefetch, backlog = backlog.len(), "memory channel opened");

        for pending in backlog {
            if let Err(pending) = channel.deliver(pending).await {
                self.shared.push_backlog(queue, pending);
            }
        }

        Ok(InboundStream {
            channel,
            deliveries: receiver,
        })
    }

    async fn open_outbound(&self) -> Result<Arc<dyn Publisher>, TransportError> {
        Ok(Arc::new(MemoryPublisher {
            shared: Arc::clone(&self.shared),
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MemoryChannel {
    id: ChannelId,
    queue: String,
    next_tag: AtomicU64,
    unacked: Mutex<HashMap<DeliveryTag, Delivery>>,
    sender: Mutex<Option<mpsc::Sender<Delivery>>>,
    shared: Weak<Shared>,
}

impl MemoryChannel {
    fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }

    fn close(&self) {
        self.sender.lock().take();
    }

    /// Sends `pending` with a fresh tag, handing it back if the channel is
    /// closed.
    async fn deliver(&self, pending: Pending) -> Result<(), Pending> {
        let Some(sender) = self.sender.lock().clone() else {
            return Err(pending);
        };
        let tag = DeliveryTag(self.next_tag.fetch_add(1, Ordering::SeqCst) + 1);
        let delivery = Delivery::builder(self.id, tag)
            .properties(pending.properties.clone())
            .body(pending.body.clone())
            .redelivered(pending.redelivered)
            .routing_key(self.queue.clone())
            .build();

        self.unacked.lock().insert(tag, delivery.clone());
        if sender.send(delivery).await.is_err() {
            self.unacked.lock().remove(&tag);
            return Err(pending);
        }
        Ok(())
    }

    fn settle(&self, tag: DeliveryTag, settlement: Settlement) -> Result<Delivery, TransportError> {
        let delivery = self
            .unacked
            .lock()
            .remove(&tag)
            .ok_or(TransportError::UnknownDeliveryTag {
                channel: self.id,
                tag,
            })?;
        if let Some(shared) = self.shared.upgrade() {
            shared.replies.lock().push(ReplyRecord {
                channel: self.id,
                tag,
                message_id: delivery.message_id().map(str::to_owned),
                settlement,
            });
        }
        Ok(delivery)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.settle(tag, Settlement::Ack).map(|_| ())
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        if !requeue {
            return self.settle(tag, Settlement::Discard).map(|_| ());
        }
        let delivery = self.settle(tag, Settlement::Requeue)?;
        let pending = Pending {
            properties: delivery.properties().clone(),
            body: delivery.body().clone(),
            redelivered: true,
        };
        if let Err(pending) = self.deliver(pending).await {
            if let Some(shared) = self.shared.upgrade() {
                shared.push_backlog(&self.queue, pending);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryPublisher
// ---------------------------------------------------------------------------

/// Records published envelopes. Envelopes sent to the default (empty)
/// exchange are routed to the queue named by the routing key.
#[derive(Debug)]
struct MemoryPublisher {
    shared: Arc<Shared>,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, envelope: OutboundEnvelope) -> Result<(), TransportError> {
        self.shared.published.lock().push(envelope.clone());
        if envelope.exchange.is_empty() {
            let pending = Pending {
                properties: envelope.properties,
                body: envelope.body,
                redelivered: false,
            };
            self.shared.enqueue(&envelope.routing_key, pending).await;
        }
        Ok(())
    }
}
