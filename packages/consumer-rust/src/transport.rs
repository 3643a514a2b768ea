//! Broker transport abstraction.
//!
//! The consumer runtime talks to the broker only through these traits. A
//! real AMQP client implements them in an adapter crate; [`MemoryTransport`]
//! implements them in-process.
//!
//! [`MemoryTransport`]: crate::memory::MemoryTransport

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use warren_core::{ChannelId, Delivery, DeliveryTag, Properties};

use crate::error::TransportError;

/// A broker channel deliveries arrive on. Acknowledgments for a delivery must
/// be issued on the channel that delivered it.
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    fn id(&self) -> ChannelId;

    /// Positive acknowledgment: the message leaves the queue.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError>;

    /// Negative acknowledgment; `requeue` puts the message back on the queue.
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError>;
}

/// A message ready to be published.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub exchange: String,
    pub routing_key: String,
    pub properties: Properties,
    pub body: Bytes,
}

/// Publishing side of a connection.
#[async_trait]
pub trait Publisher: Send + Sync + fmt::Debug {
    async fn publish(&self, envelope: OutboundEnvelope) -> Result<(), TransportError>;
}

/// An open subscription to one queue: the channel to reply on and the stream
/// of deliveries arriving on it.
#[derive(Debug)]
pub struct InboundStream {
    pub channel: Arc<dyn Channel>,
    pub deliveries: mpsc::Receiver<Delivery>,
}

/// Opens channels on a broker connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts consuming `queue` with at most `prefetch` unacknowledged
    /// deliveries in flight.
    async fn open_inbound(&self, queue: &str, prefetch: u16) -> Result<InboundStream, TransportError>;

    async fn open_outbound(&self) -> Result<Arc<dyn Publisher>, TransportError>;
}
