//! Warren Consumer: message classification, handler dispatch, delivery
//! guarantees and broker replies.
//!
//! A [`Broker`] collects type bindings, codecs and subscriptions. Connecting
//! it to a [`Transport`] starts one [`Consumer`] per subscription; each
//! delivery is classified, dispatched to every matching handler, folded into
//! an [`AggregateConsumingResult`] and answered with exactly one broker reply.

pub mod attempts;
pub mod broker;
pub mod classify;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod memory;
pub mod message;
pub mod outbound;
pub mod promise;
pub mod reply;
pub mod report;
pub mod result;
pub mod transport;
pub mod worker;

pub use attempts::{AttemptKey, AttemptState, AttemptStore, InMemoryAttemptStore};
pub use broker::Broker;
pub use classify::MessageClassifier;
pub use config::BrokerConfig;
pub use connection::Connection;
pub use consumer::{Consumer, DeliveryOutcome};
pub use error::{PublishError, ReplyError, SetupError, TransportError};
pub use handler::{handler_fn, FnHandler, Handler, HandlerSet, Message};
pub use memory::MemoryTransport;
pub use message::ConsumedMessage;
pub use outbound::{OutboundChannel, PublishResult};
pub use promise::{ConsumingPromise, GuaranteeMode, RetryPolicy, SubscriptionBuilder};
pub use reply::{InboundChannel, ReplyEngine};
pub use report::{FailureRecord, FailureReporter, RecordingReporter, TracingReporter};
pub use result::{AggregateConsumingResult, ConsumingError, ReplyAction};
pub use transport::{Channel, InboundStream, OutboundEnvelope, Publisher, Transport};
