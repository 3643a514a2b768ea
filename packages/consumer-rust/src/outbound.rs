//! Outbound publishing, serialized through one background worker.

use std::any::{self, Any};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;
use warren_core::{CodecRegistry, Encoding, Properties, TypeBindingRegistry};

use crate::config::BrokerConfig;
use crate::error::{PublishError, TransportError};
use crate::transport::{OutboundEnvelope, Publisher};
use crate::worker::{BackgroundRunnable, BackgroundWorker};

/// Result of a publish request.
#[derive(Debug)]
pub enum PublishResult {
    Success { message_id: String, timestamp: i64 },
    Failure(PublishError),
}

impl PublishResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

// ---------------------------------------------------------------------------
// PublishRunnable
// ---------------------------------------------------------------------------

/// A queued publish and the slot its outcome goes to.
struct PublishTask {
    envelope: OutboundEnvelope,
    reply: oneshot::Sender<Result<(), TransportError>>,
}

/// Hands envelopes to the transport publisher one at a time.
struct PublishRunnable {
    publisher: Arc<dyn Publisher>,
    published: u64,
    failed: u64,
}

#[async_trait]
impl BackgroundRunnable for PublishRunnable {
    type Task = PublishTask;

    async fn run(&mut self, task: PublishTask) {
        let result = self.publisher.publish(task.envelope).await;
        match &result {
            Ok(()) => self.published += 1,
            Err(error) => {
                self.failed += 1;
                tracing::warn!(error = %error, "publish failed");
            }
        }
        // The publisher may have stopped waiting.
        let _ = task.reply.send(result);
    }

    async fn on_tick(&mut self) {
        tracing::debug!(published = self.published, failed = self.failed, "outbound channel stats");
    }

    async fn shutdown(&mut self) {
        tracing::info!(published = self.published, failed = self.failed, "outbound channel stopped");
    }
}

// ---------------------------------------------------------------------------
// OutboundChannel
// ---------------------------------------------------------------------------

/// The single outbound channel of a connection.
///
/// Values are encoded on the caller's task; the broker calls themselves run
/// in order on one worker task. Clones share that worker.
#[derive(Clone)]
pub struct OutboundChannel {
    bindings: Arc<TypeBindingRegistry>,
    codecs: Arc<CodecRegistry>,
    content_type: String,
    worker: Arc<BackgroundWorker<PublishRunnable>>,
}

impl OutboundChannel {
    #[must_use]
    pub fn start(
        publisher: Arc<dyn Publisher>,
        bindings: Arc<TypeBindingRegistry>,
        codecs: Arc<CodecRegistry>,
        config: &BrokerConfig,
    ) -> Self {
        let runnable = PublishRunnable {
            publisher,
            published: 0,
            failed: 0,
        };
        Self {
            bindings,
            codecs,
            content_type: config.publish_content_type.clone(),
            worker: Arc::new(BackgroundWorker::start(
                runnable,
                config.outbound_channel_capacity,
                config.outbound_tick_interval(),
            )),
        }
    }

    /// Publishes `value` tagged with its bound type tag.
    ///
    /// The body is encoded with the configured content type. Text codecs
    /// write UTF-8 without a byte-order mark and label it in
    /// `content_encoding`; binary codecs leave the label unset. Each message
    /// gets a fresh UUID message id and the current Unix time as timestamp.
    pub async fn publish<T>(&self, value: &T, exchange: &str, routing_key: &str) -> PublishResult
    where
        T: Serialize + Any,
    {
        match self.try_publish(value, exchange, routing_key).await {
            Ok((message_id, timestamp)) => PublishResult::Success {
                message_id,
                timestamp,
            },
            Err(error) => {
                tracing::warn!(exchange, routing_key, error = %error, "publish rejected");
                PublishResult::Failure(error)
            }
        }
    }

    async fn try_publish<T>(
        &self,
        value: &T,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(String, i64), PublishError>
    where
        T: Serialize + Any,
    {
        let type_name = any::type_name::<T>();
        let tag = self
            .bindings
            .tag_of::<T>()
            .ok_or(PublishError::Unbound { type_name })?;
        let codec = self
            .codecs
            .resolve(&self.content_type)
            .ok_or_else(|| PublishError::NoCodec {
                content_type: self.content_type.clone(),
            })?;

        let document = serde_json::to_value(value).map_err(|e| PublishError::Serialize {
            type_name,
            detail: e.to_string(),
        })?;
        let encoding = Encoding::utf8();
        let body = codec.encode(&document, encoding)?;
        let content_encoding = codec.is_text().then(|| encoding.label().to_string());

        let message_id = Uuid::new_v4().to_string();
        let timestamp = unix_now();
        let envelope = OutboundEnvelope {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: Properties {
                message_type: Some(tag.to_string()),
                content_type: Some(self.content_type.clone()),
                content_encoding,
                message_id: Some(message_id.clone()),
                timestamp: Some(timestamp),
                headers: BTreeMap::new(),
            },
            body: Bytes::from(body),
        };

        self.send(envelope).await?;
        Ok((message_id, timestamp))
    }

    /// Publishes a prepared envelope unchanged, in order with every other
    /// publish on this channel.
    ///
    /// # Errors
    ///
    /// `PublishError::Closed` once the channel stopped, or the transport
    /// error of the broker call.
    pub async fn send(&self, envelope: OutboundEnvelope) -> Result<(), PublishError> {
        let (reply, outcome) = oneshot::channel();
        self.worker
            .submit(PublishTask { envelope, reply })
            .await
            .map_err(|_| PublishError::Closed)?;
        outcome.await.map_err(|_| PublishError::Closed)??;
        Ok(())
    }

    /// Stops accepting publishes and waits for queued ones to go out.
    pub async fn stop(&self) {
        self.worker.stop().await;
    }
}

impl fmt::Debug for OutboundChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundChannel")
            .field("content_type", &self.content_type)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}
