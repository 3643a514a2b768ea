//! Broker setup: registries, subscriptions and connecting.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use warren_core::{Codec, CodecRegistry, TypeBindingRegistry};

use crate::attempts::{AttemptStore, InMemoryAttemptStore};
use crate::classify::MessageClassifier;
use crate::config::BrokerConfig;
use crate::connection::Connection;
use crate::consumer::Consumer;
use crate::error::SetupError;
use crate::outbound::OutboundChannel;
use crate::promise::{ConsumingPromise, GuaranteeMode, RetryPolicy, SubscriptionBuilder};
use crate::report::{FailureReporter, TracingReporter};
use crate::transport::Transport;

/// Collects type bindings, codecs and subscriptions, then connects them to a
/// transport.
///
/// Registries can only change before [`connect`](Self::connect); the
/// connection shares them read-only with every consumer.
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    bindings: TypeBindingRegistry,
    codecs: CodecRegistry,
    promises: Vec<ConsumingPromise>,
    reporter: Arc<dyn FailureReporter>,
    attempts: Arc<dyn AttemptStore>,
}

impl Broker {
    /// A broker with the JSON codec, failures logged through `tracing` and
    /// attempt counters kept in memory.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        let attempts = Arc::new(InMemoryAttemptStore::with_capacity(config.attempt_store_capacity));
        Self {
            config,
            bindings: TypeBindingRegistry::new(),
            codecs: CodecRegistry::with_defaults(),
            promises: Vec::new(),
            reporter: Arc::new(TracingReporter),
            attempts,
        }
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn FailureReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub fn with_attempt_store(mut self, attempts: Arc<dyn AttemptStore>) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Binds the wire type tag `tag` to `T`.
    ///
    /// # Errors
    ///
    /// Fails on an empty tag or a tag that is already bound.
    pub fn register_type_binding<T>(&mut self, tag: &str) -> Result<&mut Self, SetupError>
    where
        T: DeserializeOwned + Serialize + Send + Sync + 'static,
    {
        self.bindings.register::<T>(tag)?;
        Ok(self)
    }

    /// Handles `content_type` with `codec`.
    ///
    /// # Errors
    ///
    /// Fails on an empty or already registered content type.
    pub fn register_codec(
        &mut self,
        content_type: &str,
        codec: Arc<dyn Codec>,
    ) -> Result<&mut Self, SetupError> {
        self.codecs.register(content_type, codec)?;
        Ok(self)
    }

    /// Subscribes to `queue`, acknowledging each delivery on receipt.
    ///
    /// # Errors
    ///
    /// Fails on an empty queue name, a queue already subscribed to, or a
    /// subscription without handlers.
    pub fn subscribe_at_most_once<F>(&mut self, queue: &str, configure: F) -> Result<&mut Self, SetupError>
    where
        F: FnOnce(&mut SubscriptionBuilder),
    {
        self.subscribe(queue, GuaranteeMode::AtMostOnce, configure)
    }

    /// Subscribes to `queue`, acknowledging each delivery once its handlers
    /// succeed and requeueing failures up to `retry.max_attempts()` attempts.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe_at_most_once`](Self::subscribe_at_most_once).
    pub fn subscribe_at_least_once<F>(
        &mut self,
        queue: &str,
        retry: RetryPolicy,
        configure: F,
    ) -> Result<&mut Self, SetupError>
    where
        F: FnOnce(&mut SubscriptionBuilder),
    {
        self.subscribe(queue, GuaranteeMode::AtLeastOnce(retry), configure)
    }

    fn subscribe<F>(&mut self, queue: &str, mode: GuaranteeMode, configure: F) -> Result<&mut Self, SetupError>
    where
        F: FnOnce(&mut SubscriptionBuilder),
    {
        if self.promises.iter().any(|p| p.queue() == queue) {
            return Err(SetupError::DuplicateSubscription {
                queue: queue.to_string(),
            });
        }
        self.promises.push(ConsumingPromise::new(queue, mode, configure)?);
        Ok(self)
    }

    /// A classifier over the current registries.
    #[must_use]
    pub fn classifier(&self) -> MessageClassifier {
        MessageClassifier::new(
            Arc::new(self.bindings.clone()),
            Arc::new(self.codecs.clone()),
        )
    }

    /// Opens the outbound channel and one inbound channel per subscription,
    /// then starts a consumer loop for each.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::Transport`] if a channel cannot be opened.
    /// Anything already started is shut down first.
    pub async fn connect(self, transport: &dyn Transport) -> Result<Connection, SetupError> {
        let Self {
            config,
            bindings,
            codecs,
            promises,
            reporter,
            attempts,
        } = self;

        let (shutdown, _) = watch::channel(false);
        let bindings = Arc::new(bindings);
        let codecs = Arc::new(codecs);
        let classifier = MessageClassifier::new(Arc::clone(&bindings), Arc::clone(&codecs));

        let publisher = transport.open_outbound().await?;
        let outbound = OutboundChannel::start(publisher, bindings, codecs, &config);

        let mut consumers: Vec<Arc<Consumer>> = Vec::with_capacity(promises.len());
        let mut loops: Vec<JoinHandle<()>> = Vec::with_capacity(promises.len());
        for promise in &promises {
            let inbound = match transport
                .open_inbound(promise.queue(), config.prefetch_count)
                .await
            {
                Ok(inbound) => inbound,
                Err(error) => {
                    tracing::error!(queue = promise.queue(), error = %error, "failed to open inbound channel");
                    shutdown.send_replace(true);
                    for handle in loops {
                        let _ = handle.await;
                    }
                    outbound.stop().await;
                    return Err(error.into());
                }
            };

            let consumer = Arc::new(promise.build_consumer(
                classifier.clone(),
                inbound.channel,
                Arc::clone(&reporter),
                Arc::clone(&attempts),
                outbound.clone(),
            ));
            loops.push(tokio::spawn(Arc::clone(&consumer).run(
                inbound.deliveries,
                shutdown.subscribe(),
                config.concurrency(),
            )));
            consumers.push(consumer);
        }

        tracing::info!(consumers = consumers.len(), "broker connected");

        Ok(Connection::new(config, shutdown, consumers, loops, outbound))
    }
}
