//! Per-subscription consumer: classify, dispatch, aggregate, reply.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tower::ServiceExt;
use uuid::Uuid;
use warren_core::{Delivery, Properties};

use crate::attempts::{AttemptKey, AttemptStore};
use crate::classify::MessageClassifier;
use crate::dispatch::{Dispatch, DispatchOutcome, DispatchPipeline};
use crate::error::ReplyError;
use crate::message::ConsumedMessage;
use crate::outbound::OutboundChannel;
use crate::promise::GuaranteeMode;
use crate::reply::{InboundChannel, ReplyEngine};
use crate::result::{AggregateConsumingResult, ReplyAction};
use crate::transport::OutboundEnvelope;

pub const DELIVERIES_TOTAL: &str = "warren_deliveries_total";

/// What consuming one delivery amounted to.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    /// Classification label: `resolved`, `unresolved`, `unsupported` or
    /// `corrupted`.
    pub classification: &'static str,
    pub result: AggregateConsumingResult,
    /// Reply issued to the broker.
    pub action: ReplyAction,
    /// One-based attempt number of this delivery.
    pub attempt: u32,
}

/// Consumes the deliveries of one subscription on its own inbound channel.
#[derive(Debug)]
pub struct Consumer {
    pub(crate) queue: Arc<str>,
    pub(crate) mode: GuaranteeMode,
    pub(crate) classifier: MessageClassifier,
    pub(crate) pipeline: DispatchPipeline,
    pub(crate) channel: InboundChannel,
    pub(crate) replies: ReplyEngine,
    pub(crate) attempts: Arc<dyn AttemptStore>,
    pub(crate) outbound: OutboundChannel,
}

impl Consumer {
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[must_use]
    pub fn mode(&self) -> GuaranteeMode {
        self.mode
    }

    #[must_use]
    pub fn channel(&self) -> &InboundChannel {
        &self.channel
    }

    /// Consumes one delivery and replies to the broker.
    ///
    /// At-most-once deliveries are acknowledged before classification. For
    /// at-least-once the reply waits for every handler and follows the
    /// aggregated result. Terminal failures are reported exactly once.
    ///
    /// A retryable failure of a delivery that carries no message id is not
    /// requeued: a copy under a fresh id is published to the queue and the
    /// original is acknowledged, so its attempts are counted apart from any
    /// other id-less message.
    ///
    /// # Errors
    ///
    /// Only contract violations and transport failures while replying.
    /// Decode and handler failures are part of the returned outcome.
    pub async fn on_delivery(&self, delivery: Delivery) -> Result<DeliveryOutcome, ReplyError> {
        self.channel.track(&delivery)?;
        self.consume(delivery).await
    }

    /// Consumes a delivery already tracked on the inbound channel.
    async fn consume(&self, delivery: Delivery) -> Result<DeliveryOutcome, ReplyError> {
        let delivery = Arc::new(delivery);

        if self.mode == GuaranteeMode::AtMostOnce {
            self.replies
                .settle(ReplyAction::Ack, &delivery, &self.channel)
                .await?;
        }

        let (key, reissue) = match delivery.message_id().filter(|id| !id.is_empty()) {
            Some(id) => (AttemptKey::for_message_id(id), None),
            None => {
                let id = Uuid::new_v4().to_string();
                (AttemptKey::for_message_id(&id), Some(id))
            }
        };
        let attempt = match self.mode {
            GuaranteeMode::AtMostOnce => 1,
            GuaranteeMode::AtLeastOnce(_) => self.attempts.failures(&key).await.saturating_add(1),
        };

        let message = self.classifier.classify(Arc::clone(&delivery));
        let classification = message.kind();
        let result = match message {
            ConsumedMessage::Resolved { delivery, payload } => {
                let outcome = self
                    .pipeline
                    .clone()
                    .oneshot(Dispatch {
                        queue: Arc::clone(&self.queue),
                        delivery,
                        payload,
                        attempt,
                    })
                    .await
                    .unwrap_or_else(|never| match never {});
                self.aggregate(outcome, &key).await
            }
            terminal => {
                self.forget(&key).await;
                terminal
                    .terminal_failure()
                    .unwrap_or(AggregateConsumingResult::Success)
            }
        };

        let action = match self.mode {
            GuaranteeMode::AtMostOnce => {
                if let AggregateConsumingResult::ReiteratedConsumingFailure { errors } = &result {
                    self.replies.report(&delivery, attempt, errors.clone());
                }
                ReplyAction::Ack
            }
            GuaranteeMode::AtLeastOnce(_) => match (&result, reissue) {
                (AggregateConsumingResult::ConsumingFailure { .. }, Some(id)) => {
                    let action = self.republish(&delivery, id, &key).await;
                    self.replies.settle(action, &delivery, &self.channel).await?;
                    action
                }
                _ => {
                    self.replies
                        .reply(&result, &delivery, &self.channel, attempt)
                        .await?
                }
            },
        };

        metrics::counter!(
            DELIVERIES_TOTAL,
            "queue" => self.queue.to_string(),
            "outcome" => result.outcome()
        )
        .increment(1);
        tracing::debug!(
            queue = %self.queue,
            message_id = ?delivery.message_id(),
            classification,
            outcome = result.outcome(),
            attempt,
            "delivery consumed"
        );

        Ok(DeliveryOutcome {
            classification,
            result,
            action,
            attempt,
        })
    }

    /// Folds a dispatch outcome into the result for this attempt, updating
    /// the attempt history.
    async fn aggregate(&self, outcome: DispatchOutcome, key: &AttemptKey) -> AggregateConsumingResult {
        if outcome.is_success() {
            self.forget(key).await;
            return AggregateConsumingResult::Success;
        }
        if outcome.is_unhandled() {
            self.forget(key).await;
            return AggregateConsumingResult::ReiteratedConsumingFailure {
                errors: outcome.errors,
            };
        }

        match self.mode {
            GuaranteeMode::AtMostOnce => AggregateConsumingResult::ReiteratedConsumingFailure {
                errors: outcome.errors,
            },
            GuaranteeMode::AtLeastOnce(policy) => {
                let state = self.attempts.record_failure(key, outcome.errors.clone()).await;
                if policy.is_exhausted(state.failures) {
                    self.attempts.clear(key).await;
                    tracing::warn!(
                        queue = %self.queue,
                        attempts = state.failures,
                        key = %key,
                        "retry bound reached"
                    );
                    AggregateConsumingResult::ReiteratedConsumingFailure {
                        errors: state.errors,
                    }
                } else {
                    AggregateConsumingResult::ConsumingFailure {
                        errors: outcome.errors,
                    }
                }
            }
        }
    }

    /// Publishes a copy of `delivery` to its queue under `message_id`.
    /// Falls back to a plain requeue, with the attempt history dropped, when
    /// the copy cannot be published.
    async fn republish(&self, delivery: &Delivery, message_id: String, key: &AttemptKey) -> ReplyAction {
        let envelope = OutboundEnvelope {
            exchange: String::new(),
            routing_key: self.queue.to_string(),
            properties: Properties {
                message_id: Some(message_id),
                ..delivery.properties().clone()
            },
            body: delivery.body().clone(),
        };
        match self.outbound.send(envelope).await {
            Ok(()) => ReplyAction::Republish,
            Err(error) => {
                tracing::warn!(
                    queue = %self.queue,
                    error = %error,
                    "could not republish message without id, requeueing"
                );
                self.attempts.clear(key).await;
                ReplyAction::Requeue
            }
        }
    }

    async fn forget(&self, key: &AttemptKey) {
        if matches!(self.mode, GuaranteeMode::AtLeastOnce(_)) {
            self.attempts.clear(key).await;
        }
    }

    /// Consumes `deliveries` until the stream ends or `shutdown` turns true,
    /// with at most `concurrency` deliveries in flight. Deliveries already
    /// started are finished before this returns.
    ///
    /// Deliveries are tracked in arrival order before their task is spawned.
    pub async fn run(
        self: Arc<Self>,
        mut deliveries: mpsc::Receiver<Delivery>,
        mut shutdown: watch::Receiver<bool>,
        concurrency: usize,
    ) {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        tracing::info!(queue = %self.queue, mode = self.mode.as_str(), "consumer started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            if let Err(error) = self.channel.track(&delivery) {
                tracing::error!(queue = %self.queue, error = %error, "delivery not consumed");
                continue;
            }

            let consumer = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(error) = consumer.consume(delivery).await {
                    tracing::error!(queue = %consumer.queue, error = %error, "failed to settle delivery");
                }
            });

            while let Some(joined) = tasks.try_join_next() {
                log_join(&self.queue, joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            log_join(&self.queue, joined);
        }

        tracing::info!(queue = %self.queue, "consumer stopped");
    }
}

fn log_join(queue: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(error) = joined {
        tracing::error!(queue, error = %error, "delivery task panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use warren_core::{content_types, CodecRegistry, Properties, TypeBindingRegistry};

    use super::*;
    use crate::attempts::InMemoryAttemptStore;
    use crate::config::BrokerConfig;
    use crate::handler::{handler_fn, Handler, Message};
    use crate::memory::{MemoryTransport, Settlement};
    use crate::promise::{ConsumingPromise, RetryPolicy, SubscriptionBuilder};
    use crate::report::RecordingReporter;
    use crate::result::ConsumingError;
    use crate::transport::Transport;

    #[derive(Debug, Serialize, Deserialize)]
    struct Charge {
        cents: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Unbound;

    /// Fails every attempt, counting calls and the attempt numbers it saw.
    #[derive(Clone, Default)]
    struct AlwaysFails {
        calls: Arc<AtomicU32>,
        last_attempt: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Handler<Charge> for AlwaysFails {
        async fn handle(&self, message: Message<Charge>) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_attempt.store(message.attempt(), Ordering::SeqCst);
            anyhow::bail!("payment gateway timeout")
        }

        fn name(&self) -> &'static str {
            "always-fails"
        }
    }

    struct Harness {
        transport: MemoryTransport,
        deliveries: mpsc::Receiver<Delivery>,
        consumer: Consumer,
        reporter: Arc<RecordingReporter>,
        attempts: Arc<InMemoryAttemptStore>,
    }

    impl Harness {
        async fn publish(&self, message_type: &str, content_type: &str, body: &'static [u8]) {
            let properties = Properties {
                message_type: Some(message_type.to_string()),
                content_type: Some(content_type.to_string()),
                message_id: Some("charge-1".to_string()),
                ..Properties::default()
            };
            self.transport.enqueue("payments", properties, body).await;
        }

        async fn next(&mut self) -> Delivery {
            self.deliveries.recv().await.unwrap()
        }

        fn settlements(&self) -> Vec<Settlement> {
            self.transport
                .replies()
                .into_iter()
                .map(|r| r.settlement)
                .collect()
        }
    }

    async fn harness<F>(mode: GuaranteeMode, configure: F) -> Harness
    where
        F: FnOnce(&mut SubscriptionBuilder),
    {
        let mut bindings = TypeBindingRegistry::new();
        bindings.register::<Charge>("urn:charge").unwrap();
        bindings.register::<Unbound>("urn:unbound").unwrap();
        let bindings = Arc::new(bindings);
        let codecs = Arc::new(CodecRegistry::with_defaults());
        let classifier = MessageClassifier::new(Arc::clone(&bindings), Arc::clone(&codecs));

        let transport = MemoryTransport::new();
        let inbound = transport.open_inbound("payments", 10).await.unwrap();
        let outbound = OutboundChannel::start(
            transport.open_outbound().await.unwrap(),
            bindings,
            codecs,
            &BrokerConfig::default(),
        );
        let reporter = Arc::new(RecordingReporter::new());
        let attempts = Arc::new(InMemoryAttemptStore::new());

        let consumer = ConsumingPromise::new("payments", mode, configure)
            .unwrap()
            .build_consumer(
                classifier,
                inbound.channel,
                reporter.clone(),
                attempts.clone(),
                outbound,
            );

        Harness {
            transport,
            deliveries: inbound.deliveries,
            consumer,
            reporter,
            attempts,
        }
    }

    fn at_least_once(max_attempts: u32) -> GuaranteeMode {
        GuaranteeMode::AtLeastOnce(RetryPolicy::new(max_attempts).unwrap())
    }

    fn succeeds(s: &mut SubscriptionBuilder) {
        s.consume::<Charge, _>(handler_fn("ok", |m: Message<Charge>| async move {
            anyhow::ensure!(m.cents > 0, "empty charge");
            Ok(())
        }));
    }

    const CHARGE: &[u8] = br#"{"cents":500}"#;

    #[tokio::test]
    async fn success_is_acked_without_report() {
        let mut h = harness(at_least_once(3), succeeds).await;
        h.publish("urn:charge", content_types::JSON, CHARGE).await;
        let delivery = h.next().await;

        let outcome = h.consumer.on_delivery(delivery).await.unwrap();

        assert!(outcome.result.is_success());
        assert_eq!(outcome.classification, "resolved");
        assert_eq!(outcome.action, ReplyAction::Ack);
        assert_eq!(h.settlements(), vec![Settlement::Ack]);
        assert!(h.reporter.is_empty());
        assert!(h.attempts.is_empty());
    }

    #[tokio::test]
    async fn unresolved_tag_is_acked_and_reported_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let mut h = harness(at_least_once(3), move |s| {
            s.consume::<Charge, _>(handler_fn("count", move |_m: Message<Charge>| {
                let calls = Arc::clone(&counted);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        })
        .await;
        h.publish("urn:refund", content_types::JSON, CHARGE).await;
        let delivery = h.next().await;

        let outcome = h.consumer.on_delivery(delivery).await.unwrap();

        assert_eq!(outcome.classification, "unresolved");
        assert!(outcome.result.is_terminal_failure());
        assert_eq!(h.settlements(), vec![Settlement::Ack]);
        let records = h.reporter.records();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].errors[0], ConsumingError::Unresolved { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsupported_content_type_is_acked_and_reported_once() {
        let mut h = harness(at_least_once(3), succeeds).await;
        h.publish("urn:charge", "application/xml", b"<charge/>").await;
        let delivery = h.next().await;

        let outcome = h.consumer.on_delivery(delivery).await.unwrap();

        assert_eq!(outcome.classification, "unsupported");
        assert_eq!(outcome.action, ReplyAction::Ack);
        assert_eq!(h.reporter.len(), 1);
        assert!(matches!(
            h.reporter.records()[0].errors[0],
            ConsumingError::Unsupported { .. }
        ));
    }

    #[tokio::test]
    async fn corrupted_body_is_acked_and_reported_once() {
        let mut h = harness(at_least_once(3), succeeds).await;
        h.publish("urn:charge", content_types::JSON, b"{\"cents\":").await;
        let delivery = h.next().await;

        let outcome = h.consumer.on_delivery(delivery).await.unwrap();

        assert_eq!(outcome.classification, "corrupted");
        assert_eq!(h.settlements(), vec![Settlement::Ack]);
        assert_eq!(h.reporter.len(), 1);
    }

    #[tokio::test]
    async fn bound_type_without_handler_is_unhandled() {
        let mut h = harness(at_least_once(3), succeeds).await;
        h.publish("urn:unbound", content_types::JSON, b"null").await;
        let delivery = h.next().await;

        let outcome = h.consumer.on_delivery(delivery).await.unwrap();

        assert!(outcome.result.is_terminal_failure());
        assert_eq!(outcome.action, ReplyAction::Ack);
        assert!(matches!(
            h.reporter.records()[0].errors[0],
            ConsumingError::Unhandled { .. }
        ));
    }

    #[tokio::test]
    async fn at_least_once_requeues_until_bound_then_drops() {
        let handler = AlwaysFails::default();
        let registered = handler.clone();
        let mut h = harness(at_least_once(3), move |s| {
            s.consume::<Charge, _>(registered);
        })
        .await;
        h.publish("urn:charge", content_types::JSON, CHARGE).await;

        let mut actions = Vec::new();
        for _ in 0..3 {
            let delivery = h.next().await;
            let outcome = h.consumer.on_delivery(delivery).await.unwrap();
            actions.push(outcome.action);
        }

        assert_eq!(
            actions,
            vec![ReplyAction::Requeue, ReplyAction::Requeue, ReplyAction::Ack]
        );
        assert_eq!(
            h.settlements(),
            vec![Settlement::Requeue, Settlement::Requeue, Settlement::Ack]
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.last_attempt.load(Ordering::SeqCst), 3);

        let records = h.reporter.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempt, 3);
        assert_eq!(records[0].errors.len(), 3);
        assert!(h.attempts.is_empty());
        assert!(h.deliveries.try_recv().is_err());
    }

    #[tokio::test]
    async fn retry_succeeds_on_second_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let mut h = harness(at_least_once(3), move |s| {
            s.consume::<Charge, _>(handler_fn("flaky", move |_m: Message<Charge>| {
                let calls = Arc::clone(&counted);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::ensure!(n > 0, "first attempt fails");
                    Ok(())
                }
            }));
        })
        .await;
        h.publish("urn:charge", content_types::JSON, CHARGE).await;

        let first = h.next().await;
        let first = h.consumer.on_delivery(first).await.unwrap();
        let second = h.next().await;
        let second = h.consumer.on_delivery(second).await.unwrap();

        assert_eq!(first.action, ReplyAction::Requeue);
        assert_eq!(second.attempt, 2);
        assert!(second.result.is_success());
        assert!(h.reporter.is_empty());
        assert!(h.attempts.is_empty());
    }

    #[tokio::test]
    async fn at_most_once_failure_is_acked_first_and_reported() {
        let handler = AlwaysFails::default();
        let registered = handler.clone();
        let mut h = harness(GuaranteeMode::AtMostOnce, move |s| {
            s.consume::<Charge, _>(registered);
        })
        .await;
        h.publish("urn:charge", content_types::JSON, CHARGE).await;
        let delivery = h.next().await;

        let outcome = h.consumer.on_delivery(delivery).await.unwrap();

        assert!(outcome.result.is_terminal_failure());
        assert_eq!(h.settlements(), vec![Settlement::Ack]);
        assert_eq!(h.reporter.len(), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(h.deliveries.try_recv().is_err());
        assert!(h.attempts.is_empty());
    }

    #[tokio::test]
    async fn same_delivery_twice_is_a_contract_violation() {
        let mut h = harness(at_least_once(3), succeeds).await;
        h.publish("urn:charge", content_types::JSON, CHARGE).await;
        let delivery = h.next().await;

        h.consumer.on_delivery(delivery.clone()).await.unwrap();
        let again = h.consumer.on_delivery(delivery).await;

        assert!(matches!(again, Err(ReplyError::AlreadySettled { .. })));
        assert_eq!(h.transport.replies().len(), 1);
    }

    fn charge_without_id() -> Properties {
        Properties {
            message_type: Some("urn:charge".to_string()),
            content_type: Some(content_types::JSON.to_string()),
            ..Properties::default()
        }
    }

    #[tokio::test]
    async fn messages_without_id_keep_separate_attempt_counts() {
        let handler = AlwaysFails::default();
        let registered = handler.clone();
        let mut h = harness(at_least_once(3), move |s| {
            s.consume::<Charge, _>(registered);
        })
        .await;
        for _ in 0..3 {
            h.transport
                .enqueue("payments", charge_without_id(), CHARGE)
                .await;
        }

        for _ in 0..3 {
            let delivery = h.next().await;
            let outcome = h.consumer.on_delivery(delivery).await.unwrap();
            assert_eq!(outcome.attempt, 1);
            assert_eq!(outcome.action, ReplyAction::Republish);
        }

        assert_eq!(h.settlements(), vec![Settlement::Ack; 3]);
        assert!(h.reporter.is_empty());
        let mut ids: Vec<_> = h
            .transport
            .published()
            .into_iter()
            .map(|envelope| {
                assert_eq!(envelope.exchange, "");
                assert_eq!(envelope.routing_key, "payments");
                assert_eq!(envelope.body.as_ref(), CHARGE);
                envelope.properties.message_id.unwrap()
            })
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(h.attempts.len(), 3);

        let copy = h.next().await;
        assert!(copy.message_id().is_some());
        let outcome = h.consumer.on_delivery(copy).await.unwrap();
        assert_eq!(outcome.attempt, 2);
        assert_eq!(outcome.action, ReplyAction::Requeue);
        assert_eq!(handler.last_attempt.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn message_without_id_republished_then_dropped_at_bound() {
        let handler = AlwaysFails::default();
        let registered = handler.clone();
        let mut h = harness(at_least_once(2), move |s| {
            s.consume::<Charge, _>(registered);
        })
        .await;
        h.transport
            .enqueue("payments", charge_without_id(), CHARGE)
            .await;

        let first = h.next().await;
        let first = h.consumer.on_delivery(first).await.unwrap();
        let copy = h.next().await;
        let second = h.consumer.on_delivery(copy).await.unwrap();

        assert_eq!(first.action, ReplyAction::Republish);
        assert_eq!(second.attempt, 2);
        assert!(second.result.is_terminal_failure());
        let records = h.reporter.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].errors.len(), 2);
        assert!(h.attempts.is_empty());
        assert!(h.deliveries.try_recv().is_err());
    }

    #[tokio::test]
    async fn message_without_id_is_requeued_when_republish_fails() {
        let handler = AlwaysFails::default();
        let registered = handler.clone();
        let mut h = harness(at_least_once(3), move |s| {
            s.consume::<Charge, _>(registered);
        })
        .await;
        h.consumer.outbound.stop().await;
        h.transport
            .enqueue("payments", charge_without_id(), CHARGE)
            .await;

        let delivery = h.next().await;
        let outcome = h.consumer.on_delivery(delivery).await.unwrap();

        assert_eq!(outcome.action, ReplyAction::Requeue);
        assert_eq!(h.settlements(), vec![Settlement::Requeue]);
        assert!(h.transport.published().is_empty());
        assert!(h.attempts.is_empty());
    }

    #[tokio::test]
    async fn run_consumes_until_stream_ends() {
        let h = harness(at_least_once(3), succeeds).await;
        for _ in 0..3 {
            h.publish("urn:charge", content_types::JSON, CHARGE).await;
        }
        let Harness {
            transport,
            deliveries,
            consumer,
            ..
        } = h;
        let (_shutdown, signal) = watch::channel(false);
        transport.close_queue("payments");

        let consumer = Arc::new(consumer);
        Arc::clone(&consumer).run(deliveries, signal, 2).await;

        assert_eq!(transport.replies().len(), 3);
        assert_eq!(consumer.channel().outstanding_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_run_settles_every_delivery() {
        const DELIVERIES: usize = 500;

        let h = harness(at_least_once(3), |s| {
            s.consume::<Charge, _>(handler_fn("jitter", |m: Message<Charge>| async move {
                tokio::time::sleep(Duration::from_micros(m.cents % 7 * 50)).await;
                Ok(())
            }));
        })
        .await;
        let Harness {
            transport,
            deliveries,
            consumer,
            ..
        } = h;
        let consumer = Arc::new(consumer);
        let (_shutdown, signal) = watch::channel(false);
        let running = tokio::spawn(Arc::clone(&consumer).run(deliveries, signal, 10));

        for n in 0..DELIVERIES {
            let properties = Properties {
                message_type: Some("urn:charge".to_string()),
                content_type: Some(content_types::JSON.to_string()),
                message_id: Some(format!("charge-{n}")),
                ..Properties::default()
            };
            let body = format!(r#"{{"cents":{}}}"#, n + 1);
            transport.enqueue("payments", properties, body.into_bytes()).await;
        }
        transport.close_queue("payments");

        tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .unwrap()
            .unwrap();

        let replies = transport.replies();
        assert_eq!(replies.len(), DELIVERIES);
        assert!(replies.iter().all(|r| r.settlement == Settlement::Ack));
        assert_eq!(transport.unacked_len("payments"), 0);
        assert_eq!(consumer.channel().outstanding_count(), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness(at_least_once(3), succeeds).await;
        let (shutdown, signal) = watch::channel(false);
        let consumer = Arc::new(h.consumer);
        let running = tokio::spawn(Arc::clone(&consumer).run(h.deliveries, signal, 4));

        shutdown.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(consumer.channel().outstanding_count(), 0);
    }
}
