//! Timing and outcome instrumentation for dispatches.
//!
//! Wraps each dispatch in a `dispatch` span and records the duration both on
//! the span and in the `warren_dispatch_duration_seconds` histogram.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::{Dispatch, DispatchOutcome};

pub const DISPATCH_DURATION_SECONDS: &str = "warren_dispatch_duration_seconds";

/// Tower layer adding the `dispatch` span and duration histogram.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstrumentLayer;

impl<S> Layer<S> for InstrumentLayer {
    type Service = InstrumentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InstrumentService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentService<S> {
    inner: S,
}

impl<S> Service<Dispatch> for InstrumentService<S>
where
    S: Service<Dispatch, Response = DispatchOutcome> + Send,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = DispatchOutcome;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<DispatchOutcome, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dispatch: Dispatch) -> Self::Future {
        let queue = dispatch.queue.to_string();
        let message_type = dispatch.payload.tag().to_string();

        let span = info_span!(
            "dispatch",
            queue = %queue,
            message_type = %message_type,
            message_id = ?dispatch.delivery.message_id(),
            attempt = dispatch.attempt,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(dispatch);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(outcome) if outcome.is_success() => "ok",
                    Ok(outcome) if outcome.is_unhandled() => "unhandled",
                    Ok(_) => "failed",
                    Err(_) => "error",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::histogram!(
                    DISPATCH_DURATION_SECONDS,
                    "queue" => queue,
                    "outcome" => outcome
                )
                .record(elapsed.as_secs_f64());

                tracing::debug!(duration_ms, outcome, "dispatch complete");

                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Arc;

    use serde_json::json;
    use tower::ServiceExt;
    use warren_core::{ChannelId, Delivery, DeliveryTag, TypeBinding};

    use super::*;
    use crate::result::ConsumingError;

    struct Fixed(DispatchOutcome);

    impl Service<Dispatch> for Fixed {
        type Response = DispatchOutcome;
        type Error = Infallible;
        type Future =
            Pin<Box<dyn Future<Output = Result<DispatchOutcome, Infallible>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _dispatch: Dispatch) -> Self::Future {
            let outcome = self.0.clone();
            Box::pin(async move { Ok(outcome) })
        }
    }

    fn dispatch() -> Dispatch {
        Dispatch {
            queue: Arc::from("q"),
            delivery: Arc::new(Delivery::builder(ChannelId(1), DeliveryTag(1)).build()),
            payload: TypeBinding::of::<serde_json::Value>("urn:any")
                .materialize(json!(null))
                .unwrap(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn passes_outcome_through() {
        let failed = DispatchOutcome {
            invoked: 1,
            errors: vec![ConsumingError::handler("h", anyhow::anyhow!("x"))],
        };
        let svc = InstrumentLayer.layer(Fixed(failed));

        let outcome = svc.oneshot(dispatch()).await.unwrap();
        assert_eq!(outcome.invoked, 1);
        assert_eq!(outcome.errors.len(), 1);
    }
}
