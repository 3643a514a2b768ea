//! Fan-out of a dispatch to every handler accepting the payload type.

use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::join_all;
use futures_util::FutureExt;
use tower::Service;

use super::{Dispatch, DispatchOutcome};
use crate::handler::HandlerSet;
use crate::result::ConsumingError;

/// Routes a [`Dispatch`] to the handlers registered for its payload type.
///
/// All matching handlers run concurrently and are all awaited; one failing
/// handler does not cancel the others. A panicking handler counts as a failed
/// handler. Handler failures are data in the [`DispatchOutcome`], so the
/// service itself never errors.
#[derive(Debug, Clone)]
pub struct HandlerRouter {
    handlers: Arc<HandlerSet>,
}

impl HandlerRouter {
    #[must_use]
    pub fn new(handlers: Arc<HandlerSet>) -> Self {
        Self { handlers }
    }

    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerSet> {
        &self.handlers
    }
}

impl Service<Dispatch> for HandlerRouter {
    type Response = DispatchOutcome;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<DispatchOutcome, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dispatch: Dispatch) -> Self::Future {
        let Dispatch {
            delivery,
            payload,
            attempt,
            ..
        } = dispatch;

        let running: Vec<_> = self
            .handlers
            .matching(payload.type_id())
            .filter_map(|entry| {
                entry
                    .invoke(&payload, Arc::clone(&delivery), attempt)
                    .map(|fut| (entry.name(), fut))
            })
            .collect();

        if running.is_empty() {
            let type_name = payload.type_name();
            return Box::pin(async move {
                Ok(DispatchOutcome {
                    invoked: 0,
                    errors: vec![ConsumingError::Unhandled { type_name }],
                })
            });
        }

        Box::pin(async move {
            let invoked = running.len();
            let results = join_all(running.into_iter().map(|(name, fut)| async move {
                let outcome = AssertUnwindSafe(fut).catch_unwind().await;
                (name, outcome)
            }))
            .await;

            let errors = results
                .into_iter()
                .filter_map(|(name, outcome)| match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(error)) => {
                        tracing::debug!(handler = name, error = %error, "handler failed");
                        Some(ConsumingError::handler(name, error))
                    }
                    Err(_) => {
                        tracing::error!(handler = name, "handler panicked");
                        Some(ConsumingError::handler(name, anyhow::anyhow!("handler panicked")))
                    }
                })
                .collect();

            Ok(DispatchOutcome { invoked, errors })
        })
    }
}
