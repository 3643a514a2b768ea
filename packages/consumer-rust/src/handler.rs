//! Application handlers and the per-subscription handler set.

use std::any::{self, Any, TypeId};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use warren_core::{Delivery, Payload};

// ---------------------------------------------------------------------------
// Message<T>
// ---------------------------------------------------------------------------

/// A decoded message handed to a handler.
#[derive(Debug)]
pub struct Message<T> {
    value: Arc<T>,
    delivery: Arc<Delivery>,
    attempt: u32,
}

impl<T> Message<T> {
    #[must_use]
    pub fn new(value: Arc<T>, delivery: Arc<Delivery>, attempt: u32) -> Self {
        Self {
            value,
            delivery,
            attempt,
        }
    }

    #[must_use]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Transport metadata of the delivery this message was decoded from.
    #[must_use]
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// One-based attempt number. Greater than 1 once the message has failed
    /// and been requeued.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl<T> Clone for Message<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            delivery: Arc::clone(&self.delivery),
            attempt: self.attempt,
        }
    }
}

impl<T> Deref for Message<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// Handles decoded messages of type `T`.
///
/// Returning an error marks the attempt as failed. Whether the delivery is
/// requeued or dropped depends on the subscription's guarantee mode and retry
/// bound, never on the handler.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    async fn handle(&self, message: Message<T>) -> anyhow::Result<()>;

    /// Name used in logs and failure records.
    fn name(&self) -> &'static str {
        any::type_name::<Self>()
    }
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
    name: &'static str,
}

/// Wraps `f` as a handler named `name`.
pub fn handler_fn<T, F, Fut>(name: &'static str, f: F) -> FnHandler<F>
where
    T: Send + Sync + 'static,
    F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler { f, name }
}

#[async_trait]
impl<T, F, Fut> Handler<T> for FnHandler<F>
where
    T: Send + Sync + 'static,
    F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message<T>) -> anyhow::Result<()> {
        (self.f)(message).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

// ---------------------------------------------------------------------------
// HandlerSet
// ---------------------------------------------------------------------------

pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type Invoke = dyn Fn(&Payload, Arc<Delivery>, u32) -> Option<HandlerFuture> + Send + Sync;

/// A type-erased handler bound to the payload type it accepts.
#[derive(Clone)]
pub(crate) struct HandlerEntry {
    type_id: TypeId,
    type_name: &'static str,
    name: &'static str,
    invoke: Arc<Invoke>,
}

impl HandlerEntry {
    fn new<T, H>(handler: H) -> Self
    where
        T: Send + Sync + 'static,
        H: Handler<T>,
    {
        let name = handler.name();
        let handler = Arc::new(handler);
        Self {
            type_id: TypeId::of::<T>(),
            type_name: any::type_name::<T>(),
            name,
            invoke: Arc::new(move |payload, delivery, attempt| {
                let value = payload.downcast::<T>()?;
                let handler = Arc::clone(&handler);
                let message = Message::new(value, delivery, attempt);
                Some(Box::pin(async move { handler.handle(message).await }) as HandlerFuture)
            }),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn matches(&self, type_id: TypeId) -> bool {
        self.type_id == type_id
    }

    /// Starts the handler. `None` if the payload is not of the handler's type.
    pub(crate) fn invoke(
        &self,
        payload: &Payload,
        delivery: Arc<Delivery>,
        attempt: u32,
    ) -> Option<HandlerFuture> {
        (self.invoke)(payload, delivery, attempt)
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("type_name", &self.type_name)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Handlers registered for one subscription, keyed by payload type.
///
/// Several handlers may accept the same type; all of them run for each
/// matching message.
#[derive(Debug, Clone, Default)]
pub struct HandlerSet {
    entries: Vec<HandlerEntry>,
}

impl HandlerSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler for payloads of type `T`.
    pub fn add<T, H>(&mut self, handler: H)
    where
        T: Send + Sync + 'static,
        H: Handler<T>,
    {
        self.entries.push(HandlerEntry::new::<T, H>(handler));
    }

    pub(crate) fn matching(&self, type_id: TypeId) -> impl Iterator<Item = &HandlerEntry> {
        self.entries.iter().filter(move |entry| entry.matches(type_id))
    }

    /// Whether any handler accepts payloads of type `T`.
    #[must_use]
    pub fn accepts<T: Any>(&self) -> bool {
        self.matching(TypeId::of::<T>()).next().is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
