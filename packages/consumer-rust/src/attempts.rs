//! Per-message attempt tracking for at-least-once subscriptions.
//!
//! Brokers do not let a consumer rewrite headers on requeue, so the attempt
//! counter lives outside the message, in an [`AttemptStore`] keyed by message
//! id. A delivery published without an id gets one when it first fails: the
//! consumer republishes it under a fresh id instead of requeueing it, so two
//! messages never share a counter.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use quick_cache::sync::Cache;

use crate::result::ConsumingError;

/// Identifies one logical message across redeliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttemptKey(String);

impl AttemptKey {
    #[must_use]
    pub fn for_message_id(message_id: &str) -> Self {
        Self(format!("id:{message_id}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failure history of one message.
#[derive(Debug, Clone, Default)]
pub struct AttemptState {
    /// Number of failed attempts so far.
    pub failures: u32,
    /// Errors of every failed attempt, oldest first.
    pub errors: Vec<ConsumingError>,
}

/// Stores attempt counters and error history across redeliveries.
#[async_trait]
pub trait AttemptStore: Send + Sync + fmt::Debug {
    /// Number of failed attempts recorded for `key`.
    async fn failures(&self, key: &AttemptKey) -> u32;

    /// Records one more failed attempt and returns the updated history.
    async fn record_failure(&self, key: &AttemptKey, errors: Vec<ConsumingError>) -> AttemptState;

    /// Forgets `key`, returning its history if there was one.
    async fn clear(&self, key: &AttemptKey) -> Option<AttemptState>;
}

/// Process-local attempt store holding at most `capacity` messages.
///
/// A message whose redelivery never comes back to this process (taken by
/// another consumer, purged, dead-lettered) is eventually evicted. Counters
/// do not survive a restart or an eviction; such a message starts over at
/// attempt 1.
pub struct InMemoryAttemptStore {
    entries: Cache<AttemptKey, Arc<Mutex<AttemptState>>>,
    capacity: usize,
}

impl InMemoryAttemptStore {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Cache::new(capacity),
            capacity,
        }
    }

    /// Number of messages with a recorded failure.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for InMemoryAttemptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryAttemptStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryAttemptStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[async_trait]
impl AttemptStore for InMemoryAttemptStore {
    async fn failures(&self, key: &AttemptKey) -> u32 {
        self.entries.get(key).map_or(0, |state| state.lock().failures)
    }

    async fn record_failure(&self, key: &AttemptKey, errors: Vec<ConsumingError>) -> AttemptState {
        let entry = match self
            .entries
            .get_or_insert_with(key, || Ok::<_, Infallible>(Arc::default()))
        {
            Ok(entry) => entry,
            Err(never) => match never {},
        };
        let mut state = entry.lock();
        state.failures = state.failures.saturating_add(1);
        state.errors.extend(errors);
        state.clone()
    }

    async fn clear(&self, key: &AttemptKey) -> Option<AttemptState> {
        let entry = self.entries.get(key)?;
        self.entries.remove(key);
        let state = entry.lock().clone();
        Some(state)
    }
}
