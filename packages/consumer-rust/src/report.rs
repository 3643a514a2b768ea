//! Reporting of terminal consuming failures.

use std::fmt;

use parking_lot::Mutex;
use warren_core::{Delivery, DeliveryTag};

use crate::result::ConsumingError;

/// A message that was dropped after failing, with every error that led there.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub queue: String,
    pub delivery_tag: DeliveryTag,
    pub message_id: Option<String>,
    pub message_type: Option<String>,
    pub content_type: Option<String>,
    /// Attempt on which the message was dropped.
    pub attempt: u32,
    pub errors: Vec<ConsumingError>,
}

impl FailureRecord {
    #[must_use]
    pub fn new(queue: &str, delivery: &Delivery, attempt: u32, errors: Vec<ConsumingError>) -> Self {
        Self {
            queue: queue.to_string(),
            delivery_tag: delivery.delivery_tag(),
            message_id: delivery.message_id().map(str::to_owned),
            message_type: delivery.message_type().map(str::to_owned),
            content_type: delivery.content_type().map(str::to_owned),
            attempt,
            errors,
        }
    }
}

/// Receives terminal failure records for observability.
pub trait FailureReporter: Send + Sync + fmt::Debug {
    fn report(&self, record: FailureRecord);
}

/// Logs each record at `error` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl FailureReporter for TracingReporter {
    fn report(&self, record: FailureRecord) {
        let errors: Vec<String> = record.errors.iter().map(ToString::to_string).collect();
        tracing::error!(
            queue = %record.queue,
            delivery_tag = record.delivery_tag.0,
            message_id = ?record.message_id,
            message_type = ?record.message_type,
            content_type = ?record.content_type,
            attempt = record.attempt,
            errors = ?errors,
            "message dropped after consuming failure"
        );
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    records: Mutex<Vec<FailureRecord>>,
}

impl RecordingReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<FailureRecord> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl FailureReporter for RecordingReporter {
    fn report(&self, record: FailureRecord) {
        self.records.lock().push(record);
    }
}
