//! Inbound delivery model.
//!
//! A [`Delivery`] is created by the transport when the broker pushes a message
//! on an inbound channel. It is immutable once received and is terminated by
//! exactly one reply (acknowledge or reject) on the channel that delivered it.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier of a transport channel. Acknowledgment is channel-scoped, so a
/// delivery remembers which channel it arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Channel-scoped delivery identifier used for ack/reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Basic message properties carried alongside the body.
///
/// Every field is optional on the wire; an absent `message_type` or
/// `content_type` is treated as an unknown tag by the classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    /// Wire-level type tag naming the payload type.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    /// Media type of the body, e.g. `application/json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Character encoding label for text codecs, e.g. `utf-8`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Unix timestamp in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// One inbound unit: bytes plus transport metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    channel: ChannelId,
    delivery_tag: DeliveryTag,
    body: Bytes,
    properties: Properties,
    redelivered: bool,
    exchange: String,
    routing_key: String,
    consumer_tag: String,
}

impl Delivery {
    /// Starts building a delivery received on `channel` under `delivery_tag`.
    #[must_use]
    pub fn builder(channel: ChannelId, delivery_tag: DeliveryTag) -> DeliveryBuilder {
        DeliveryBuilder {
            delivery: Self {
                channel,
                delivery_tag,
                body: Bytes::new(),
                properties: Properties::default(),
                redelivered: false,
                exchange: String::new(),
                routing_key: String::new(),
                consumer_tag: String::new(),
            },
        }
    }

    #[must_use]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    #[must_use]
    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Wire type tag, if the publisher set one.
    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        self.properties.message_type.as_deref()
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type.as_deref()
    }

    #[must_use]
    pub fn content_encoding(&self) -> Option<&str> {
        self.properties.content_encoding.as_deref()
    }

    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id.as_deref()
    }

    #[must_use]
    pub fn timestamp(&self) -> Option<i64> {
        self.properties.timestamp
    }

    /// Looks up an application header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.properties.headers.get(name).map(String::as_str)
    }

    /// Whether the broker flagged this delivery as a redelivery.
    #[must_use]
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    #[must_use]
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Returns a copy of this delivery as the broker would hand it out again
    /// after a requeue: same body and properties, new tag, `redelivered` set.
    #[must_use]
    pub fn redeliver(&self, channel: ChannelId, delivery_tag: DeliveryTag) -> Self {
        Self {
            channel,
            delivery_tag,
            redelivered: true,
            ..self.clone()
        }
    }
}

/// Builder for [`Delivery`]. Used by transports and tests.
#[derive(Debug, Clone)]
pub struct DeliveryBuilder {
    delivery: Delivery,
}

impl DeliveryBuilder {
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.delivery.body = body.into();
        self
    }

    #[must_use]
    pub fn properties(mut self, properties: Properties) -> Self {
        self.delivery.properties = properties;
        self
    }

    #[must_use]
    pub fn message_type(mut self, tag: impl Into<String>) -> Self {
        self.delivery.properties.message_type = Some(tag.into());
        self
    }

    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.delivery.properties.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.delivery.properties.content_encoding = Some(encoding.into());
        self
    }

    #[must_use]
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.delivery.properties.message_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn timestamp(mut self, unix_seconds: i64) -> Self {
        self.delivery.properties.timestamp = Some(unix_seconds);
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.delivery.properties.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.delivery.redelivered = redelivered;
        self
    }

    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.delivery.exchange = exchange.into();
        self
    }

    #[must_use]
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.delivery.routing_key = routing_key.into();
        self
    }

    #[must_use]
    pub fn consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.delivery.consumer_tag = consumer_tag.into();
        self
    }

    #[must_use]
    pub fn build(self) -> Delivery {
        self.delivery
    }
}
