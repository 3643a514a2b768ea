//! `warren-inspect`: classifies captured deliveries offline.
//!
//! Reads one JSON object per line: the message properties (`type`,
//! `contentType`, `contentEncoding`, `messageId`, `headers`, ...) plus the
//! body as `body` (text) or `bodyBase64`. Prints one JSON classification
//! report per input line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use warren_consumer::{Broker, BrokerConfig, ConsumedMessage, MessageClassifier};
use warren_core::{content_types, ChannelId, Delivery, DeliveryTag, MsgPackCodec, Properties};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Classify captured deliveries against a set of type tags.
#[derive(Debug, Parser)]
#[command(name = "warren-inspect", version)]
struct Cli {
    /// JSON-lines file to read; stdin when omitted.
    #[arg(short, long, env = "WARREN_INSPECT_INPUT")]
    input: Option<PathBuf>,

    /// Type tag to accept. Repeat for several tags.
    #[arg(short, long = "bind", value_name = "TAG")]
    bindings: Vec<String>,

    /// Also decode `application/msgpack` and `application/x-msgpack`.
    #[arg(long)]
    msgpack: bool,

    #[arg(long, value_enum, env = "WARREN_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapturedDelivery {
    #[serde(flatten)]
    properties: Properties,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    body_base64: Option<String>,
    #[serde(default)]
    redelivered: bool,
}

impl CapturedDelivery {
    fn into_delivery(self, tag: u64) -> anyhow::Result<Delivery> {
        let body = match (self.body, self.body_base64) {
            (Some(_), Some(_)) => anyhow::bail!("set either body or bodyBase64, not both"),
            (Some(text), None) => text.into_bytes(),
            (None, Some(encoded)) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .context("bodyBase64 is not valid base64")?,
            (None, None) => Vec::new(),
        };
        Ok(Delivery::builder(ChannelId(0), DeliveryTag(tag))
            .properties(self.properties)
            .body(body)
            .redelivered(self.redelivered)
            .build())
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

fn build_classifier(cli: &Cli) -> anyhow::Result<MessageClassifier> {
    let mut broker = Broker::new(BrokerConfig::default());
    for tag in &cli.bindings {
        broker
            .register_type_binding::<serde_json::Value>(tag)
            .with_context(|| format!("cannot bind {tag}"))?;
    }
    if cli.msgpack {
        broker.register_codec(content_types::MSGPACK, Arc::new(MsgPackCodec))?;
        broker.register_codec(content_types::X_MSGPACK, Arc::new(MsgPackCodec))?;
    }
    Ok(broker.classifier())
}

fn report(line: u64, message: &ConsumedMessage) -> serde_json::Value {
    let delivery = message.delivery();
    let mut out = json!({
        "line": line,
        "classification": message.kind(),
        "messageType": delivery.message_type(),
        "contentType": delivery.content_type(),
        "messageId": delivery.message_id(),
    });
    match message {
        ConsumedMessage::Resolved { payload, .. } => out["document"] = payload.document().clone(),
        ConsumedMessage::Corrupted { reason, .. } => out["error"] = json!(reason.to_string()),
        ConsumedMessage::Unresolved { .. } | ConsumedMessage::Unsupported { .. } => {}
    }
    out
}

/// Parses one captured line into a delivery tagged with its line number.
fn parse_line(line: &str, number: u64) -> anyhow::Result<Delivery> {
    let captured: CapturedDelivery = serde_json::from_str(line)?;
    captured.into_delivery(number)
}

async fn inspect<R>(classifier: &MessageClassifier, reader: R) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut number = 0_u64;
    while let Some(line) = lines.next_line().await? {
        number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let delivery = match parse_line(&line, number) {
            Ok(delivery) => delivery,
            Err(error) => {
                tracing::warn!(line = number, error = %error, "skipping unreadable line");
                println!("{}", json!({ "line": number, "error": format!("{error:#}") }));
                continue;
            }
        };
        let message = classifier.classify(Arc::new(delivery));
        println!("{}", report(number, &message));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let classifier = build_classifier(&cli)?;
    match &cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?;
            inspect(&classifier, BufReader::new(file)).await
        }
        None => inspect(&classifier, BufReader::new(tokio::io::stdin())).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_base64_bodies_parse() {
        let text = parse_line(r#"{"type":"urn:a","body":"{}"}"#, 1).unwrap();
        assert_eq!(text.message_type(), Some("urn:a"));
        assert_eq!(&text.body()[..], b"{}");

        let binary = parse_line(r#"{"bodyBase64":"gaFhAQ=="}"#, 2).unwrap();
        assert_eq!(binary.delivery_tag(), DeliveryTag(2));
        assert_eq!(&binary.body()[..], &[0x81, 0xA1, 0x61, 0x01]);
    }

    #[test]
    fn bad_body_is_a_line_error() {
        let invalid = parse_line(r#"{"bodyBase64":"not base64!"}"#, 3).unwrap_err();
        assert!(format!("{invalid:#}").contains("bodyBase64"));

        assert!(parse_line(r#"{"body":"x","bodyBase64":"eA=="}"#, 4).is_err());
        assert!(parse_line("{", 5).is_err());
    }

    #[tokio::test]
    async fn unreadable_lines_do_not_stop_the_run() {
        let classifier = Broker::new(BrokerConfig::default()).classifier();
        let input = concat!(
            "{\"bodyBase64\":\"%%%\"}\n",
            "{\"type\":\"urn:a\",\"contentType\":\"application/json\",\"body\":\"{}\"}\n",
        );
        let reader = BufReader::new(input.as_bytes());
        assert!(inspect(&classifier, reader).await.is_ok());
    }
}
