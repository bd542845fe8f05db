//! Publish pipeline
//!
//! Encodes envelopes, rate-limits, and publishes with confirms and
//! bounded exponential-backoff retry. All outgoing messages go to the
//! configured exchange; the routing key comes from an explicit override
//! header, the reply address, or the per-class default.

use bytes::Bytes;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::BasicProperties;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use envelope_codec::{Encoding, Envelope, EnvelopeCodec, ErrorReport};

use crate::channel::ChannelManager;
use crate::error::{Error, Result};
use crate::headers;
use crate::metrics::{PUBLISH_DURATION, PUBLISH_RETRIES_TOTAL, PUBLISH_TOTAL};
use crate::settings::Settings;
use crate::throttle::{Throttle, Throttles};

/// Case-insensitive header overriding the outgoing routing key;
/// stripped before encryption.
const ROUTING_KEY_HEADER: &str = "x-eio-routing-key";

/// Header marking the reply-routed copy of an error
const ERROR_RESPONSE_HEADER: &str = "x-eio-error-response";

/// Outgoing message class; selects routing key, throttle, and metrics
/// labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Step output data
    Data,
    /// Synchronous HTTP reply
    HttpReply,
    /// Error report
    Error,
    /// State snapshot
    Snapshot,
    /// Delayed redelivery
    Rebound,
}

impl MessageClass {
    /// Metrics label
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageClass::Data => "data",
            MessageClass::HttpReply => "http_reply",
            MessageClass::Error => "error",
            MessageClass::Snapshot => "snapshot",
            MessageClass::Rebound => "rebound",
        }
    }
}

/// Result of a publish call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker confirmed the message
    Confirmed,
    /// The message was handed to the broker without waiting for the
    /// confirm; delivery is not guaranteed
    NotGuaranteed,
}

/// Transport-level properties of an outgoing message
#[derive(Debug, Clone, Default)]
pub struct OutgoingProperties {
    /// AMQP headers, including `messageId` and `x-eio-meta-*`
    /// passthrough values
    pub headers: HashMap<String, Value>,
    /// Broker message TTL in milliseconds
    pub expiration_ms: Option<u64>,
}

impl OutgoingProperties {
    /// Properties with the given headers and no TTL
    pub fn from_headers(headers: HashMap<String, Value>) -> Self {
        Self {
            headers,
            expiration_ms: None,
        }
    }

    fn reply_to(&self) -> Option<String> {
        self.headers
            .get("reply_to")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Confirm-based publisher with retry and rate limiting
pub struct Publisher {
    settings: Arc<Settings>,
    channels: Arc<ChannelManager>,
    codec: Arc<EnvelopeCodec>,
    throttles: Throttles,
}

impl Publisher {
    /// Create a publisher with throttles built from the settings
    pub fn new(
        settings: Arc<Settings>,
        channels: Arc<ChannelManager>,
        codec: Arc<EnvelopeCodec>,
    ) -> Result<Self> {
        let throttles = Throttles::from_settings(&settings)?;
        Ok(Self::with_throttles(settings, channels, codec, throttles))
    }

    /// Create a publisher with injected throttles
    pub fn with_throttles(
        settings: Arc<Settings>,
        channels: Arc<ChannelManager>,
        codec: Arc<EnvelopeCodec>,
        throttles: Throttles,
    ) -> Self {
        Self {
            settings,
            channels,
            codec,
            throttles,
        }
    }

    /// Publish a data envelope to the data routing key
    pub async fn send_data(
        &self,
        envelope: Envelope,
        properties: OutgoingProperties,
    ) -> Result<PublishOutcome> {
        self.send_envelope(MessageClass::Data, envelope, properties, None)
            .await
    }

    /// Publish a snapshot envelope to the snapshot routing key
    pub async fn send_snapshot(
        &self,
        envelope: Envelope,
        properties: OutgoingProperties,
    ) -> Result<PublishOutcome> {
        self.send_envelope(MessageClass::Snapshot, envelope, properties, None)
            .await
    }

    /// Publish a reply envelope routed by the `reply_to` header.
    ///
    /// A missing `reply_to` fails synchronously; no message is
    /// produced.
    pub async fn send_http_reply(
        &self,
        envelope: Envelope,
        properties: OutgoingProperties,
    ) -> Result<PublishOutcome> {
        let reply_to = properties.reply_to().ok_or(Error::MissingReplyTo)?;
        self.send_envelope(MessageClass::HttpReply, envelope, properties, Some(reply_to))
            .await
    }

    /// Publish an error to the error routing key.
    ///
    /// The payload is the `{error, errorInput?}` wrapper with each part
    /// independently base64-encrypted. When the original message carried
    /// a `reply_to` header and error replies are enabled, a second,
    /// reply-routed copy of the encrypted error object alone is
    /// published; the two publishes are independent.
    pub async fn send_error(
        &self,
        report: &ErrorReport,
        properties: OutgoingProperties,
        original_input: Option<&Envelope>,
    ) -> Result<PublishOutcome> {
        let error_part = self.codec.encode_part(&serde_json::to_value(report)?)?;

        let mut wrapper = serde_json::Map::new();
        wrapper.insert("error".to_string(), Value::String(error_part.clone()));
        if let Some(original) = original_input {
            let input_part = self.codec.encode_part(&serde_json::to_value(original)?)?;
            wrapper.insert("errorInput".to_string(), Value::String(input_part));
        }
        let payload = serde_json::to_vec(&Value::Object(wrapper))?;
        self.check_size(payload.len())?;

        let mut properties = properties;
        self.stamp_outgoing_headers(&mut properties);

        let routing_key = self.settings.error_routing_key.clone();
        let outcome = self
            .publish_class(MessageClass::Error, &routing_key, Bytes::from(payload), &properties)
            .await?;

        if !self.settings.no_error_replies {
            if let Some(reply_to) = properties.reply_to() {
                let mut reply_properties = properties.clone();
                reply_properties
                    .headers
                    .insert(ERROR_RESPONSE_HEADER.to_string(), json!(true));
                self.publish_class(
                    MessageClass::Error,
                    &reply_to,
                    Bytes::from(error_part.into_bytes()),
                    &reply_properties,
                )
                .await?;
            }
        }

        Ok(outcome)
    }

    async fn send_envelope(
        &self,
        class: MessageClass,
        mut envelope: Envelope,
        mut properties: OutgoingProperties,
        routing_override: Option<String>,
    ) -> Result<PublishOutcome> {
        let header_override = take_routing_key_header(&mut envelope.headers);
        let routing_key = routing_override
            .or(header_override)
            .unwrap_or_else(|| self.default_routing_key(class).to_string());

        self.stamp_outgoing_headers(&mut properties);

        let encoding = Encoding::for_protocol_version(self.settings.protocol_version);
        let payload = self.codec.encode_envelope(&envelope, encoding)?;
        self.check_size(payload.len())?;

        self.publish_class(class, &routing_key, Bytes::from(payload), &properties)
            .await
    }

    async fn publish_class(
        &self,
        class: MessageClass,
        routing_key: &str,
        payload: Bytes,
        properties: &OutgoingProperties,
    ) -> Result<PublishOutcome> {
        let start = Instant::now();
        let exchange = self.settings.publish_messages_to.clone();

        let result = self
            .send_to_exchange(
                &exchange,
                routing_key,
                payload,
                properties,
                self.throttle_for(class),
            )
            .await;

        PUBLISH_DURATION
            .with_label_values(&[class.as_str()])
            .observe(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "success" } else { "error" };
        PUBLISH_TOTAL
            .with_label_values(&[class.as_str(), status])
            .inc();

        result
    }

    /// Publish a pre-encoded payload, rate limiting first when a
    /// throttle is supplied.
    pub async fn send_to_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        properties: &OutgoingProperties,
        throttle: Option<&Arc<dyn Throttle>>,
    ) -> Result<PublishOutcome> {
        if let Some(throttle) = throttle {
            throttle.acquire().await;
        }

        debug!(
            "publishing {} bytes to {}/{}",
            payload.len(),
            exchange,
            routing_key
        );
        self.publish_message(exchange, routing_key, payload, properties)
            .await
    }

    /// Publish with confirm and bounded exponential-backoff retry
    async fn publish_message(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        properties: &OutgoingProperties,
    ) -> Result<PublishOutcome> {
        let attempts = self.settings.amqp_publish_retry_attempts;
        let mut iteration: u32 = 0;

        loop {
            match self
                .publish_once(exchange, routing_key, &payload, properties, iteration)
                .await
            {
                Ok(outcome) => {
                    if iteration > 0 {
                        info!(
                            "publish to {}/{} succeeded after {} attempts",
                            exchange,
                            routing_key,
                            iteration + 1
                        );
                    }
                    return Ok(outcome);
                }
                Err(err @ Error::IllegalOperation(_)) => {
                    error!(
                        "fatal publish failure on {}/{}: {}",
                        exchange, routing_key, err
                    );
                    return Err(err);
                }
                Err(err) => {
                    if iteration + 1 >= attempts {
                        error!(
                            "publish to {}/{} failed after {} attempts: {}",
                            exchange,
                            routing_key,
                            iteration + 1,
                            err
                        );
                        return Err(Error::Publish(format!(
                            "failed after {} attempts: {}",
                            iteration + 1,
                            err
                        )));
                    }

                    let delay = retry_delay(
                        self.settings.amqp_publish_retry_delay,
                        self.settings.amqp_publish_max_retry_delay,
                        iteration,
                    );
                    warn!(
                        "publish attempt {} on {}/{} failed, retrying in {:?}: {}",
                        iteration + 1,
                        exchange,
                        routing_key,
                        delay,
                        err
                    );
                    PUBLISH_RETRIES_TOTAL.inc();
                    tokio::time::sleep(delay).await;
                    iteration += 1;
                }
            }
        }
    }

    async fn publish_once(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &OutgoingProperties,
        iteration: u32,
    ) -> Result<PublishOutcome> {
        let channel = self.channels.ensure_publish_channel().await?;
        let amqp_properties = self.build_properties(properties, iteration);

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                payload,
                amqp_properties,
            )
            .await
            .map_err(classify_publish_error)?;

        if self.settings.process_amqp_drain {
            match confirm.await.map_err(classify_publish_error)? {
                Confirmation::Nack(_) => Err(Error::Publish(
                    "broker negatively acknowledged the publish".to_string(),
                )),
                Confirmation::Ack(Some(_)) => Err(Error::Publish(format!(
                    "message returned as unroutable from {}/{}",
                    exchange, routing_key
                ))),
                _ => Ok(PublishOutcome::Confirmed),
            }
        } else {
            // at-most-once-attempt semantics: the confirm is observed
            // off the call path and failures are only logged
            warn!(
                "returning before confirm for {}/{}; delivery is not guaranteed",
                exchange, routing_key
            );
            let (exchange, routing_key) = (exchange.to_string(), routing_key.to_string());
            tokio::spawn(async move {
                match confirm.await {
                    Ok(Confirmation::Nack(_)) => {
                        warn!("unconfirmed publish to {}/{} was nacked", exchange, routing_key)
                    }
                    Ok(Confirmation::Ack(Some(_))) => {
                        warn!("unconfirmed publish to {}/{} was returned", exchange, routing_key)
                    }
                    Ok(_) => {}
                    Err(e) => warn!(
                        "confirm wait for {}/{} failed: {}",
                        exchange, routing_key, e
                    ),
                }
            });
            Ok(PublishOutcome::NotGuaranteed)
        }
    }

    fn build_properties(
        &self,
        properties: &OutgoingProperties,
        iteration: u32,
    ) -> BasicProperties {
        let mut header_map = properties.headers.clone();
        if iteration > 0 {
            // diagnostic only
            header_map.insert("retry".to_string(), json!(iteration));
        }

        let mut amqp_properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_content_encoding("utf8".into())
            .with_headers(headers::to_field_table(&header_map));

        if self.settings.amqp_persistent_messages {
            amqp_properties = amqp_properties.with_delivery_mode(2);
        }
        if let Some(expiration) = properties.expiration_ms {
            amqp_properties = amqp_properties.with_expiration(expiration.to_string().into());
        }

        amqp_properties
    }

    fn stamp_outgoing_headers(&self, properties: &mut OutgoingProperties) {
        properties
            .headers
            .entry("messageId".to_string())
            .or_insert_with(|| json!(Uuid::new_v4().to_string()));
        properties
            .headers
            .entry("protocolVersion".to_string())
            .or_insert_with(|| json!(self.settings.protocol_version));
    }

    fn check_size(&self, size: usize) -> Result<()> {
        let limit = self.settings.outgoing_message_size_limit;
        if size > limit {
            return Err(Error::SizeLimitExceeded { size, limit });
        }
        Ok(())
    }

    fn throttle_for(&self, class: MessageClass) -> Option<&Arc<dyn Throttle>> {
        match class {
            MessageClass::Data | MessageClass::HttpReply => self.throttles.data.as_ref(),
            MessageClass::Error => self.throttles.error.as_ref(),
            MessageClass::Snapshot => self.throttles.snapshot.as_ref(),
            MessageClass::Rebound => None,
        }
    }

    fn default_routing_key(&self, class: MessageClass) -> &str {
        match class {
            MessageClass::Data => &self.settings.data_routing_key,
            MessageClass::Error => &self.settings.error_routing_key,
            MessageClass::Snapshot => &self.settings.snapshot_routing_key,
            MessageClass::Rebound => &self.settings.rebound_routing_key,
            // reply_to always overrides for replies
            MessageClass::HttpReply => &self.settings.data_routing_key,
        }
    }
}

fn take_routing_key_header(headers: &mut HashMap<String, String>) -> Option<String> {
    let key = headers
        .keys()
        .find(|k| k.eq_ignore_ascii_case(ROUTING_KEY_HEADER))?
        .clone();
    headers.remove(&key)
}

/// Delay before retry number `iteration + 1`
pub(crate) fn retry_delay(base_ms: u64, max_ms: u64, iteration: u32) -> Duration {
    let factor = 2u64.saturating_pow(iteration.min(62));
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

fn classify_publish_error(err: lapin::Error) -> Error {
    match err {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            Error::IllegalOperation(err.to_string())
        }
        other => Error::Publish(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use serde_json::json;

    fn publisher(settings: Settings) -> Publisher {
        let settings = Arc::new(settings);
        let connections = Arc::new(ConnectionManager::new(settings.clone()));
        let channels = Arc::new(ChannelManager::new(settings.clone(), connections));
        let codec = Arc::new(
            EnvelopeCodec::new(
                settings.message_crypto_password.as_deref(),
                settings.message_crypto_iv.as_deref(),
            )
            .unwrap(),
        );
        Publisher::new(settings, channels, codec).unwrap()
    }

    #[test]
    fn test_retry_delay_doubles_up_to_cap() {
        assert_eq!(retry_delay(100, 300_000, 0), Duration::from_millis(100));
        assert_eq!(retry_delay(100, 300_000, 1), Duration::from_millis(200));
        assert_eq!(retry_delay(100, 300_000, 5), Duration::from_millis(3200));
        assert_eq!(retry_delay(100, 150, 1), Duration::from_millis(150));
        // huge iterations must not overflow
        assert_eq!(retry_delay(100, 150, 200), Duration::from_millis(150));
    }

    #[test]
    fn test_take_routing_key_header_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("X-EIO-Routing-Key".to_string(), "custom.key".to_string());
        headers.insert("other".to_string(), "kept".to_string());

        assert_eq!(
            take_routing_key_header(&mut headers).as_deref(),
            Some("custom.key")
        );
        assert!(!headers.contains_key("X-EIO-Routing-Key"));
        assert!(headers.contains_key("other"));

        assert_eq!(take_routing_key_header(&mut headers), None);
    }

    #[tokio::test]
    async fn test_http_reply_without_reply_to_fails_before_publish() {
        let publisher = publisher(crate::test_support::settings());
        let result = publisher
            .send_http_reply(Envelope::new(json!("x")), OutgoingProperties::default())
            .await;

        assert!(matches!(result, Err(Error::MissingReplyTo)));
    }

    #[tokio::test]
    async fn test_publish_gives_up_after_configured_attempts() {
        let mut settings = crate::test_support::settings();
        // nothing listens on port 1, every attempt fails fast
        settings.amqp_uri = "amqp://127.0.0.1:1/%2f".to_string();
        settings.amqp_reconnect_attempts = 1;
        settings.amqp_reconnect_timeout = 10;
        settings.amqp_publish_retry_attempts = 3;
        settings.amqp_publish_retry_delay = 1;
        settings.amqp_publish_max_retry_delay = 5;
        let publisher = publisher(settings);

        let result = publisher
            .send_data(Envelope::new(json!("x")), OutgoingProperties::default())
            .await;

        match result {
            Err(Error::Publish(message)) => {
                assert!(message.contains("after 3 attempts"), "got: {}", message)
            }
            other => panic!("expected publish exhaustion, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_oversized_payload_fails_before_publish() {
        let mut settings = crate::test_support::settings();
        settings.outgoing_message_size_limit = 16;
        let publisher = publisher(settings);

        let envelope = Envelope::new(json!({"data": "a long enough payload body"}));
        let result = publisher
            .send_data(envelope, OutgoingProperties::default())
            .await;

        assert!(matches!(result, Err(Error::SizeLimitExceeded { .. })));
    }

    #[test]
    fn test_build_properties_stamps_retry_and_expiration() {
        let publisher = publisher(crate::test_support::settings());
        let mut properties = OutgoingProperties::default();
        properties.expiration_ms = Some(15_000);

        let amqp = publisher.build_properties(&properties, 2);
        assert_eq!(amqp.expiration().as_ref().map(|s| s.as_str()), Some("15000"));
        let headers = amqp.headers().as_ref().unwrap();
        assert!(headers
            .inner()
            .contains_key(&lapin::types::ShortString::from("retry")));

        let amqp = publisher.build_properties(&OutgoingProperties::default(), 0);
        let headers = amqp.headers().as_ref().unwrap();
        assert!(!headers
            .inner()
            .contains_key(&lapin::types::ShortString::from("retry")));
    }

    #[test]
    fn test_persistent_flag_sets_delivery_mode() {
        let mut settings = crate::test_support::settings();
        settings.amqp_persistent_messages = true;
        let publisher = publisher(settings);

        let amqp = publisher.build_properties(&OutgoingProperties::default(), 0);
        assert_eq!(amqp.delivery_mode().as_ref().copied(), Some(2));
    }
}
