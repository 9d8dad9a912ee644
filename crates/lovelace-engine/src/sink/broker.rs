//! Message-broker destination.
//!
//! One message per record: key = record `id` bytes, value = the record as
//! JSON (optionally wrapped in a static envelope). A batch counts as
//! delivered only when the broker acknowledged every message.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use lovelace_types::error::ConnectorError;
use lovelace_types::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::Destination;
use crate::http;

const KAFKA_BINARY_V2: &str = "application/vnd.kafka.binary.v2+json";
const KAFKA_V2: &str = "application/vnd.kafka.v2+json";

/// Field under which an enveloped message carries the record.
pub const ENVELOPE_DATA_FIELD: &str = "data";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Base URL of the Kafka REST proxy, e.g. `http://redpanda:8082`.
    pub proxy_url: String,
    pub topic: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Static fields wrapped around every record as `{..envelope, data: record}`.
    pub envelope: Option<Map<String, Value>>,
}

impl BrokerConfig {
    /// Typed view of a job's `destination.config` block.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or mistyped.
    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("invalid broker config: {e}"))
    }

    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.proxy_url.trim().is_empty() {
            errors.push("broker: proxy_url must not be empty".to_string());
        }
        if self.topic.trim().is_empty() {
            errors.push("broker: topic must not be empty".to_string());
        }
        if self
            .envelope
            .as_ref()
            .is_some_and(|e| e.contains_key(ENVELOPE_DATA_FIELD))
        {
            errors.push(format!(
                "broker: envelope must not define '{ENVELOPE_DATA_FIELD}'"
            ));
        }
    }
}

/// Key/value pair handed to a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Broker client with synchronous publish-and-acknowledge semantics.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Publish `messages` to `topic`, returning once all are acknowledged.
    async fn send_batch(&self, topic: &str, messages: &[Message]) -> Result<(), ConnectorError>;
}

/// [`MessageProducer`] over the Kafka REST proxy v2 protocol.
pub struct RestProxyProducer {
    http: reqwest::Client,
    base_url: String,
    headers: BTreeMap<String, String>,
}

impl RestProxyProducer {
    #[must_use]
    pub fn new(http: reqwest::Client, config: &BrokerConfig) -> Self {
        Self {
            http,
            base_url: config.proxy_url.trim_end_matches('/').to_string(),
            headers: config.headers.clone(),
        }
    }
}

/// Build the proxy's produce request body.
#[must_use]
pub fn produce_body(messages: &[Message]) -> Value {
    let records: Vec<Value> = messages
        .iter()
        .map(|m| json!({"key": STANDARD.encode(&m.key), "value": STANDARD.encode(&m.value)}))
        .collect();
    json!({ "records": records })
}

/// Check a produce response: one offset per message, none carrying an error.
///
/// # Errors
///
/// Returns a retryable error naming the first rejected message, or when
/// the acknowledgement count does not match.
pub fn check_offsets(response: &Value, expected: usize) -> Result<(), ConnectorError> {
    let offsets = response
        .get("offsets")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ConnectorError::transient_network(
                "BROKER_NO_OFFSETS",
                "produce response carries no offsets",
            )
        })?;
    if offsets.len() != expected {
        return Err(ConnectorError::transient_network(
            "BROKER_ACK_MISMATCH",
            format!("{} of {expected} messages acknowledged", offsets.len()),
        ));
    }
    for (index, offset) in offsets.iter().enumerate() {
        let code = offset.get("error_code").filter(|v| !v.is_null());
        if let Some(code) = code {
            let detail = offset
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ConnectorError::transient_network(
                "BROKER_PRODUCE_ERROR",
                format!("message {index} rejected (error_code {code}): {detail}"),
            )
            .with_details(offset.clone()));
        }
    }
    Ok(())
}

#[async_trait]
impl MessageProducer for RestProxyProducer {
    async fn send_batch(&self, topic: &str, messages: &[Message]) -> Result<(), ConnectorError> {
        let mut request = self
            .http
            .post(format!("{}/topics/{topic}", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, KAFKA_BINARY_V2)
            .header(reqwest::header::ACCEPT, KAFKA_V2)
            .body(produce_body(messages).to_string());
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let response = http::send_json(request).await?;
        check_offsets(&response, messages.len())
    }
}

/// [`Destination`] publishing each record keyed by its `id`.
pub struct BrokerDestination {
    producer: Arc<dyn MessageProducer>,
    topic: String,
    envelope: Option<Map<String, Value>>,
}

impl BrokerDestination {
    #[must_use]
    pub fn new(
        producer: Arc<dyn MessageProducer>,
        topic: impl Into<String>,
        envelope: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            producer,
            topic: topic.into(),
            envelope,
        }
    }

    /// Encode one record as a broker message.
    ///
    /// # Errors
    ///
    /// Returns a `data` error if the value cannot be serialized.
    pub fn encode(&self, record: &Record) -> Result<Message, ConnectorError> {
        let value = match &self.envelope {
            Some(envelope) => {
                let mut wrapped = envelope.clone();
                wrapped.insert(ENVELOPE_DATA_FIELD.to_string(), record.to_value());
                serde_json::to_vec(&wrapped)
            }
            None => serde_json::to_vec(record),
        }
        .map_err(|e| ConnectorError::data("SERIALIZE_FAILED", e.to_string()))?;
        Ok(Message {
            key: record.id().as_bytes().to_vec(),
            value,
        })
    }
}

#[async_trait]
impl Destination for BrokerDestination {
    fn name(&self) -> &str {
        "broker"
    }

    async fn deliver(&mut self, batch: &[Record]) -> Result<(), ConnectorError> {
        let messages = batch
            .iter()
            .map(|r| self.encode(r))
            .collect::<Result<Vec<_>, _>>()?;
        self.producer.send_batch(&self.topic, &messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingProducer {
        sent: Mutex<Vec<(String, Vec<Message>)>>,
    }

    #[async_trait]
    impl MessageProducer for CapturingProducer {
        async fn send_batch(&self, topic: &str, messages: &[Message]) -> Result<(), ConnectorError> {
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), messages.to_vec()));
            Ok(())
        }
    }

    fn record() -> Record {
        Record::try_new(
            json!({
                "id": "1187",
                "source_timestamp": "2024-03-01T12:00:00.000000Z",
                "content": "gg",
            })
            .as_object()
            .unwrap()
            .clone(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn keys_by_id_and_serializes_record() {
        let producer = Arc::new(CapturingProducer::default());
        let mut dest = BrokerDestination::new(producer.clone(), "discord.messages", None);
        dest.deliver(&[record()]).await.unwrap();

        let sent = producer.sent.lock().unwrap();
        let (topic, messages) = &sent[0];
        assert_eq!(topic, "discord.messages");
        assert_eq!(messages[0].key, b"1187");
        let value: Value = serde_json::from_slice(&messages[0].value).unwrap();
        assert_eq!(value["content"], "gg");
        assert_eq!(value["source_timestamp"], "2024-03-01T12:00:00.000000Z");
    }

    #[test]
    fn envelope_wraps_record_under_data() {
        let envelope = json!({"platform": "discord", "type": "channels", "gameId": "g1"});
        let dest = BrokerDestination::new(
            Arc::new(CapturingProducer::default()),
            "onboarding",
            envelope.as_object().cloned(),
        );
        let message = dest.encode(&record()).unwrap();
        let value: Value = serde_json::from_slice(&message.value).unwrap();
        assert_eq!(value["platform"], "discord");
        assert_eq!(value["gameId"], "g1");
        assert_eq!(value["data"]["id"], "1187");
    }

    #[test]
    fn produce_body_is_base64() {
        let body = produce_body(&[Message {
            key: b"k".to_vec(),
            value: b"{}".to_vec(),
        }]);
        assert_eq!(body["records"][0]["key"], "aw==");
        assert_eq!(body["records"][0]["value"], "e30=");
    }

    #[test]
    fn offsets_must_all_be_clean() {
        let ok = json!({"offsets": [
            {"partition": 0, "offset": 10, "error_code": null, "error": null},
            {"partition": 1, "offset": 4},
        ]});
        assert!(check_offsets(&ok, 2).is_ok());

        let err = check_offsets(&ok, 3).unwrap_err();
        assert_eq!(err.code, "BROKER_ACK_MISMATCH");

        let rejected = json!({"offsets": [
            {"partition": 0, "offset": 10},
            {"partition": null, "offset": null, "error_code": 50003, "error": "leader not available"},
        ]});
        let err = check_offsets(&rejected, 2).unwrap_err();
        assert_eq!(err.code, "BROKER_PRODUCE_ERROR");
        assert!(err.retryable);
        assert!(err.message.contains("leader not available"));

        assert_eq!(
            check_offsets(&json!({}), 1).unwrap_err().code,
            "BROKER_NO_OFFSETS"
        );
    }

    #[test]
    fn config_validation() {
        let config = BrokerConfig::from_value(&json!({
            "proxy_url": "",
            "topic": "t",
            "envelope": {"data": 1},
        }))
        .unwrap();
        let mut errors = Vec::new();
        config.validate(&mut errors);
        assert_eq!(errors.len(), 2);
        assert!(BrokerConfig::from_value(&json!({"topic": "t"})).is_err());
    }
}
