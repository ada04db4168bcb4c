//! Bridge to the external registry (an append-only topic log).
//!
//! Allocation and termination records are published with
//! [`publish_confirmed`] and must succeed before the caller proceeds. Score
//! batches go through [`publish_detached`], which never blocks or fails the
//! caller.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::RegistryConfig;
use crate::obs;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(String),

    #[error("registry returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("registry rejected message: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        RegistryError::Http(err.to_string())
    }
}

/// Outcome of one publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub status: String,
    /// Registry-issued reference, or a content digest when none was returned.
    pub reference: String,
}

/// One message read back from a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub consensus_at: DateTime<Utc>,
    pub payload: Value,
}

#[async_trait]
pub trait RegistryBridge: Send + Sync {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<Publication, RegistryError>;

    /// Most recent messages of `topic`, newest first, at most `limit`.
    async fn messages(&self, topic: &str, limit: usize) -> Result<Vec<TopicMessage>, RegistryError>;
}

/// Hex SHA-256 over topic and payload.
pub fn payload_digest(topic: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Publish and wait for the registry's answer.
pub async fn publish_confirmed(
    registry: &dyn RegistryBridge,
    topic: &str,
    payload: &Value,
) -> Result<Publication, RegistryError> {
    let publication = registry.publish(topic, payload).await?;
    obs::emit_registry_published(topic, &publication.reference, true);
    Ok(publication)
}

/// Publish in the background; failures are logged and dropped.
pub fn publish_detached(
    registry: Arc<dyn RegistryBridge>,
    topic: String,
    payload: Value,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match registry.publish(&topic, &payload).await {
            Ok(publication) => obs::emit_registry_published(&topic, &publication.reference, false),
            Err(e) => obs::emit_registry_publish_failed(&topic, &e),
        }
    })
}

/// Parse a consensus timestamp of the form `seconds[.nanos]`.
pub fn parse_consensus_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, nanos) = match ts.split_once('.') {
        Some((s, n)) => {
            let digits: String = n.chars().take(9).collect();
            let nanos = format!("{digits:0<9}").parse::<u32>().ok()?;
            (s.parse::<i64>().ok()?, nanos)
        }
        None => (ts.parse::<i64>().ok()?, 0),
    };
    Utc.timestamp_opt(secs, nanos).single()
}

fn parse_topic_messages(value: &Value) -> Vec<TopicMessage> {
    let items = value
        .get("data")
        .and_then(|d| d.get("messages"))
        .or_else(|| value.get("messages"))
        .and_then(Value::as_array);
    let Some(items) = items else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|m| {
            let ts = m
                .get("consensus_timestamp")
                .or_else(|| m.get("consensusTimestamp"))?;
            let ts = match ts {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let consensus_at = parse_consensus_timestamp(&ts)?;
            let payload = match m.get("message")? {
                Value::String(raw) => serde_json::from_str(raw).ok()?,
                Value::Object(_) => m.get("message")?.clone(),
                _ => return None,
            };
            Some(TopicMessage {
                consensus_at,
                payload,
            })
        })
        .collect()
}

/// Registry reached over its HTTP API.
pub struct HttpRegistryBridge {
    config: RegistryConfig,
    http_client: reqwest::Client,
}

impl HttpRegistryBridge {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("minerpool/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, RegistryError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
    }
}

#[async_trait]
impl RegistryBridge for HttpRegistryBridge {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<Publication, RegistryError> {
        let url = format!("{}/api/topic/message", self.config.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&json!({ "topicId": topic, "message": payload.to_string() }))
            .send()
            .await?;
        let body = Self::read_json(response).await?;

        if body.get("success").and_then(Value::as_bool) == Some(false) {
            let reason = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unspecified")
                .to_string();
            return Err(RegistryError::Rejected(reason));
        }

        let status = body
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("SUCCESS")
            .to_string();
        let reference = ["transactionId", "sequenceNumber", "reference"]
            .iter()
            .find_map(|k| {
                body.get(*k)
                    .or_else(|| body.get("data").and_then(|d| d.get(*k)))
            })
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| payload_digest(topic, payload));
        Ok(Publication { status, reference })
    }

    async fn messages(&self, topic: &str, limit: usize) -> Result<Vec<TopicMessage>, RegistryError> {
        let url = format!("{}/api/topic/messages", self.config.base_url);
        let limit = limit.to_string();
        let response = self
            .http_client
            .get(&url)
            .query(&[("topicId", topic), ("limit", limit.as_str()), ("order", "desc")])
            .send()
            .await?;
        let body = Self::read_json(response).await?;
        Ok(parse_topic_messages(&body))
    }
}

#[derive(Debug, Default)]
struct MemoryTopics {
    messages: Vec<(String, TopicMessage)>,
    reject: Option<String>,
}

/// In-memory registry (testing only). References are payload digests.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    inner: Mutex<MemoryTopics>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every publish with `reason` until cleared with `None`.
    pub fn set_reject(&self, reason: Option<&str>) {
        self.inner.lock().unwrap().reject = reason.map(String::from);
    }

    /// Seed a message with an explicit timestamp.
    pub fn insert(&self, topic: &str, consensus_at: DateTime<Utc>, payload: Value) {
        self.inner.lock().unwrap().messages.push((
            topic.to_string(),
            TopicMessage {
                consensus_at,
                payload,
            },
        ));
    }

    /// Payloads published to `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Value> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.payload.clone())
            .collect()
    }
}

#[async_trait]
impl RegistryBridge for MemoryRegistry {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<Publication, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = &inner.reject {
            return Err(RegistryError::Rejected(reason.clone()));
        }
        inner.messages.push((
            topic.to_string(),
            TopicMessage {
                consensus_at: Utc::now(),
                payload: payload.clone(),
            },
        ));
        Ok(Publication {
            status: "SUCCESS".to_string(),
            reference: payload_digest(topic, payload),
        })
    }

    async fn messages(&self, topic: &str, limit: usize) -> Result<Vec<TopicMessage>, RegistryError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .iter()
            .rev()
            .filter(|(t, _)| t == topic)
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect())
    }
}
