//! Per-owner score averages read back from the score topic.
//!
//! Feeds periodic reward distribution; never consulted for allocation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::registry::{RegistryBridge, RegistryError, TopicMessage};

/// Message `type`s that carry score batches.
const SCORE_TYPES: [&str; 2] = ["scores", "final_scores"];

fn owner_of(entry: &Value) -> Option<&str> {
    ["walletId", "wallet", "address", "ownerId"]
        .iter()
        .find_map(|k| entry.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Mean score per owner over messages at or after `since`, rounded half
/// away from zero. Malformed messages and entries are skipped.
pub fn owner_averages(messages: &[TopicMessage], since: DateTime<Utc>) -> BTreeMap<String, u8> {
    let mut totals: BTreeMap<String, (f64, u32)> = BTreeMap::new();
    for message in messages.iter().filter(|m| m.consensus_at >= since) {
        let payload = &message.payload;
        let kind = payload.get("type").and_then(Value::as_str);
        if !kind.is_some_and(|k| SCORE_TYPES.contains(&k)) {
            continue;
        }
        let Some(entries) = payload.get("scores").and_then(Value::as_array) else {
            continue;
        };
        for entry in entries {
            let (Some(owner), Some(score)) = (owner_of(entry), entry.get("score").and_then(Value::as_f64)) else {
                continue;
            };
            let slot = totals.entry(owner.to_string()).or_insert((0.0, 0));
            slot.0 += score.trunc();
            slot.1 += 1;
        }
    }

    totals
        .into_iter()
        .filter(|(_, (_, n))| *n > 0)
        .map(|(owner, (sum, n))| {
            let mean = (sum / f64::from(n)).round().clamp(0.0, 100.0);
            (owner, mean as u8)
        })
        .collect()
}

/// Reads a score topic and averages it.
pub struct Scoreboard {
    registry: Arc<dyn RegistryBridge>,
    topic: String,
    limit: usize,
}

impl Scoreboard {
    pub fn new(registry: Arc<dyn RegistryBridge>, topic: &str) -> Self {
        Self {
            registry,
            topic: topic.to_string(),
            limit: 500,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Averages over the trailing `window`.
    pub async fn averages(&self, window: Duration) -> Result<BTreeMap<String, u8>, RegistryError> {
        let messages = self.registry.messages(&self.topic, self.limit).await?;
        Ok(owner_averages(&messages, Utc::now() - window))
    }
}
