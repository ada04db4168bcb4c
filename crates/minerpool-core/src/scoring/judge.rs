//! Semantic judge backed by an OpenAI-compatible chat-completions endpoint.
//!
//! Judge failures never escape: [`JudgeStrategy`] turns every [`JudgeError`]
//! into "declined" so the heuristics take over.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::numeric::integer_tokens;
use super::{ScoreRequest, ScoreStrategy};
use crate::config::JudgeConfig;
use crate::error::PoolError;
use crate::metrics::METRICS;
use crate::obs;

/// System prompt sent with every judge call.
pub const JUDGE_RUBRIC: &str = "You are a strict grader. Compare the candidate answer \
     with the ground truth for the given question. Penalize irrelevance and hallucination. \
     Respond with only an integer from 0 to 100.";

/// Why the judge produced no score.
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("judge request failed: {0}")]
    Http(String),

    #[error("judge returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("judge timed out after {0}s")]
    Timeout(u64),

    #[error("judge reply has no choices")]
    EmptyReply,

    #[error("judge reply has no integer in 0..=100: {0:?}")]
    Unparseable(String),
}

/// First integer token in `reply` whose value lies in 0..=100.
///
/// Negative and out-of-range tokens are skipped, so "Score: 85/100" gives 85
/// and "-5, I mean 40" gives 40.
pub fn parse_judge_reply(reply: &str) -> Option<u8> {
    integer_tokens(reply)
        .into_iter()
        .filter(|token| !token.starts_with('-'))
        .filter_map(|token| token.parse::<u32>().ok())
        .find(|value| *value <= 100)
        .and_then(|value| u8::try_from(value).ok())
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// HTTP client for the judge endpoint.
pub struct JudgeClient {
    config: JudgeConfig,
    http_client: reqwest::Client,
}

impl JudgeClient {
    pub fn new(config: JudgeConfig) -> Result<Self, PoolError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("minerpool/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| PoolError::InvalidRequest(format!("judge client: {e}")))?;
        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    /// Ask the judge and return its raw reply text.
    pub async fn ask(&self, request: &ScoreRequest) -> Result<String, JudgeError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: JUDGE_RUBRIC.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!(
                        "Question: {}\nGround truth: {}\nCandidate answer: {}",
                        request.question, request.truth, request.candidate
                    ),
                },
            ],
            temperature: 0.0,
            max_tokens: 8,
        };

        let mut builder = self.http_client.post(&self.config.url).json(&body);
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }

        let send = async {
            let response = builder
                .send()
                .await
                .map_err(|e| JudgeError::Http(e.to_string()))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| JudgeError::Http(e.to_string()))?;
            if !status.is_success() {
                return Err(JudgeError::Status {
                    status: status.as_u16(),
                    body: text.chars().take(512).collect(),
                });
            }
            let parsed: ChatResponse =
                serde_json::from_str(&text).map_err(|e| JudgeError::Http(e.to_string()))?;
            parsed
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or(JudgeError::EmptyReply)
        };

        tokio::time::timeout(self.config.timeout, send)
            .await
            .map_err(|_| JudgeError::Timeout(self.config.timeout.as_secs()))?
    }

    /// Ask the judge and parse its reply into a score.
    pub async fn judge(&self, request: &ScoreRequest) -> Result<u8, JudgeError> {
        let reply = self.ask(request).await?;
        parse_judge_reply(&reply).ok_or(JudgeError::Unparseable(reply))
    }
}

/// Cascade step wrapping [`JudgeClient`].
pub struct JudgeStrategy {
    client: JudgeClient,
}

impl JudgeStrategy {
    pub fn new(client: JudgeClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ScoreStrategy for JudgeStrategy {
    fn name(&self) -> &'static str {
        "judge"
    }

    async fn attempt_score(&self, request: &ScoreRequest) -> Option<u8> {
        match self.client.judge(request).await {
            Ok(score) => {
                METRICS.inc_judge_successes();
                Some(score)
            }
            Err(e) => {
                METRICS.inc_judge_fallbacks();
                obs::emit_judge_fallback(&e);
                None
            }
        }
    }
}
