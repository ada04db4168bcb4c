//! Response scoring
//!
//! A candidate answer is scored 0..=100 against a ground truth by an ordered
//! cascade of strategies. Each strategy either produces a score or declines;
//! the first score wins. The lexical strategy never declines, so scoring as a
//! whole cannot fail.
//!
//! Default cascade: semantic judge (when configured), numeric token overlap,
//! lexical word overlap.

mod judge;
mod lexical;
mod numeric;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use judge::{parse_judge_reply, JudgeClient, JudgeError, JudgeStrategy, JUDGE_RUBRIC};
pub use lexical::LexicalOverlap;
pub use numeric::{integer_tokens, NumericOverlap};

use crate::config::JudgeConfig;
use crate::obs;

/// One question/truth/candidate triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub question: String,
    pub truth: String,
    pub candidate: String,
}

impl ScoreRequest {
    pub fn new(question: &str, truth: &str, candidate: &str) -> Self {
        Self {
            question: question.to_string(),
            truth: truth.to_string(),
            candidate: candidate.to_string(),
        }
    }
}

/// One step of the scoring cascade.
#[async_trait]
pub trait ScoreStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// A score in 0..=100, or `None` to defer to the next strategy.
    async fn attempt_score(&self, request: &ScoreRequest) -> Option<u8>;
}

/// A candidate answer attributed to an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub owner_id: String,
    pub candidate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateScore {
    pub owner_id: String,
    pub score: u8,
}

/// Score plus the strategy that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scored {
    pub score: u8,
    pub strategy: &'static str,
}

pub struct ScoringEngine {
    strategies: Vec<Box<dyn ScoreStrategy>>,
}

impl ScoringEngine {
    pub fn new(strategies: Vec<Box<dyn ScoreStrategy>>) -> Self {
        Self { strategies }
    }

    /// Numeric then lexical.
    pub fn heuristic() -> Self {
        Self::new(vec![Box::new(NumericOverlap), Box::new(LexicalOverlap)])
    }

    /// Judge (if configured), then the heuristics.
    pub fn from_config(judge: Option<JudgeConfig>) -> crate::Result<Self> {
        let mut strategies: Vec<Box<dyn ScoreStrategy>> = Vec::new();
        if let Some(config) = judge {
            strategies.push(Box::new(JudgeStrategy::new(JudgeClient::new(config)?)));
        }
        strategies.push(Box::new(NumericOverlap));
        strategies.push(Box::new(LexicalOverlap));
        Ok(Self::new(strategies))
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run the cascade and report which strategy answered.
    pub async fn score_detailed(&self, request: &ScoreRequest) -> Scored {
        for strategy in &self.strategies {
            if let Some(score) = strategy.attempt_score(request).await {
                return Scored {
                    score: score.min(100),
                    strategy: strategy.name(),
                };
            }
            debug!(strategy = strategy.name(), "strategy declined");
        }
        Scored {
            score: 0,
            strategy: "none",
        }
    }

    pub async fn score(&self, question: &str, truth: &str, candidate: &str) -> u8 {
        self.score_detailed(&ScoreRequest::new(question, truth, candidate))
            .await
            .score
    }

    /// Score every candidate independently, in input order.
    ///
    /// Each distinct candidate text is scored once and the result shared, so
    /// identical answers always get identical scores.
    pub async fn score_all(
        &self,
        question: &str,
        truth: &str,
        candidates: &[Candidate],
    ) -> Vec<CandidateScore> {
        let mut slot_of: HashMap<&str, usize> = HashMap::new();
        let mut distinct: Vec<&str> = Vec::new();
        for c in candidates {
            slot_of.entry(c.candidate.as_str()).or_insert_with(|| {
                distinct.push(&c.candidate);
                distinct.len() - 1
            });
        }

        let scored = join_all(distinct.iter().map(|text| {
            let request = ScoreRequest::new(question, truth, text);
            async move { self.score_detailed(&request).await }
        }))
        .await;

        candidates
            .iter()
            .map(|c| {
                let scored = slot_of
                    .get(c.candidate.as_str())
                    .and_then(|&i| scored.get(i))
                    .copied()
                    .unwrap_or(Scored {
                        score: 0,
                        strategy: "none",
                    });
                obs::emit_score(&c.owner_id, scored.score, scored.strategy);
                CandidateScore {
                    owner_id: c.owner_id.clone(),
                    score: scored.score,
                }
            })
            .collect()
    }
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::heuristic()
    }
}
