use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::{ScoreRequest, ScoreStrategy};

static INTEGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+").expect("integer pattern is a valid regex"));

/// Integer substrings of `text`, leading minus included, in order.
pub fn integer_tokens(text: &str) -> Vec<&str> {
    INTEGER.find_iter(text).map(|m| m.as_str()).collect()
}

/// Share of the truth's integers that also appear in the candidate.
///
/// Declines when the truth has no integers. Tokens compare as strings, so
/// `7` and `07` differ, and a truth repeating a number needs it only once in
/// the candidate for every repeat to count.
pub struct NumericOverlap;

#[async_trait]
impl ScoreStrategy for NumericOverlap {
    fn name(&self) -> &'static str {
        "numeric"
    }

    async fn attempt_score(&self, request: &ScoreRequest) -> Option<u8> {
        let truth = integer_tokens(&request.truth);
        if truth.is_empty() {
            return None;
        }
        let candidate: HashSet<&str> = integer_tokens(&request.candidate).into_iter().collect();
        let hits = truth.iter().filter(|t| candidate.contains(*t)).count();
        u8::try_from(100 * hits / truth.len()).ok()
    }
}
