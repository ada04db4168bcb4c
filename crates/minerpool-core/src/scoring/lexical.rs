use std::collections::HashSet;

use async_trait::async_trait;

use super::{ScoreRequest, ScoreStrategy};

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// Share of the truth's distinct words found in the candidate.
///
/// Lower-cased, whitespace-split, punctuation kept. Never declines; an empty
/// truth scores 0.
pub struct LexicalOverlap;

#[async_trait]
impl ScoreStrategy for LexicalOverlap {
    fn name(&self) -> &'static str {
        "lexical"
    }

    async fn attempt_score(&self, request: &ScoreRequest) -> Option<u8> {
        let truth = word_set(&request.truth);
        if truth.is_empty() {
            return Some(0);
        }
        let candidate = word_set(&request.candidate);
        let shared = truth.intersection(&candidate).count();
        Some(u8::try_from(100 * shared / truth.len()).unwrap_or(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn score(truth: &str, candidate: &str) -> Option<u8> {
        LexicalOverlap
            .attempt_score(&ScoreRequest::new("q", truth, candidate))
            .await
    }

    #[tokio::test]
    async fn reordered_superset_scores_full() {
        assert_eq!(
            score("paris is the capital", "the capital of france is paris").await,
            Some(100)
        );
    }

    #[tokio::test]
    async fn case_insensitive() {
        assert_eq!(score("Paris", "PARIS").await, Some(100));
    }

    #[tokio::test]
    async fn empty_truth_is_zero() {
        assert_eq!(score("", "anything at all").await, Some(0));
        assert_eq!(score("   ", "").await, Some(0));
    }

    #[tokio::test]
    async fn punctuation_is_part_of_the_word() {
        assert_eq!(score("paris.", "paris").await, Some(0));
    }

    #[tokio::test]
    async fn partial_overlap_floors() {
        assert_eq!(score("a b c", "a").await, Some(33));
        assert_eq!(score("a a b", "a").await, Some(50));
    }
}
