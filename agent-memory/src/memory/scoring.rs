//! Relevance scoring.
//!
//! The score of a record for a query is a weighted mean of six components,
//! each in `[0, 1]`:
//!
//! - **match**: cosine similarity of embeddings when both sides carry one of
//!   the same length, otherwise the share of query tokens found in the content
//! - **priority**: `Low=0.25`, `Medium=0.5`, `High=0.75`, `Critical=1.0`
//! - **recency**: `exp(-Δt / half_life)` since the last access
//! - **context**: share of query context entries the record matches
//! - **tags**: share of query tokens that equal one of the record's tags
//! - **frequency**: `min(1, access_count / frequency_saturation)`
//!
//! Scoring is pure: the same record, query and `now` always give the same
//! score.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::memory::retrieve::Query;
use crate::memory::types::Record;

/// Weights and decay for the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Weight of lexical/embedding match
    pub match_weight: f64,
    /// Weight of record priority
    pub priority_weight: f64,
    /// Weight of recency of last access
    pub recency_weight: f64,
    /// Weight of context agreement
    pub context_weight: f64,
    /// Weight of exact tag hits
    pub tag_weight: f64,
    /// Weight of access frequency
    pub frequency_weight: f64,
    /// Access count at which the frequency component saturates
    pub frequency_saturation: u64,
    /// Decay constant for recency, in seconds
    pub recency_half_life_secs: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            match_weight: 0.30,
            priority_weight: 0.30,
            recency_weight: 0.15,
            context_weight: 0.10,
            tag_weight: 0.05,
            frequency_weight: 0.10,
            frequency_saturation: 10,
            // One week
            recency_half_life_secs: 7.0 * 24.0 * 60.0 * 60.0,
        }
    }
}

impl ScoringConfig {
    /// Set the match weight.
    pub fn with_match_weight(mut self, weight: f64) -> Self {
        self.match_weight = weight;
        self
    }

    /// Set the priority weight.
    pub fn with_priority_weight(mut self, weight: f64) -> Self {
        self.priority_weight = weight;
        self
    }

    /// Set the recency weight.
    pub fn with_recency_weight(mut self, weight: f64) -> Self {
        self.recency_weight = weight;
        self
    }

    /// Set the context weight.
    pub fn with_context_weight(mut self, weight: f64) -> Self {
        self.context_weight = weight;
        self
    }

    /// Set the tag weight.
    pub fn with_tag_weight(mut self, weight: f64) -> Self {
        self.tag_weight = weight;
        self
    }

    /// Set the access frequency weight.
    pub fn with_frequency_weight(mut self, weight: f64) -> Self {
        self.frequency_weight = weight;
        self
    }

    /// Set the recency half-life.
    pub fn with_half_life(mut self, half_life: chrono::Duration) -> Self {
        self.recency_half_life_secs = half_life.num_milliseconds() as f64 / 1000.0;
        self
    }

    fn weights(&self) -> [f64; 6] {
        [
            self.match_weight,
            self.priority_weight,
            self.recency_weight,
            self.context_weight,
            self.tag_weight,
            self.frequency_weight,
        ]
    }

    fn weight_sum(&self) -> f64 {
        self.weights().iter().sum()
    }

    /// Check that the weights are usable.
    pub fn validate(&self) -> Result<()> {
        if self.weights().iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::Config(
                "scoring weights must be finite and non-negative".to_string(),
            ));
        }
        if self.weight_sum() <= 0.0 {
            return Err(Error::Config(
                "at least one scoring weight must be positive".to_string(),
            ));
        }
        if self.frequency_saturation == 0 {
            return Err(Error::Config(
                "frequency_saturation must be at least 1".to_string(),
            ));
        }
        if !self.recency_half_life_secs.is_finite() || self.recency_half_life_secs <= 0.0 {
            return Err(Error::Config(
                "recency half-life must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-component view of a score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub relevance: f64,
    pub priority: f64,
    pub recency: f64,
    pub context: f64,
    pub tags: f64,
    pub frequency: f64,
    /// Weighted mean of the components
    pub total: f64,
}

/// Pure relevance scorer.
#[derive(Debug, Clone, Default)]
pub struct Scorer {
    config: ScoringConfig,
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Tokenize a query once for scoring many records.
    pub fn prepare<'q>(&'q self, query: &'q Query) -> PreparedQuery<'q> {
        PreparedQuery {
            scorer: self,
            query,
            tokens: tokenize(&query.text),
        }
    }

    /// Score a single record.
    pub fn score(&self, record: &Record, query: &Query, now: DateTime<Utc>) -> f64 {
        self.prepare(query).score(record, now)
    }
}

/// A query with its tokens precomputed.
pub struct PreparedQuery<'q> {
    scorer: &'q Scorer,
    query: &'q Query,
    tokens: BTreeSet<String>,
}

impl<'q> PreparedQuery<'q> {
    pub fn score(&self, record: &Record, now: DateTime<Utc>) -> f64 {
        self.breakdown(record, now).total
    }

    pub fn breakdown(&self, record: &Record, now: DateTime<Utc>) -> ScoreBreakdown {
        let config = &self.scorer.config;

        let relevance = match (&self.query.embedding, &record.embedding) {
            (Some(q), Some(r)) => match cosine_similarity(q, r) {
                Some(sim) => sim.max(0.0),
                None => token_overlap(&self.tokens, &record.content),
            },
            _ => token_overlap(&self.tokens, &record.content),
        };
        let priority = record.priority.weight();
        let recency = recency(record.last_accessed_at, now, config.recency_half_life_secs);
        let context = context_match(self.query, record);
        let tags = tag_match(&self.tokens, record);
        let frequency = frequency(record.access_count, config.frequency_saturation);

        let weighted = config.match_weight * relevance
            + config.priority_weight * priority
            + config.recency_weight * recency
            + config.context_weight * context
            + config.tag_weight * tags
            + config.frequency_weight * frequency;
        let sum = config.weight_sum();
        let total = if sum > 0.0 {
            (weighted / sum).clamp(0.0, 1.0)
        } else {
            0.0
        };

        ScoreBreakdown {
            relevance,
            priority,
            recency,
            context,
            tags,
            frequency,
            total,
        }
    }
}

/// Lowercase whitespace tokens with surrounding punctuation stripped.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Share of query tokens present in `content`.
pub fn token_overlap(query_tokens: &BTreeSet<String>, content: &str) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let content_tokens = tokenize(content);
    let hits = query_tokens
        .iter()
        .filter(|t| content_tokens.contains(*t))
        .count();
    hits as f64 / query_tokens.len() as f64
}

/// Cosine similarity, or `None` when the vectors cannot be compared.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }

    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        Some(0.0)
    } else {
        Some((dot / (mag_a * mag_b)).clamp(-1.0, 1.0))
    }
}

fn recency(last_accessed: DateTime<Utc>, now: DateTime<Utc>, half_life_secs: f64) -> f64 {
    let elapsed = (now - last_accessed).num_milliseconds().max(0) as f64 / 1000.0;
    (-elapsed / half_life_secs).exp()
}

fn frequency(access_count: u64, saturation: u64) -> f64 {
    (access_count as f64 / saturation.max(1) as f64).min(1.0)
}

fn context_match(query: &Query, record: &Record) -> f64 {
    match query.context {
        Some(ref ctx) if !ctx.is_empty() => {
            let hits = ctx
                .iter()
                .filter(|(k, v)| record.context.get(*k) == Some(*v))
                .count();
            hits as f64 / ctx.len() as f64
        }
        _ => 0.0,
    }
}

fn tag_match(query_tokens: &BTreeSet<String>, record: &Record) -> f64 {
    if query_tokens.is_empty() || record.tags.is_empty() {
        return 0.0;
    }
    let tags: BTreeSet<String> = record.tags.iter().map(|t| t.to_lowercase()).collect();
    let hits = query_tokens.iter().filter(|t| tags.contains(*t)).count();
    hits as f64 / query_tokens.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{Kind, Priority};
    use chrono::Duration;

    #[test]
    fn test_tokenize() {
        let tokens = tokenize("Hello, my name is  ALICE!");
        assert!(tokens.contains("hello"));
        assert!(tokens.contains("alice"));
        assert_eq!(tokens.len(), 5);
        assert!(tokenize("  ... ").is_empty());
    }

    #[test]
    fn test_token_overlap() {
        let q = tokenize("Alice Python");
        assert_eq!(token_overlap(&q, "User Alice prefers Python programming"), 1.0);
        assert_eq!(token_overlap(&q, "alice likes rust"), 0.5);
        assert_eq!(token_overlap(&q, "nothing here"), 0.0);
        assert_eq!(token_overlap(&BTreeSet::new(), "anything"), 0.0);
    }

    #[test]
    fn test_cosine_similarity() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), Some(1.0));
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), Some(0.0));
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), Some(-1.0));
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), Some(0.0));
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[], &[]), None);
    }

    #[test]
    fn test_score_is_bounded_and_deterministic() {
        let now = Utc::now();
        let scorer = Scorer::default();
        let record = Record::new_at("User Alice prefers Python", Kind::Semantic, Priority::Critical, now)
            .with_tag("python")
            .with_context("user_id", "alice");
        let query = Query::new("alice python", 5).with_context("user_id", "alice");

        let first = scorer.score(&record, &query, now);
        let second = scorer.score(&record, &query, now);
        assert_eq!(first, second);
        assert!((0.0..=1.0).contains(&first));
        // every component maxes out except tags (one of two tokens)
        let breakdown = scorer.prepare(&query).breakdown(&record, now);
        assert_eq!(breakdown.relevance, 1.0);
        assert_eq!(breakdown.context, 1.0);
        assert_eq!(breakdown.recency, 1.0);
        assert_eq!(breakdown.tags, 0.5);
    }

    #[test]
    fn test_embedding_takes_precedence_over_tokens() {
        let now = Utc::now();
        let scorer = Scorer::default();
        let record = Record::new_at("completely unrelated words", Kind::Semantic, Priority::Low, now)
            .with_embedding(vec![0.0, 1.0]);

        let lexical = Query::new("python", 1);
        let semantic = Query::new("python", 1).with_embedding(vec![0.0, 2.0]);

        let prepared = scorer.prepare(&lexical);
        assert_eq!(prepared.breakdown(&record, now).relevance, 0.0);
        let prepared = scorer.prepare(&semantic);
        assert_eq!(prepared.breakdown(&record, now).relevance, 1.0);

        // mismatched dimensions fall back to lexical
        let mismatched = Query::new("unrelated", 1).with_embedding(vec![1.0, 0.0, 0.0]);
        let prepared = scorer.prepare(&mismatched);
        assert_eq!(prepared.breakdown(&record, now).relevance, 1.0);
    }

    #[test]
    fn test_recency_decays() {
        let now = Utc::now();
        let config = ScoringConfig::default().with_half_life(Duration::hours(1));
        let scorer = Scorer::new(config);
        let fresh = Record::new_at("x", Kind::Episodic, Priority::Low, now);
        let stale = Record::new_at("x", Kind::Episodic, Priority::Low, now - Duration::hours(3));

        let query = Query::new("x", 1);
        let prepared = scorer.prepare(&query);
        let fresh_recency = prepared.breakdown(&fresh, now).recency;
        let stale_recency = prepared.breakdown(&stale, now).recency;

        assert_eq!(fresh_recency, 1.0);
        assert!((stale_recency - (-3.0f64).exp()).abs() < 1e-9);
        assert!(prepared.score(&fresh, now) > prepared.score(&stale, now));
    }

    #[test]
    fn test_context_without_query_context_is_zero() {
        let record = Record::new("x", Kind::Working, Priority::Low).with_context("k", "v");
        assert_eq!(context_match(&Query::new("x", 1), &record), 0.0);

        let query = Query::new("x", 1).with_context("k", "v").with_context("other", "y");
        assert_eq!(context_match(&query, &record), 0.5);
    }

    #[test]
    fn test_config_validation() {
        assert!(ScoringConfig::default().validate().is_ok());
        assert!(ScoringConfig::default()
            .with_match_weight(-1.0)
            .validate()
            .is_err());

        let zero = ScoringConfig::default()
            .with_match_weight(0.0)
            .with_priority_weight(0.0)
            .with_recency_weight(0.0)
            .with_context_weight(0.0)
            .with_tag_weight(0.0)
            .with_frequency_weight(0.0);
        assert!(zero.validate().is_err());

        let mut no_saturation = ScoringConfig::default();
        no_saturation.frequency_saturation = 0;
        assert!(no_saturation.validate().is_err());

        let mut bad_decay = ScoringConfig::default();
        bad_decay.recency_half_life_secs = 0.0;
        assert!(bad_decay.validate().is_err());
    }

    #[test]
    fn test_frequency_saturates() {
        assert_eq!(frequency(0, 10), 0.0);
        assert_eq!(frequency(5, 10), 0.5);
        assert_eq!(frequency(10, 10), 1.0);
        assert_eq!(frequency(250, 10), 1.0);
    }

    #[test]
    fn test_frequently_used_record_ranks_higher() {
        let now = Utc::now();
        let scorer = Scorer::default();
        let idle = Record::new_at("deploy notes", Kind::Procedural, Priority::Medium, now);
        let mut busy = idle.clone();
        busy.id = crate::memory::types::RecordId::new();
        for _ in 0..4 {
            busy.record_access(now);
        }

        let query = Query::new("deploy", 2);
        let prepared = scorer.prepare(&query);
        assert_eq!(prepared.breakdown(&busy, now).frequency, 0.4);
        assert!(prepared.score(&busy, now) > prepared.score(&idle, now));

        let indifferent = Scorer::new(ScoringConfig::default().with_frequency_weight(0.0));
        assert_eq!(
            indifferent.score(&busy, &query, now),
            indifferent.score(&idle, &query, now)
        );
    }
}
