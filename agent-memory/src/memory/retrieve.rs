//! Relevance-ranked retrieval across tiers.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::scoring::Scorer;
use crate::memory::store::MemoryStore;
use crate::memory::types::*;

/// A retrieval request.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Free text matched against record content and tags
    pub text: String,
    /// Context used for boosting (not filtering)
    pub context: Option<Context>,
    /// Hard filter on candidates
    pub filter: RecordFilter,
    /// Tiers to search
    pub tiers: Vec<Tier>,
    /// Optional query embedding
    pub embedding: Option<Vec<f32>>,
    /// Maximum number of results
    pub limit: usize,
}

impl Query {
    /// Query both tiers for at most `limit` records.
    pub fn new(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            context: None,
            filter: RecordFilter::default(),
            tiers: Tier::ALL.to_vec(),
            embedding: None,
            limit,
        }
    }

    /// Add a boosting context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context
            .get_or_insert_with(Context::new)
            .insert(key.into(), value.into());
        self
    }

    /// Replace the boosting context.
    pub fn with_context_map(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Only consider records of these kinds.
    pub fn with_kinds(mut self, kinds: Vec<Kind>) -> Self {
        self.filter.kinds = Some(kinds);
        self
    }

    /// Only consider records carrying this tag.
    pub fn with_required_tag(mut self, tag: impl Into<String>) -> Self {
        self.filter.tags.push(tag.into());
        self
    }

    /// Replace the candidate filter.
    pub fn with_filter(mut self, filter: RecordFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Search a single tier.
    pub fn only(mut self, tier: Tier) -> Self {
        self.tiers = vec![tier];
        self
    }

    /// Attach a query embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Reject queries that cannot be served.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(Error::invalid_argument("limit must be at least 1"));
        }
        if self.tiers.is_empty() {
            return Err(Error::invalid_argument("query must search at least one tier"));
        }
        if let Some(ref e) = self.embedding {
            if e.iter().any(|x| !x.is_finite()) {
                return Err(Error::invalid_argument("query embedding must be finite"));
            }
        }
        Ok(())
    }
}

/// A retrieved record and the score it was ranked by.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: Record,
    pub score: f64,
    pub tier: Tier,
}

/// Result order: score desc, priority desc, newer first, then id.
pub fn ranking_order(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(b.record.priority.cmp(&a.record.priority))
        .then(b.record.created_at.cmp(&a.record.created_at))
        .then(a.record.id.cmp(&b.record.id))
}

/// Scores candidates from one or more stores and returns the top results.
#[derive(Debug, Clone, Default)]
pub struct Retriever {
    scorer: Scorer,
}

impl Retriever {
    pub fn new(scorer: Scorer) -> Self {
        Self { scorer }
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    /// Rank candidates without touching access bookkeeping.
    pub fn rank(
        &self,
        stores: &[&dyn MemoryStore],
        query: &Query,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredRecord>> {
        query.validate()?;

        let mut held = Vec::new();
        for store in searched(stores, query) {
            held.push((store.tier(), store.snapshot(&query.filter)?));
        }
        Ok(self.rank_held(held, query, now))
    }

    fn rank_held(
        &self,
        held: Vec<(Tier, Vec<Record>)>,
        query: &Query,
        now: DateTime<Utc>,
    ) -> Vec<ScoredRecord> {
        let prepared = self.scorer.prepare(query);
        let mut candidates: Vec<ScoredRecord> = held
            .into_iter()
            .flat_map(|(tier, records)| {
                records.into_iter().map(move |record| (tier, record))
            })
            .map(|(tier, record)| ScoredRecord {
                score: prepared.score(&record, now),
                record,
                tier,
            })
            .collect();

        candidates.sort_by(ranking_order);
        candidates.truncate(query.limit);
        candidates
    }

    /// Rank candidates and count an access on every returned record.
    ///
    /// The searched stores are locked short-term first and stay locked from
    /// the scan until bookkeeping is done, so every ranked record is still
    /// present when its access is counted.
    pub fn retrieve(
        &self,
        stores: &[&dyn MemoryStore],
        query: &Query,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredRecord>> {
        query.validate()?;

        let locked = searched(stores, query);
        let mut held = Vec::with_capacity(locked.len());
        let mut ranked = Vec::new();
        self.retrieve_locked(&locked, query, now, &mut held, &mut ranked)?;

        debug!(candidates = ranked.len(), limit = query.limit, "ranked under lock");
        Ok(ranked)
    }

    fn retrieve_locked(
        &self,
        stores: &[&dyn MemoryStore],
        query: &Query,
        now: DateTime<Utc>,
        held: &mut Vec<(Tier, Vec<Record>)>,
        ranked: &mut Vec<ScoredRecord>,
    ) -> Result<()> {
        let Some((store, rest)) = stores.split_first() else {
            *ranked = self.rank_held(std::mem::take(held), query, now);
            return Ok(());
        };

        let tier = store.tier();
        let touched = store.select_and_touch(&query.filter, now, &mut |records| {
            held.push((tier, records));
            self.retrieve_locked(rest, query, now, held, ranked)?;
            Ok(ranked
                .iter()
                .filter(|s| s.tier == tier)
                .map(|s| s.record.id.clone())
                .collect())
        })?;

        let mut touched: HashMap<RecordId, Record> =
            touched.into_iter().map(|r| (r.id.clone(), r)).collect();
        for scored in ranked.iter_mut().filter(|s| s.tier == tier) {
            if let Some(record) = touched.remove(&scored.record.id) {
                scored.record = record;
            }
        }
        Ok(())
    }
}

/// Stores the query searches, in lock order.
fn searched<'a>(stores: &[&'a dyn MemoryStore], query: &Query) -> Vec<&'a dyn MemoryStore> {
    let mut selected: Vec<&'a dyn MemoryStore> = stores
        .iter()
        .copied()
        .filter(|s| query.tiers.contains(&s.tier()))
        .collect();
    selected.sort_by_key(|s| s.tier());
    selected
}
