//! The memory engine: both tiers behind one explicitly constructed handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::memory::codec::{self, MemorySnapshot};
use crate::memory::consolidate::{ConsolidationReport, Consolidator, KeyFn, Summarizer};
use crate::memory::embed::{embed_checked, validate_embedding, Embedder};
use crate::memory::retrieve::{Query, Retriever, ScoredRecord};
use crate::memory::scoring::Scorer;
use crate::memory::store::{InMemoryStore, Listing, MemoryStore};
use crate::memory::types::*;

/// What a caller asks the engine to remember.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryInput {
    pub content: String,
    pub kind: Kind,
    pub priority: Priority,
    pub tags: BTreeSet<String>,
    pub context: Context,
    pub embedding: Option<Vec<f32>>,
}

impl MemoryInput {
    /// A medium-priority short-term memory.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: Kind::ShortTerm,
            priority: Priority::Medium,
            tags: BTreeSet::new(),
            context: Context::new(),
            embedding: None,
        }
    }

    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Statistics about the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub session_id: String,
    pub short_term_len: usize,
    pub short_term_capacity: usize,
    pub long_term_len: usize,
    pub long_term_capacity: usize,
    pub by_kind: BTreeMap<Kind, usize>,
    pub by_priority: BTreeMap<Priority, usize>,
    /// Records produced by consolidation
    pub consolidated: usize,
    /// Evictions since the engine was created
    pub evictions: u64,
}

/// Dual-tier memory engine.
///
/// Share it by reference (`Arc<MemoryEngine>`); every method takes `&self`
/// and each tier is locked independently, short-term before long-term.
pub struct MemoryEngine {
    config: EngineConfig,
    short_term: Arc<dyn MemoryStore>,
    long_term: Arc<dyn MemoryStore>,
    retriever: Retriever,
    consolidator: Consolidator,
    summarizer: Option<Arc<dyn Summarizer>>,
    embedder: Option<Arc<dyn Embedder>>,
    session_id: RwLock<String>,
    evictions: AtomicU64,
}

impl MemoryEngine {
    /// Create an engine with in-memory stores.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let short_term = Arc::new(InMemoryStore::new(
            Tier::ShortTerm,
            config.short_term_capacity,
        )?);
        let long_term = Arc::new(InMemoryStore::new(
            Tier::LongTerm,
            config.long_term_capacity,
        )?);
        Self::with_stores(config, short_term, long_term)
    }

    /// Create an engine over caller-provided stores.
    pub fn with_stores(
        config: EngineConfig,
        short_term: Arc<dyn MemoryStore>,
        long_term: Arc<dyn MemoryStore>,
    ) -> Result<Self> {
        config.validate()?;
        if short_term.tier() != Tier::ShortTerm || long_term.tier() != Tier::LongTerm {
            return Err(Error::Config(
                "stores must be given as (short-term, long-term)".to_string(),
            ));
        }

        Ok(Self {
            retriever: Retriever::new(Scorer::new(config.scoring.clone())),
            consolidator: Consolidator::new(config.consolidation.clone())
                .with_embedding_dimensions(config.embedding_dimensions),
            config,
            short_term,
            long_term,
            summarizer: None,
            embedder: None,
            session_id: RwLock::new(uuid::Uuid::new_v4().to_string()),
            evictions: AtomicU64::new(0),
        })
    }

    /// Use this summarizer for [`consolidate`](Self::consolidate).
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Embed records and queries that arrive without an embedding.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Group consolidation candidates with a custom function.
    pub fn with_grouping_fn(mut self, key_fn: KeyFn) -> Self {
        self.consolidator = self.consolidator.with_key_fn(key_fn);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current session id.
    pub fn session_id(&self) -> Result<String> {
        self.session_id
            .read()
            .map(|s| s.clone())
            .map_err(|e| Error::Internal(format!("Failed to read session id: {}", e)))
    }

    /// Start a new session and return its id.
    pub fn new_session(&self) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.set_session_id(id.clone())?;
        Ok(id)
    }

    fn set_session_id(&self, id: String) -> Result<()> {
        let mut guard = self
            .session_id
            .write()
            .map_err(|e| Error::Internal(format!("Failed to write session id: {}", e)))?;
        *guard = id;
        Ok(())
    }

    fn store(&self, tier: Tier) -> &dyn MemoryStore {
        match tier {
            Tier::ShortTerm => self.short_term.as_ref(),
            Tier::LongTerm => self.long_term.as_ref(),
        }
    }

    fn stores(&self) -> [&dyn MemoryStore; 2] {
        [self.short_term.as_ref(), self.long_term.as_ref()]
    }

    // ==================== Add / Get / Remove ====================

    /// Remember something in the tier its kind routes to.
    pub fn add(&self, input: MemoryInput) -> Result<RecordId> {
        self.add_at(input, Utc::now())
    }

    /// [`add`](Self::add) with an explicit creation time.
    pub fn add_at(&self, input: MemoryInput, now: DateTime<Utc>) -> Result<RecordId> {
        let tier = input.kind.default_tier();
        self.add_to_at(tier, input, now)
    }

    /// Remember something in a specific tier.
    pub fn add_to(&self, tier: Tier, input: MemoryInput) -> Result<RecordId> {
        self.add_to_at(tier, input, Utc::now())
    }

    /// [`add_to`](Self::add_to) with an explicit creation time.
    pub fn add_to_at(&self, tier: Tier, input: MemoryInput, now: DateTime<Utc>) -> Result<RecordId> {
        let mut input = input;
        if input.content.trim().is_empty() {
            return Err(Error::invalid_argument("memory content must not be empty"));
        }

        let dimensions = self.config.embedding_dimensions;
        if let Some(ref embedding) = input.embedding {
            validate_embedding(embedding, dimensions)?;
        } else if let Some(ref embedder) = self.embedder {
            match embed_checked(embedder.as_ref(), &input.content, dimensions) {
                Ok(embedding) => input.embedding = Some(embedding),
                Err(e) => warn!(error = %e, "failed to embed memory, storing without"),
            }
        }

        if self.config.stamp_session && !input.context.contains_key(SESSION_KEY) {
            input
                .context
                .insert(SESSION_KEY.to_string(), self.session_id()?);
        }

        let mut record = Record::new_at(input.content, input.kind, input.priority, now);
        record.tags = input.tags;
        record.context = input.context;
        record.embedding = input.embedding;
        while self.locate(&record.id)?.is_some() {
            record.id = RecordId::new();
        }
        let id = record.id.clone();

        let store = self.store(tier);
        if let Some(evicted) = store.insert(record)? {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            info!(
                tier = %tier,
                evicted = %evicted.id,
                priority = %evicted.priority,
                "memory evicted under capacity pressure"
            );
        }

        if tier == Tier::ShortTerm
            && self
                .config
                .consolidation
                .is_above_high_water(store.len()?, store.capacity()?)
        {
            debug!("short-term tier above high-water mark, consolidation due");
        }

        Ok(id)
    }

    /// Tier currently holding a record.
    pub fn locate(&self, id: &RecordId) -> Result<Option<Tier>> {
        for store in self.stores() {
            if store.contains(id)? {
                return Ok(Some(store.tier()));
            }
        }
        Ok(None)
    }

    /// Look a record up without counting an access.
    pub fn get(&self, id: &RecordId) -> Result<Record> {
        for store in self.stores() {
            match store.get(id) {
                Ok(record) => return Ok(record),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::not_found(id))
    }

    /// Forget a record. Returns `false` when it was not present.
    pub fn remove(&self, id: &RecordId) -> Result<bool> {
        for store in self.stores() {
            if store.remove(id)?.is_some() {
                debug!(tier = %store.tier(), id = %id, "removed record");
                return Ok(true);
            }
        }
        debug!(id = %id, "remove of unknown record");
        Ok(false)
    }

    // ==================== Retrieval ====================

    /// Most relevant records for a query; each one counts an access.
    pub fn retrieve(&self, query: &Query) -> Result<Vec<Record>> {
        self.retrieve_at(query, Utc::now())
    }

    /// [`retrieve`](Self::retrieve) at an explicit time.
    pub fn retrieve_at(&self, query: &Query, now: DateTime<Utc>) -> Result<Vec<Record>> {
        Ok(self
            .retrieve_scored_at(query, now)?
            .into_iter()
            .map(|s| s.record)
            .collect())
    }

    /// Retrieval with scores and holding tiers.
    pub fn retrieve_scored_at(
        &self,
        query: &Query,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredRecord>> {
        query.validate()?;

        let embedded;
        let query = match (&query.embedding, &self.embedder) {
            (None, Some(embedder)) => match embed_checked(
                embedder.as_ref(),
                &query.text,
                self.config.embedding_dimensions,
            ) {
                Ok(embedding) => {
                    embedded = query.clone().with_embedding(embedding);
                    &embedded
                }
                Err(e) => {
                    warn!(error = %e, "failed to embed query, using lexical match");
                    query
                }
            },
            _ => query,
        };

        let results = self.retriever.retrieve(&self.stores(), query, now)?;
        debug!(returned = results.len(), limit = query.limit, "retrieved memories");
        Ok(results)
    }

    /// Newest records across both tiers, without counting accesses.
    pub fn recent(&self, limit: usize) -> Result<Vec<Record>> {
        if limit == 0 {
            return Err(Error::invalid_argument("limit must be at least 1"));
        }
        let mut all = Vec::new();
        for store in self.stores() {
            all.extend(store.snapshot(&RecordFilter::default())?);
        }
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        all.truncate(limit);
        Ok(all)
    }

    /// Lazy listing of one tier.
    pub fn list(&self, tier: Tier, filter: RecordFilter) -> Listing<'_> {
        self.store(tier).list(filter)
    }

    /// Number of records in a tier.
    pub fn len(&self, tier: Tier) -> Result<usize> {
        self.store(tier).len()
    }

    // ==================== Consolidation ====================

    /// Whether short-term occupancy is above the high-water mark.
    pub fn needs_consolidation(&self) -> Result<bool> {
        Ok(self
            .config
            .consolidation
            .is_above_high_water(self.short_term.len()?, self.short_term.capacity()?))
    }

    /// Consolidate with the configured summarizer.
    pub async fn consolidate(&self, deadline: Option<Instant>) -> Result<ConsolidationReport> {
        let summarizer = self
            .summarizer
            .clone()
            .ok_or_else(|| Error::Config("no summarizer configured".to_string()))?;
        self.consolidate_with(summarizer.as_ref(), deadline).await
    }

    /// Consolidate with the given summarizer.
    #[instrument(skip_all)]
    pub async fn consolidate_with(
        &self,
        summarizer: &dyn Summarizer,
        deadline: Option<Instant>,
    ) -> Result<ConsolidationReport> {
        let report = self
            .consolidator
            .run(
                self.short_term.as_ref(),
                self.long_term.as_ref(),
                summarizer,
                self.embedder.as_deref(),
                deadline,
                Utc::now(),
            )
            .await?;

        info!(
            merged = report.groups_merged,
            skipped = report.groups_skipped,
            folded = report.records_folded,
            deadline_reached = report.deadline_reached,
            "consolidation finished"
        );
        Ok(report)
    }

    /// Consolidate only when the short-term tier is above its high-water mark.
    pub async fn consolidate_if_needed(
        &self,
        deadline: Option<Instant>,
    ) -> Result<Option<ConsolidationReport>> {
        if !self.needs_consolidation()? {
            return Ok(None);
        }
        self.consolidate(deadline).await.map(Some)
    }

    // ==================== Persistence ====================

    /// Copy out the full state.
    pub fn snapshot(&self) -> Result<MemorySnapshot> {
        let all = RecordFilter::default();
        Ok(MemorySnapshot {
            session_id: self.session_id()?,
            short_term_capacity: self.short_term.capacity()?,
            long_term_capacity: self.long_term.capacity()?,
            short_term: self.short_term.snapshot(&all)?,
            long_term: self.long_term.snapshot(&all)?,
        })
    }

    /// Replace the full state. Nothing changes unless the snapshot is valid.
    pub fn restore(&self, snapshot: MemorySnapshot) -> Result<()> {
        snapshot.validate()?;
        let previous = self.snapshot()?;

        self.short_term
            .replace_all(snapshot.short_term_capacity, snapshot.short_term)?;
        if let Err(e) = self
            .long_term
            .replace_all(snapshot.long_term_capacity, snapshot.long_term)
        {
            self.short_term
                .replace_all(previous.short_term_capacity, previous.short_term)?;
            return Err(e);
        }
        self.set_session_id(snapshot.session_id)?;
        Ok(())
    }

    /// Encode the full state.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::encode(&self.snapshot()?)
    }

    /// Decode and apply a previously encoded state.
    pub fn load_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.restore(codec::decode(bytes)?)
    }

    /// Write the full state to `path`, replacing it atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;

        info!(path = %path.display(), bytes = bytes.len(), "saved memory state");
        Ok(())
    }

    /// Replace the state with the one saved at `path`.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        self.load_bytes(&bytes)?;
        info!(path = %path.display(), "loaded memory state");
        Ok(())
    }

    // ==================== Stats ====================

    pub fn stats(&self) -> Result<MemoryStats> {
        let snapshot = self.snapshot()?;
        let mut by_kind = BTreeMap::new();
        let mut by_priority = BTreeMap::new();
        let mut consolidated = 0;

        for record in snapshot.short_term.iter().chain(&snapshot.long_term) {
            *by_kind.entry(record.kind).or_insert(0) += 1;
            *by_priority.entry(record.priority).or_insert(0) += 1;
            if record.is_consolidated() {
                consolidated += 1;
            }
        }

        Ok(MemoryStats {
            session_id: snapshot.session_id,
            short_term_len: snapshot.short_term.len(),
            short_term_capacity: snapshot.short_term_capacity,
            long_term_len: snapshot.long_term.len(),
            long_term_capacity: snapshot.long_term_capacity,
            by_kind,
            by_priority,
            consolidated,
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}
