//! Dual-tier agent memory.
//!
//! Records live in one of two capacity-bounded tiers:
//!
//! - **Short-term**: recent, per-session material, evicted quickly
//! - **Long-term**: durable knowledge and consolidation summaries
//!
//! When a tier is full, inserting evicts the lowest-priority record, with
//! the least recently accessed breaking ties. Retrieval ranks records from
//! both tiers by a weighted relevance score. Consolidation folds groups of
//! related short-term records into long-term summaries.
//!
//! ## Example
//!
//! ```rust,ignore
//! use agent_memory::memory::{MemoryEngine, MemoryInput, Kind, Priority, Query};
//! use agent_memory::EngineConfig;
//!
//! let engine = MemoryEngine::new(EngineConfig::default())?;
//!
//! engine.add(
//!     MemoryInput::new("User Alice prefers Python programming")
//!         .with_kind(Kind::Semantic)
//!         .with_priority(Priority::High),
//! )?;
//!
//! let hits = engine.retrieve(&Query::new("Alice Python", 5))?;
//! engine.save("memory.json")?;
//! ```

pub mod codec;
mod consolidate;
mod embed;
mod engine;
mod retrieve;
mod scoring;
mod store;
mod types;

#[cfg(test)]
mod proptest;

pub use codec::{MemorySnapshot, FORMAT_VERSION};
pub use consolidate::{
    ConsolidationConfig, ConsolidationReport, Consolidator, FnSummarizer, GroupFailure,
    GroupingKey, JoinSummarizer, KeyFn, Summarizer,
};
pub use embed::{Embedder, FnEmbedder};
pub use engine::{MemoryEngine, MemoryInput, MemoryStats};
pub use retrieve::{ranking_order, Query, Retriever, ScoredRecord};
pub use scoring::{
    cosine_similarity, token_overlap, tokenize, PreparedQuery, ScoreBreakdown, Scorer,
    ScoringConfig,
};
pub use store::{eviction_order, InMemoryStore, Listing, MemoryStore};
pub use types::{Context, Kind, Priority, Record, RecordFilter, RecordId, Tier, SESSION_KEY};
