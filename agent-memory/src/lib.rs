//! # agent-memory
//!
//! A dual-tier memory engine for conversational agents.
//!
//! ## Core Components
//!
//! - **Stores**: capacity-bounded short-term and long-term tiers with
//!   priority-aware eviction
//! - **Scoring**: weighted relevance from content match, priority, recency,
//!   context, tags and access frequency
//! - **Retrieval**: ranked queries across tiers with access bookkeeping
//! - **Consolidation**: folding related short-term records into long-term
//!   summaries through a pluggable [`Summarizer`]
//! - **Persistence**: checksummed, versioned JSON snapshots
//!
//! ## Example
//!
//! ```rust,ignore
//! use agent_memory::{EngineConfig, JoinSummarizer, MemoryEngine, MemoryInput, Query};
//! use std::sync::Arc;
//!
//! let engine = MemoryEngine::new(EngineConfig::default())?
//!     .with_summarizer(Arc::new(JoinSummarizer::new()));
//!
//! engine.add(MemoryInput::new("User said: hello").with_context("session_id", "s1"))?;
//! engine.add(MemoryInput::new("User asked about Python").with_context("session_id", "s1"))?;
//!
//! let hits = engine.retrieve(&Query::new("python", 3))?;
//! let report = engine.consolidate_if_needed(None).await?;
//! ```

pub mod config;
pub mod error;
pub mod memory;

// Re-exports for convenience
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use memory::{
    ConsolidationConfig, ConsolidationReport, Embedder, GroupingKey, JoinSummarizer, Kind,
    MemoryEngine, MemoryInput, MemorySnapshot, MemoryStats, MemoryStore, Priority, Query,
    Record, RecordFilter, RecordId, ScoredRecord, ScoringConfig, Summarizer, Tier,
};
