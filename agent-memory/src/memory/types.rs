//! Core memory types: Record, Kind, Priority, Tier, RecordFilter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Ordered string-to-string context attached to a record (`user_id`,
/// `session_id`, ...).
pub type Context = BTreeMap<String, String>;

/// Context key used for session grouping and session stamping.
pub const SESSION_KEY: &str = "session_id";

/// Unique identifier for a memory record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id from its string form.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::invalid_argument(format!("invalid record id '{}': {}", s, e)))
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Nature of a memory, orthogonal to the tier that currently holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    ShortTerm,
    LongTerm,
    /// Scratch state for the task at hand
    Working,
    /// Things that happened
    Episodic,
    /// Facts about the world or the user
    Semantic,
    /// How to do things
    Procedural,
}

impl Kind {
    /// All kinds, in declaration order.
    pub const ALL: [Kind; 6] = [
        Kind::ShortTerm,
        Kind::LongTerm,
        Kind::Working,
        Kind::Episodic,
        Kind::Semantic,
        Kind::Procedural,
    ];

    /// Tier a record of this kind is routed to when the caller does not pick one.
    pub fn default_tier(self) -> Tier {
        match self {
            Kind::ShortTerm => Tier::ShortTerm,
            _ => Tier::LongTerm,
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Kind::ShortTerm => write!(f, "short_term"),
            Kind::LongTerm => write!(f, "long_term"),
            Kind::Working => write!(f, "working"),
            Kind::Episodic => write!(f, "episodic"),
            Kind::Semantic => write!(f, "semantic"),
            Kind::Procedural => write!(f, "procedural"),
        }
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "short_term" => Ok(Kind::ShortTerm),
            "long_term" => Ok(Kind::LongTerm),
            "working" => Ok(Kind::Working),
            "episodic" => Ok(Kind::Episodic),
            "semantic" => Ok(Kind::Semantic),
            "procedural" => Ok(Kind::Procedural),
            other => Err(Error::invalid_argument(format!("unknown kind '{}'", other))),
        }
    }
}

/// Priority of a memory. Ordered `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Scoring weight in `[0, 1]`.
    pub fn weight(self) -> f64 {
        match self {
            Priority::Low => 0.25,
            Priority::Medium => 0.5,
            Priority::High => 0.75,
            Priority::Critical => 1.0,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(Error::invalid_argument(format!(
                "unknown priority '{}'",
                other
            ))),
        }
    }
}

/// One of the two stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    ShortTerm,
    LongTerm,
}

impl Tier {
    /// Both tiers in lock order.
    pub const ALL: [Tier; 2] = [Tier::ShortTerm, Tier::LongTerm];
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::ShortTerm => write!(f, "short-term"),
            Tier::LongTerm => write!(f, "long-term"),
        }
    }
}

/// A single memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier, never reused
    pub id: RecordId,
    /// The memory itself
    pub content: String,
    /// Nature of the memory
    pub kind: Kind,
    /// Eviction and scoring weight
    pub priority: Priority,
    /// Exact-match labels
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Key/value context (user_id, session_id, ...)
    #[serde(default)]
    pub context: Context,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// Last retrieval that returned this record
    pub last_accessed_at: DateTime<Utc>,
    /// Number of retrievals that returned this record
    #[serde(default)]
    pub access_count: u64,
    /// Optional caller-supplied embedding
    #[serde(default, with = "embedding_repr", skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Ids this record was consolidated from
    #[serde(default)]
    pub provenance: BTreeSet<RecordId>,
}

impl Record {
    /// Create a new record stamped with the current time.
    pub fn new(content: impl Into<String>, kind: Kind, priority: Priority) -> Self {
        Self::new_at(content, kind, priority, Utc::now())
    }

    /// Create a new record stamped with `now`.
    pub fn new_at(
        content: impl Into<String>,
        kind: Kind,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            content: content.into(),
            kind,
            priority,
            tags: BTreeSet::new(),
            context: Context::new(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            embedding: None,
            provenance: BTreeSet::new(),
        }
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Add several tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Add a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach an embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Record the ids this record was derived from.
    pub fn with_provenance<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = RecordId>,
    {
        self.provenance.extend(ids);
        self
    }

    /// Session this record belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.context.get(SESSION_KEY).map(String::as_str)
    }

    /// Whether this record was produced by consolidation.
    pub fn is_consolidated(&self) -> bool {
        !self.provenance.is_empty()
    }

    /// Count a retrieval hit at `now`.
    ///
    /// `last_accessed_at` never moves before `created_at`.
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed_at = now.max(self.created_at);
    }

    /// Check the per-record invariants.
    pub fn check(&self) -> Result<()> {
        if self.last_accessed_at < self.created_at {
            return Err(Error::InvariantViolation(format!(
                "record {} was last accessed before it was created",
                self.id
            )));
        }
        if self.provenance.contains(&self.id) {
            return Err(Error::InvariantViolation(format!(
                "record {} lists itself in its provenance",
                self.id
            )));
        }
        Ok(())
    }
}

/// Embeddings are written as f64 so that decoding is exact regardless of
/// the JSON float parser.
mod embedding_repr {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<f32>>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        value
            .as_ref()
            .map(|v| v.iter().map(|x| *x as f64).collect::<Vec<f64>>())
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Vec<f32>>, D::Error> {
        let wide = Option::<Vec<f64>>::deserialize(deserializer)?;
        Ok(wide.map(|v| v.into_iter().map(|x| x as f32).collect()))
    }
}

/// Predicate over records used by listing and retrieval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Accepted kinds (None = any)
    pub kinds: Option<Vec<Kind>>,
    /// Tags that must all be present
    pub tags: Vec<String>,
    /// Context entries that must all match
    pub context: Context,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given kinds.
    pub fn kinds(mut self, kinds: Vec<Kind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Require a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Require a context entry.
    pub fn context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Whether the filter accepts everything.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_none() && self.tags.is_empty() && self.context.is_empty()
    }

    /// Evaluate the filter against a record.
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&record.kind) {
                return false;
            }
        }
        if !self.tags.iter().all(|t| record.tags.contains(t)) {
            return false;
        }
        self.context
            .iter()
            .all(|(k, v)| record.context.get(k) == Some(v))
    }
}
