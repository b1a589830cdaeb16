//! Consolidation of short-term records into long-term summaries.
//!
//! Short-term records are grouped by a key (by default their session, falling
//! back to a shared tag). Each group large enough is handed to a
//! [`Summarizer`]; the summary becomes one long-term record whose provenance
//! lists the folded ids, and the originals leave the short-term store.
//!
//! A group is applied all-or-nothing: a failed summary, a member that
//! disappeared in the meantime, or a deadline hit mid-group leaves every
//! original where it was.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::memory::embed::{embed_checked, Embedder};
use crate::memory::store::MemoryStore;
use crate::memory::types::*;

/// External summarization collaborator.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize the contents of one group, oldest first.
    async fn summarize(&self, contents: &[String]) -> Result<String>;
}

/// Summarizer backed by a synchronous closure.
pub struct FnSummarizer<F>(F);

impl<F> FnSummarizer<F>
where
    F: Fn(&[String]) -> Result<String> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Summarizer for FnSummarizer<F>
where
    F: Fn(&[String]) -> Result<String> + Send + Sync,
{
    async fn summarize(&self, contents: &[String]) -> Result<String> {
        (self.0)(contents)
    }
}

/// Model-free summarizer: joins the group and shortens long results by
/// keeping the first and last sentence.
#[derive(Debug, Clone)]
pub struct JoinSummarizer {
    separator: String,
    max_length: usize,
}

impl Default for JoinSummarizer {
    fn default() -> Self {
        Self {
            separator: " | ".to_string(),
            max_length: 500,
        }
    }
}

impl JoinSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    fn shorten(&self, text: &str) -> String {
        if text.chars().count() <= self.max_length {
            return text.to_string();
        }
        let sentences: Vec<&str> = text.split(". ").collect();
        match (sentences.first(), sentences.last()) {
            (Some(first), Some(last)) if sentences.len() > 2 => {
                format!("{}. [...] {}", first, last.trim_end_matches('.')) + "."
            }
            _ => text.to_string(),
        }
    }
}

#[async_trait]
impl Summarizer for JoinSummarizer {
    async fn summarize(&self, contents: &[String]) -> Result<String> {
        if contents.is_empty() {
            return Err(Error::invalid_argument("nothing to summarize"));
        }
        let joined = contents.join(&self.separator);
        Ok(format!(
            "Summary of {} memories: {}",
            contents.len(),
            self.shorten(&joined)
        ))
    }
}

/// How short-term records are grouped for consolidation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "by", content = "key")]
pub enum GroupingKey {
    /// Shared `session_id` context value, else the first shared tag
    #[default]
    SessionOrTag,
    /// Shared value of a given context key
    ContextKey(String),
    /// First tag in sorted order
    Tag,
}

impl GroupingKey {
    /// Group key for a record; `None` leaves the record ungrouped.
    pub fn key_for(&self, record: &Record) -> Option<String> {
        match self {
            GroupingKey::SessionOrTag => record
                .session_id()
                .map(|s| format!("session:{}", s))
                .or_else(|| first_tag(record)),
            GroupingKey::ContextKey(key) => {
                record.context.get(key).map(|v| format!("{}:{}", key, v))
            }
            GroupingKey::Tag => first_tag(record),
        }
    }
}

fn first_tag(record: &Record) -> Option<String> {
    record.tags.iter().next().map(|t| format!("tag:{}", t))
}

/// Caller-supplied grouping function, overriding [`GroupingKey`].
pub type KeyFn = Arc<dyn Fn(&Record) -> Option<String> + Send + Sync>;

/// Consolidation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Grouping strategy
    pub grouping: GroupingKey,
    /// Smallest group that gets summarized
    pub min_group_size: usize,
    /// Short-term occupancy above which consolidation is due
    pub high_water_fraction: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            grouping: GroupingKey::SessionOrTag,
            min_group_size: 2,
            high_water_fraction: 0.9,
        }
    }
}

impl ConsolidationConfig {
    pub fn with_grouping(mut self, grouping: GroupingKey) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn with_min_group_size(mut self, size: usize) -> Self {
        self.min_group_size = size;
        self
    }

    pub fn with_high_water_fraction(mut self, fraction: f64) -> Self {
        self.high_water_fraction = fraction;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_group_size == 0 {
            return Err(Error::Config("min_group_size must be at least 1".to_string()));
        }
        if !(self.high_water_fraction > 0.0 && self.high_water_fraction <= 1.0) {
            return Err(Error::Config(format!(
                "high_water_fraction must be in (0, 1], got {}",
                self.high_water_fraction
            )));
        }
        Ok(())
    }

    /// Whether `len` records out of `capacity` is above the high-water mark.
    pub fn is_above_high_water(&self, len: usize, capacity: usize) -> bool {
        len as f64 > self.high_water_fraction * capacity as f64
    }
}

/// A group that was eligible but not merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupFailure {
    pub group: String,
    pub members: usize,
    pub error: String,
}

/// Outcome of one consolidation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    /// Groups folded into a long-term summary
    pub groups_merged: usize,
    /// Eligible groups left in place (summarizer failure, concurrent change)
    pub groups_skipped: usize,
    /// Groups smaller than the minimum size
    pub groups_below_minimum: usize,
    /// Short-term records removed by merging
    pub records_folded: usize,
    /// Ids of the new long-term records
    pub created: Vec<RecordId>,
    /// Why skipped groups were skipped
    pub failures: Vec<GroupFailure>,
    /// Whether the run stopped at its deadline
    pub deadline_reached: bool,
}

impl ConsolidationReport {
    /// Nothing was merged or skipped.
    pub fn is_empty(&self) -> bool {
        self.groups_merged == 0 && self.groups_skipped == 0
    }

    fn skip(&mut self, group: &str, members: usize, error: &Error) {
        self.groups_skipped += 1;
        self.failures.push(GroupFailure {
            group: group.to_string(),
            members,
            error: error.to_string(),
        });
    }
}

/// Folds related short-term records into long-term summaries.
#[derive(Clone, Default)]
pub struct Consolidator {
    config: ConsolidationConfig,
    key_fn: Option<KeyFn>,
    dimensions: Option<usize>,
}

impl std::fmt::Debug for Consolidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consolidator")
            .field("config", &self.config)
            .field("key_fn", &self.key_fn.as_ref().map(|_| "<fn>"))
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl Consolidator {
    pub fn new(config: ConsolidationConfig) -> Self {
        Self {
            config,
            key_fn: None,
            dimensions: None,
        }
    }

    /// Required length of summary embeddings.
    pub fn with_embedding_dimensions(mut self, dimensions: Option<usize>) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Group with a custom function instead of the configured key.
    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = Some(key_fn);
        self
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    fn key_for(&self, record: &Record) -> Option<String> {
        match self.key_fn {
            Some(ref f) => f(record),
            None => self.config.grouping.key_for(record),
        }
    }

    /// Partition the current short-term records into groups, oldest member
    /// first. Groups are keyed and iterated in key order.
    pub fn plan(&self, short_term: &dyn MemoryStore) -> Result<BTreeMap<String, Vec<Record>>> {
        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for record in short_term.snapshot(&RecordFilter::default())? {
            if let Some(key) = self.key_for(&record) {
                groups.entry(key).or_default().push(record);
            }
        }
        for members in groups.values_mut() {
            members.sort_by_key(|r| r.created_at);
        }
        Ok(groups)
    }

    /// Run one consolidation pass.
    ///
    /// The short-term lock is taken for the scan and for each group's
    /// removal, the long-term lock for each insert; neither is held while the
    /// summarizer runs. A group's originals leave short-term only after its
    /// summary is in long-term; if they changed in the meantime the summary
    /// is withdrawn and the group skipped. With a deadline, no group starts after it and a
    /// summarizer call still running at the deadline abandons its group.
    #[instrument(skip_all, fields(deadline = deadline.is_some()))]
    pub async fn run(
        &self,
        short_term: &dyn MemoryStore,
        long_term: &dyn MemoryStore,
        summarizer: &dyn Summarizer,
        embedder: Option<&dyn Embedder>,
        deadline: Option<Instant>,
        now: DateTime<Utc>,
    ) -> Result<ConsolidationReport> {
        let mut report = ConsolidationReport::default();
        let groups = self.plan(short_term)?;
        debug!(groups = groups.len(), "planned consolidation");

        for (key, members) in groups {
            if members.len() < self.config.min_group_size {
                report.groups_below_minimum += 1;
                continue;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                report.deadline_reached = true;
                break;
            }

            let contents: Vec<String> = members.iter().map(|r| r.content.clone()).collect();
            let outcome = match deadline {
                Some(d) => match tokio::time::timeout_at(d, summarizer.summarize(&contents)).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        debug!(group = %key, "deadline hit while summarizing");
                        report.deadline_reached = true;
                        break;
                    }
                },
                None => summarizer.summarize(&contents).await,
            };

            let summary = match outcome {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) => {
                    let err = Error::summarization_failed(&key, "summarizer returned empty text");
                    warn!(group = %key, "{}", err);
                    report.skip(&key, members.len(), &err);
                    continue;
                }
                Err(e) => {
                    let err = Error::summarization_failed(&key, e.to_string());
                    warn!(group = %key, "{}", err);
                    report.skip(&key, members.len(), &err);
                    continue;
                }
            };

            let mut record = summary_record(summary, &members, now);
            if let Some(embedder) = embedder {
                match embed_checked(embedder, &record.content, self.dimensions) {
                    Ok(embedding) => record.embedding = Some(embedding),
                    Err(e) => warn!(group = %key, error = %e, "failed to embed summary"),
                }
            }

            let ids: Vec<RecordId> = members.iter().map(|r| r.id.clone()).collect();
            let summary_id = record.id.clone();
            let evicted = long_term.insert(record)?;
            if let Some(ref gone) = evicted {
                debug!(evicted = %gone.id, "long-term eviction during consolidation");
            }

            if short_term.take_all(&ids)?.is_none() {
                long_term.remove(&summary_id)?;
                if let Some(gone) = evicted {
                    let gone_id = gone.id.clone();
                    if !long_term.try_insert(gone)? {
                        warn!(record = %gone_id, "no room to restore record evicted by a withdrawn summary");
                    }
                }
                let err = Error::Internal("group members changed during consolidation".into());
                debug!(group = %key, "{}", err);
                report.skip(&key, members.len(), &err);
                continue;
            }

            info!(group = %key, folded = ids.len(), summary = %summary_id, "consolidated group");
            report.groups_merged += 1;
            report.records_folded += ids.len();
            report.created.push(summary_id);
        }

        Ok(report)
    }
}

/// Build the long-term record for a group: highest priority, union of tags,
/// context entries every member agrees on, provenance of all members.
fn summary_record(content: String, members: &[Record], now: DateTime<Utc>) -> Record {
    let priority = members
        .iter()
        .map(|r| r.priority)
        .max()
        .unwrap_or_default();

    let mut context = members.first().map(|r| r.context.clone()).unwrap_or_default();
    for member in members.iter().skip(1) {
        context.retain(|k, v| member.context.get(k) == Some(v));
    }

    let mut record = Record::new_at(content, Kind::LongTerm, priority, now)
        .with_tags(members.iter().flat_map(|r| r.tags.iter().cloned()))
        .with_provenance(members.iter().map(|r| r.id.clone()));
    record.context = context;
    record
}
