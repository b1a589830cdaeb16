//! Persisted state format for the memory engine.
//!
//! The document is a JSON envelope holding a format version, a SHA-256
//! checksum and the state itself: both capacities, the session id and the
//! records of each tier in insertion order.
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "checksum": "9f2c...",
//!   "state": {
//!     "session_id": "...",
//!     "short_term_capacity": 100,
//!     "long_term_capacity": 1000,
//!     "short_term": [ { "id": "...", "content": "...", ... } ],
//!     "long_term": [ ... ]
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::memory::types::{Record, Tier};

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Full engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub session_id: String,
    pub short_term_capacity: usize,
    pub long_term_capacity: usize,
    pub short_term: Vec<Record>,
    pub long_term: Vec<Record>,
}

impl MemorySnapshot {
    /// Records of one tier.
    pub fn records(&self, tier: Tier) -> &[Record] {
        match tier {
            Tier::ShortTerm => &self.short_term,
            Tier::LongTerm => &self.long_term,
        }
    }

    fn capacity(&self, tier: Tier) -> usize {
        match tier {
            Tier::ShortTerm => self.short_term_capacity,
            Tier::LongTerm => self.long_term_capacity,
        }
    }

    /// Check every store invariant: positive capacities, no tier over
    /// capacity, ids unique across both tiers, sane access timestamps.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for tier in Tier::ALL {
            let capacity = self.capacity(tier);
            let records = self.records(tier);

            if capacity == 0 {
                return Err(Error::InvariantViolation(format!(
                    "{} capacity must be positive",
                    tier
                )));
            }
            if records.len() > capacity {
                return Err(Error::InvariantViolation(format!(
                    "{} holds {} records but capacity is {}",
                    tier,
                    records.len(),
                    capacity
                )));
            }
            for record in records {
                if !seen.insert(&record.id) {
                    return Err(Error::InvariantViolation(format!(
                        "record id {} appears more than once",
                        record.id
                    )));
                }
                record.check()?;
            }
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    format_version: u32,
    checksum: String,
    state: MemorySnapshot,
}

/// SHA-256 over the canonical JSON of the state.
pub fn checksum(state: &MemorySnapshot) -> Result<String> {
    let canonical = serde_json::to_vec(state)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Serialize a snapshot. Equal snapshots give identical bytes.
pub fn encode(state: &MemorySnapshot) -> Result<Vec<u8>> {
    let envelope = Envelope {
        format_version: FORMAT_VERSION,
        checksum: checksum(state)?,
        state: state.clone(),
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

/// Deserialize and validate a snapshot.
///
/// Malformed documents, unknown versions and checksum mismatches are
/// `CorruptState`; well-formed documents that break an invariant are
/// `InvariantViolation`.
pub fn decode(bytes: &[u8]) -> Result<MemorySnapshot> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| Error::CorruptState(format!("malformed memory document: {}", e)))?;

    if envelope.format_version != FORMAT_VERSION {
        return Err(Error::CorruptState(format!(
            "unsupported format version {} (expected {})",
            envelope.format_version, FORMAT_VERSION
        )));
    }

    let expected = checksum(&envelope.state)?;
    if expected != envelope.checksum {
        return Err(Error::CorruptState(format!(
            "checksum mismatch: document says {}, content hashes to {}",
            envelope.checksum, expected
        )));
    }

    envelope.state.validate()?;
    Ok(envelope.state)
}
