//! Capacity-bounded record stores.
//!
//! A store holds the records of one [`Tier`]. Every operation on a store runs
//! under that store's lock, so insert, eviction, removal and retrieval
//! bookkeeping never interleave on the same tier.

use crate::error::{Error, Result};
use crate::memory::types::*;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Storage backend for a single tier.
pub trait MemoryStore: Send + Sync {
    /// Tier this store holds.
    fn tier(&self) -> Tier;

    /// Maximum number of records.
    fn capacity(&self) -> Result<usize>;

    /// Current number of records.
    fn len(&self) -> Result<usize>;

    /// Whether the store holds no records.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Insert a record, evicting the lowest-ranked record if the store is full.
    ///
    /// Returns the evicted record, if any. Re-inserting an id that is already
    /// present replaces it in place and never evicts.
    fn insert(&self, record: Record) -> Result<Option<Record>>;

    /// Get a record by id.
    fn get(&self, id: &RecordId) -> Result<Record>;

    /// Whether a record is present.
    fn contains(&self, id: &RecordId) -> Result<bool>;

    /// Remove a record. Returns `None` when it was not present.
    fn remove(&self, id: &RecordId) -> Result<Option<Record>>;

    /// Copy out every record matching `filter`, in insertion order.
    fn snapshot(&self, filter: &RecordFilter) -> Result<Vec<Record>>;

    /// Count a retrieval hit for each id still present, atomically.
    ///
    /// Returns the updated records in the order of `ids`; ids that are no
    /// longer present are skipped.
    fn touch(&self, ids: &[RecordId], now: DateTime<Utc>) -> Result<Vec<Record>>;

    /// Hand the records matching `filter` to `select` and count a retrieval
    /// hit on every id it returns, all under a single hold of the lock.
    ///
    /// `select` may lock other stores; callers keep the order short-term
    /// before long-term.
    fn select_and_touch(
        &self,
        filter: &RecordFilter,
        now: DateTime<Utc>,
        select: &mut dyn FnMut(Vec<Record>) -> Result<Vec<RecordId>>,
    ) -> Result<Vec<Record>>;

    /// Insert a record only if it fits without evicting anything.
    ///
    /// Returns `false`, leaving the store unchanged, when the store is full.
    fn try_insert(&self, record: Record) -> Result<bool>;

    /// Remove all of `ids` atomically, or nothing if any of them is missing.
    fn take_all(&self, ids: &[RecordId]) -> Result<Option<Vec<Record>>>;

    /// Replace the whole content and capacity of the store.
    fn replace_all(&self, capacity: usize, records: Vec<Record>) -> Result<()>;
}

impl<'s> dyn MemoryStore + 's {
    /// Lazy listing of the records matching `filter`.
    ///
    /// Nothing is read until the listing is iterated, and every iteration
    /// re-evaluates the filter against the current contents.
    pub fn list(&self, filter: RecordFilter) -> Listing<'_> {
        Listing {
            store: self,
            filter,
        }
    }
}

/// Restartable view over a store.
pub struct Listing<'a> {
    store: &'a dyn MemoryStore,
    filter: RecordFilter,
}

impl<'a> Listing<'a> {
    /// Iterate over the records currently matching the filter.
    pub fn iter(&self) -> Result<std::vec::IntoIter<Record>> {
        Ok(self.store.snapshot(&self.filter)?.into_iter())
    }

    /// Number of records currently matching the filter.
    pub fn count(&self) -> Result<usize> {
        Ok(self.store.snapshot(&self.filter)?.len())
    }

    /// The filter this listing evaluates.
    pub fn filter(&self) -> &RecordFilter {
        &self.filter
    }
}

/// Eviction order: lowest priority, then least recently accessed, then least
/// accessed, then oldest, then first inserted.
pub fn eviction_order(a: &Record, a_seq: u64, b: &Record, b_seq: u64) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.last_accessed_at.cmp(&b.last_accessed_at))
        .then(a.access_count.cmp(&b.access_count))
        .then(a.created_at.cmp(&b.created_at))
        .then(a_seq.cmp(&b_seq))
}

struct Slot {
    seq: u64,
    record: Record,
}

struct StoreState {
    capacity: usize,
    next_seq: u64,
    slots: HashMap<RecordId, Slot>,
}

impl StoreState {
    fn victim(&self) -> Option<RecordId> {
        self.slots
            .values()
            .min_by(|a, b| eviction_order(&a.record, a.seq, &b.record, b.seq))
            .map(|slot| slot.record.id.clone())
    }

    fn push(&mut self, record: Record) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(record.id.clone(), Slot { seq, record });
    }

    fn touch(&mut self, tier: Tier, ids: &[RecordId], now: DateTime<Utc>) -> Vec<Record> {
        let mut touched = Vec::with_capacity(ids.len());
        for id in ids {
            match self.slots.get_mut(id) {
                Some(slot) => {
                    slot.record.record_access(now);
                    touched.push(slot.record.clone());
                }
                None => debug!(tier = %tier, id = %id, "record vanished before access"),
            }
        }
        touched
    }

    fn ordered(&self) -> Vec<&Slot> {
        let mut slots: Vec<&Slot> = self.slots.values().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots
    }
}

/// In-memory store guarded by a mutex.
pub struct InMemoryStore {
    tier: Tier,
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    /// Create an empty store. A capacity of zero is rejected.
    pub fn new(tier: Tier, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::capacity_exhausted(tier, capacity));
        }

        Ok(Self {
            tier,
            state: Mutex::new(StoreState {
                capacity,
                next_seq: 0,
                slots: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock {} store: {}", self.tier, e)))
    }
}

impl MemoryStore for InMemoryStore {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn capacity(&self) -> Result<usize> {
        Ok(self.lock()?.capacity)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.lock()?.slots.len())
    }

    fn insert(&self, record: Record) -> Result<Option<Record>> {
        let mut state = self.lock()?;

        if let Some(slot) = state.slots.get_mut(&record.id) {
            slot.record = record;
            return Ok(None);
        }

        let mut evicted = None;
        if state.slots.len() >= state.capacity {
            if let Some(victim) = state.victim() {
                evicted = state.slots.remove(&victim).map(|slot| slot.record);
            }
        }
        if state.slots.len() >= state.capacity {
            return Err(Error::capacity_exhausted(self.tier, state.capacity));
        }

        if let Some(ref gone) = evicted {
            debug!(
                tier = %self.tier,
                evicted = %gone.id,
                priority = %gone.priority,
                "evicted record to make room"
            );
        }

        state.push(record);
        Ok(evicted)
    }

    fn get(&self, id: &RecordId) -> Result<Record> {
        self.lock()?
            .slots
            .get(id)
            .map(|slot| slot.record.clone())
            .ok_or_else(|| Error::not_found(id))
    }

    fn contains(&self, id: &RecordId) -> Result<bool> {
        Ok(self.lock()?.slots.contains_key(id))
    }

    fn remove(&self, id: &RecordId) -> Result<Option<Record>> {
        Ok(self.lock()?.slots.remove(id).map(|slot| slot.record))
    }

    fn snapshot(&self, filter: &RecordFilter) -> Result<Vec<Record>> {
        let state = self.lock()?;
        Ok(state
            .ordered()
            .into_iter()
            .filter(|slot| filter.matches(&slot.record))
            .map(|slot| slot.record.clone())
            .collect())
    }

    fn touch(&self, ids: &[RecordId], now: DateTime<Utc>) -> Result<Vec<Record>> {
        Ok(self.lock()?.touch(self.tier, ids, now))
    }

    fn select_and_touch(
        &self,
        filter: &RecordFilter,
        now: DateTime<Utc>,
        select: &mut dyn FnMut(Vec<Record>) -> Result<Vec<RecordId>>,
    ) -> Result<Vec<Record>> {
        let mut state = self.lock()?;
        let candidates: Vec<Record> = state
            .ordered()
            .into_iter()
            .filter(|slot| filter.matches(&slot.record))
            .map(|slot| slot.record.clone())
            .collect();

        let chosen = select(candidates)?;
        Ok(state.touch(self.tier, &chosen, now))
    }

    fn try_insert(&self, record: Record) -> Result<bool> {
        let mut state = self.lock()?;
        if let Some(slot) = state.slots.get_mut(&record.id) {
            slot.record = record;
            return Ok(true);
        }
        if state.slots.len() >= state.capacity {
            return Ok(false);
        }
        state.push(record);
        Ok(true)
    }

    fn take_all(&self, ids: &[RecordId]) -> Result<Option<Vec<Record>>> {
        let mut state = self.lock()?;

        if !ids.iter().all(|id| state.slots.contains_key(id)) {
            return Ok(None);
        }

        Ok(Some(
            ids.iter()
                .filter_map(|id| state.slots.remove(id))
                .map(|slot| slot.record)
                .collect(),
        ))
    }

    fn replace_all(&self, capacity: usize, records: Vec<Record>) -> Result<()> {
        if capacity == 0 {
            return Err(Error::capacity_exhausted(self.tier, capacity));
        }
        if records.len() > capacity {
            return Err(Error::InvariantViolation(format!(
                "{} records exceed {} capacity {}",
                records.len(),
                self.tier,
                capacity
            )));
        }
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(&record.id) {
                return Err(Error::InvariantViolation(format!(
                    "duplicate record id {} in {} store",
                    record.id, self.tier
                )));
            }
        }

        let mut state = self.lock()?;
        state.capacity = capacity;
        state.slots.clear();
        state.next_seq = 0;
        for record in records {
            state.push(record);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(base: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        base + Duration::seconds(secs)
    }

    fn record(content: &str, priority: Priority, created: DateTime<Utc>) -> Record {
        Record::new_at(content, Kind::ShortTerm, priority, created)
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let err = InMemoryStore::new(Tier::ShortTerm, 0).err().unwrap();
        assert!(matches!(err, Error::CapacityExhausted { capacity: 0, .. }));
    }

    #[test]
    fn test_oldest_medium_is_evicted_first() {
        let base = Utc::now();
        let store = InMemoryStore::new(Tier::ShortTerm, 2).unwrap();

        let a = record("A", Priority::Medium, at(base, 0));
        let b = record("B", Priority::Medium, at(base, 1));
        let c = record("C", Priority::Medium, at(base, 2));
        let (a_id, b_id, c_id) = (a.id.clone(), b.id.clone(), c.id.clone());

        assert!(store.insert(a).unwrap().is_none());
        assert!(store.insert(b).unwrap().is_none());
        let evicted = store.insert(c).unwrap().unwrap();

        assert_eq!(evicted.id, a_id);
        assert_eq!(store.len().unwrap(), 2);
        assert!(store.contains(&b_id).unwrap());
        assert!(store.contains(&c_id).unwrap());
    }

    #[test]
    fn test_critical_survives_while_lower_priority_exists() {
        let base = Utc::now();
        let store = InMemoryStore::new(Tier::LongTerm, 3).unwrap();

        let critical = record("keep me", Priority::Critical, at(base, 0));
        let critical_id = critical.id.clone();
        store.insert(critical).unwrap();
        store
            .insert(record("newer high", Priority::High, at(base, 10)))
            .unwrap();
        store
            .insert(record("newest low", Priority::Low, at(base, 20)))
            .unwrap();

        for i in 0..5 {
            let evicted = store
                .insert(record("filler", Priority::High, at(base, 30 + i)))
                .unwrap()
                .unwrap();
            assert_ne!(evicted.id, critical_id);
        }
        assert!(store.contains(&critical_id).unwrap());
    }

    #[test]
    fn test_recently_accessed_outlives_idle_peer() {
        let base = Utc::now();
        let store = InMemoryStore::new(Tier::ShortTerm, 2).unwrap();

        let a = record("A", Priority::Medium, at(base, 0));
        let b = record("B", Priority::Medium, at(base, 1));
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        store.insert(a).unwrap();
        store.insert(b).unwrap();

        store.touch(&[a_id.clone()], at(base, 5)).unwrap();
        let evicted = store
            .insert(record("C", Priority::Medium, at(base, 6)))
            .unwrap()
            .unwrap();

        assert_eq!(evicted.id, b_id);
        assert!(store.contains(&a_id).unwrap());
    }

    #[test]
    fn test_reinsert_replaces_without_eviction() {
        let store = InMemoryStore::new(Tier::ShortTerm, 1).unwrap();
        let mut r = Record::new("first", Kind::ShortTerm, Priority::Low);
        store.insert(r.clone()).unwrap();

        r.content = "second".to_string();
        assert!(store.insert(r.clone()).unwrap().is_none());
        assert_eq!(store.get(&r.id).unwrap().content, "second");
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_get_and_remove_missing() {
        let store = InMemoryStore::new(Tier::ShortTerm, 4).unwrap();
        let id = RecordId::new();

        assert!(store.get(&id).unwrap_err().is_not_found());
        assert!(store.remove(&id).unwrap().is_none());
    }

    #[test]
    fn test_listing_is_restartable() {
        let store = InMemoryStore::new(Tier::ShortTerm, 10).unwrap();
        let store: &dyn MemoryStore = &store;

        store
            .insert(Record::new("one", Kind::ShortTerm, Priority::Low).with_tag("x"))
            .unwrap();
        let listing = store.list(RecordFilter::new().tag("x"));
        assert_eq!(listing.count().unwrap(), 1);

        store
            .insert(Record::new("two", Kind::ShortTerm, Priority::Low).with_tag("x"))
            .unwrap();
        store
            .insert(Record::new("three", Kind::ShortTerm, Priority::Low))
            .unwrap();

        let contents: Vec<String> = listing.iter().unwrap().map(|r| r.content).collect();
        assert_eq!(contents, vec!["one", "two"]);
    }

    #[test]
    fn test_touch_skips_missing_records() {
        let store = InMemoryStore::new(Tier::LongTerm, 4).unwrap();
        let r = Record::new("present", Kind::Semantic, Priority::Low);
        let id = r.id.clone();
        store.insert(r).unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let touched = store.touch(&[RecordId::new(), id.clone()], now).unwrap();

        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].access_count, 1);
        assert_eq!(store.get(&id).unwrap().last_accessed_at, now);
    }

    #[test]
    fn test_select_and_touch_counts_only_selected() {
        let base = Utc::now();
        let store = InMemoryStore::new(Tier::ShortTerm, 4).unwrap();
        let keep = record("keep", Priority::Low, base);
        let skip = record("skip", Priority::Low, base);
        let third = record("third", Priority::Low, base).with_tag("misc");
        let (keep_id, skip_id) = (keep.id.clone(), skip.id.clone());
        store.insert(keep).unwrap();
        store.insert(skip).unwrap();
        store.insert(third).unwrap();

        let mut seen = Vec::new();
        let now = at(base, 3);
        let touched = store
            .select_and_touch(&RecordFilter::new(), now, &mut |candidates| {
                seen = candidates.iter().map(|r| r.content.clone()).collect();
                Ok(vec![keep_id.clone()])
            })
            .unwrap();

        assert_eq!(seen, vec!["keep", "skip", "third"]);
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].last_accessed_at, now);
        assert_eq!(store.get(&keep_id).unwrap().access_count, 1);
        assert_eq!(store.get(&skip_id).unwrap().access_count, 0);
    }

    #[test]
    fn test_select_and_touch_propagates_select_error() {
        let store = InMemoryStore::new(Tier::ShortTerm, 4).unwrap();
        let r = record("x", Priority::Low, Utc::now());
        let id = r.id.clone();
        store.insert(r).unwrap();

        let err = store
            .select_and_touch(&RecordFilter::new(), Utc::now(), &mut |_| {
                Err(Error::Internal("boom".to_string()))
            })
            .unwrap_err();

        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(store.get(&id).unwrap().access_count, 0);
    }

    #[test]
    fn test_try_insert_never_evicts() {
        let store = InMemoryStore::new(Tier::LongTerm, 1).unwrap();
        let first = Record::new("first", Kind::Semantic, Priority::Low);
        let first_id = first.id.clone();

        assert!(store.try_insert(first).unwrap());
        assert!(!store
            .try_insert(Record::new("second", Kind::Semantic, Priority::Critical))
            .unwrap());
        assert_eq!(store.len().unwrap(), 1);
        assert!(store.contains(&first_id).unwrap());
    }

    #[test]
    fn test_take_all_is_all_or_nothing() {
        let store = InMemoryStore::new(Tier::ShortTerm, 4).unwrap();
        let a = Record::new("a", Kind::ShortTerm, Priority::Low);
        let b = Record::new("b", Kind::ShortTerm, Priority::Low);
        let ids = vec![a.id.clone(), b.id.clone()];
        store.insert(a).unwrap();
        store.insert(b).unwrap();

        let mut with_missing = ids.clone();
        with_missing.push(RecordId::new());
        assert!(store.take_all(&with_missing).unwrap().is_none());
        assert_eq!(store.len().unwrap(), 2);

        let taken = store.take_all(&ids).unwrap().unwrap();
        assert_eq!(taken.len(), 2);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_replace_all_rejects_bad_input() {
        let store = InMemoryStore::new(Tier::ShortTerm, 4).unwrap();
        store
            .insert(Record::new("kept", Kind::ShortTerm, Priority::Low))
            .unwrap();

        let r = Record::new("dup", Kind::ShortTerm, Priority::Low);
        let err = store.replace_all(4, vec![r.clone(), r]).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));

        let many: Vec<Record> = (0..3)
            .map(|i| Record::new(format!("r{}", i), Kind::ShortTerm, Priority::Low))
            .collect();
        assert!(store.replace_all(2, many.clone()).is_err());
        assert!(store.replace_all(0, Vec::new()).is_err());
        assert_eq!(store.len().unwrap(), 1);

        store.replace_all(3, many).unwrap();
        assert_eq!(store.capacity().unwrap(), 3);
        assert_eq!(store.len().unwrap(), 3);
    }
}
