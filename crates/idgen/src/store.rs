//! Persistence of identifier source definitions and sequence counters.
//!
//! [`SourceStore`] is the durable-store seam: the allocator and service only
//! talk to it through this trait and expect read-your-writes consistency.
//! [`MemoryStore`] is the in-process implementation used by the server and
//! the tests.

use crate::{Error, IdentifierSource, IdentifierType, Result, SourceId};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

/// Point lookup of a source definition.
pub trait SourceLookup {
    fn get_identifier_source(&self, id: SourceId) -> Result<Option<IdentifierSource>>;
}

/// Check run by [`SourceStore::save_identifier_source_checked`] against the
/// definitions as they are at the moment of the write.
pub type SaveCheck<'a> = &'a (dyn Fn(&IdentifierSource, &dyn SourceLookup) -> Result<()> + Sync);

/// CRUD over source definitions plus the atomic sequence counter.
pub trait SourceStore: SourceLookup + Send + Sync {
    /// Lists sources ordered by id, skipping retired ones unless asked.
    fn get_all_identifier_sources(&self, include_retired: bool) -> Result<Vec<IdentifierSource>>;

    /// Groups sources by identifier type. Types without sources are absent.
    fn get_identifier_sources_by_type(
        &self,
        include_retired: bool,
    ) -> Result<BTreeMap<IdentifierType, Vec<IdentifierSource>>> {
        let mut by_type: BTreeMap<IdentifierType, Vec<IdentifierSource>> = BTreeMap::new();
        for source in self.get_all_identifier_sources(include_retired)? {
            by_type
                .entry(source.identifier_type.clone())
                .or_default()
                .push(source);
        }
        Ok(by_type)
    }

    /// Inserts a new source (assigning its id) or replaces an existing one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceNotFound`] when updating an id that is not
    /// stored.
    fn save_identifier_source(&self, source: IdentifierSource) -> Result<IdentifierSource>;

    /// Runs `check` and saves `source` if it passes. No other save or purge
    /// can land between the two, so a check that reads other definitions
    /// (such as a pool's refill chain) still holds once the write is done.
    ///
    /// # Errors
    ///
    /// Returns the error from `check` unchanged, or the errors of
    /// [`Self::save_identifier_source`].
    fn save_identifier_source_checked(
        &self,
        source: IdentifierSource,
        check: SaveCheck<'_>,
    ) -> Result<IdentifierSource>;

    /// Deletes a source together with its sequence counter.
    fn purge_identifier_source(&self, id: SourceId) -> Result<()>;

    /// Atomically reserves `count` consecutive sequence values for `id` and
    /// returns the first one.
    ///
    /// The counter starts at `initial` and is advanced and persisted before
    /// this returns, so values reserved here are never reserved again, even
    /// if the caller fails before using them.
    fn reserve_sequence_values(&self, id: SourceId, initial: u64, count: u64) -> Result<u64>;
}

#[derive(Default)]
struct Tables {
    last_id: u32,
    sources: BTreeMap<SourceId, IdentifierSource>,
}

impl Tables {
    fn insert(&mut self, mut source: IdentifierSource) -> Result<IdentifierSource> {
        let id = match source.id {
            Some(id) if self.sources.contains_key(&id) => id,
            Some(id) => return Err(Error::SourceNotFound(id)),
            None => {
                self.last_id = self
                    .last_id
                    .checked_add(1)
                    .ok_or_else(|| Error::Storage("source id space exhausted".into()))?;
                SourceId(self.last_id)
            }
        };
        source.id = Some(id);
        self.sources.insert(id, source.clone());
        Ok(source)
    }
}

impl SourceLookup for Tables {
    fn get_identifier_source(&self, id: SourceId) -> Result<Option<IdentifierSource>> {
        Ok(self.sources.get(&id).cloned())
    }
}

/// In-memory [`SourceStore`].
///
/// Definitions share one lock. Each sequence counter is a separate atomic, so
/// reservations only take the definitions lock for reading and generators
/// never wait on each other.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    counters: RwLock<HashMap<SourceId, Arc<AtomicU64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next value the sequential generator `id` will hand out, if it has
    /// issued anything yet.
    pub fn next_sequence_value(&self, id: SourceId) -> Option<u64> {
        self.counters
            .read()
            .get(&id)
            .map(|next| next.load(Ordering::Acquire))
    }

    fn counter(&self, id: SourceId, initial: u64) -> Arc<AtomicU64> {
        if let Some(next) = self.counters.read().get(&id) {
            return Arc::clone(next);
        }
        Arc::clone(
            self.counters
                .write()
                .entry(id)
                .or_insert_with(|| Arc::new(AtomicU64::new(initial))),
        )
    }
}

impl SourceLookup for MemoryStore {
    fn get_identifier_source(&self, id: SourceId) -> Result<Option<IdentifierSource>> {
        self.tables.read().get_identifier_source(id)
    }
}

impl SourceStore for MemoryStore {
    fn get_all_identifier_sources(&self, include_retired: bool) -> Result<Vec<IdentifierSource>> {
        Ok(self
            .tables
            .read()
            .sources
            .values()
            .filter(|s| include_retired || !s.retired)
            .cloned()
            .collect())
    }

    fn save_identifier_source(&self, source: IdentifierSource) -> Result<IdentifierSource> {
        self.tables.write().insert(source)
    }

    fn save_identifier_source_checked(
        &self,
        source: IdentifierSource,
        check: SaveCheck<'_>,
    ) -> Result<IdentifierSource> {
        let mut tables = self.tables.write();
        check(&source, &*tables)?;
        tables.insert(source)
    }

    fn purge_identifier_source(&self, id: SourceId) -> Result<()> {
        let mut tables = self.tables.write();
        tables
            .sources
            .remove(&id)
            .ok_or(Error::SourceNotFound(id))?;
        drop(tables);
        self.counters.write().remove(&id);
        Ok(())
    }

    fn reserve_sequence_values(&self, id: SourceId, initial: u64, count: u64) -> Result<u64> {
        if !self.tables.read().sources.contains_key(&id) {
            return Err(Error::SourceNotFound(id));
        }
        self.counter(id, initial)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                next.checked_add(count)
            })
            .map_err(|start| Error::InsufficientCapacity {
                source_id: id,
                requested: usize::try_from(count).unwrap_or(usize::MAX),
                available: usize::try_from(u64::MAX - start).unwrap_or(usize::MAX),
            })
    }
}
