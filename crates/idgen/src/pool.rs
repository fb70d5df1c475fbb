//! Buffers of pre-generated identifiers, one per pool source.
//!
//! The [`PoolManager`] exclusively owns every pool's pending buffer and its
//! issuance history. All mutation goes through one critical section per pool
//! (a [`KeyedMutex`] slot), so:
//!
//! - `take` and both `add_identifiers_*` operations on one pool are mutually
//!   exclusive,
//! - different pools never block each other,
//! - upstream calls made during replenishment run with the pool unlocked.
//!
//! ## Duplicate policy
//!
//! An identifier may enter a pool at most once over the pool's lifetime.
//! Uploaded files containing any identifier already pending, already issued,
//! or repeated within the file are rejected as a whole with
//! [`Error::DuplicateIdentifier`]. Identifiers produced by the upstream source
//! have already been consumed upstream; colliding ones are skipped and
//! logged, the rest are kept.

use crate::{Error, KeyedMutex, PoolConfig, Result, SourceId};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};

/// How many times `take` refills from upstream before giving up when
/// concurrent callers keep draining the buffer in between.
const MAX_REFILL_ROUNDS: usize = 3;

/// Producer of fresh identifiers for a pool's `refill_source`.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Issues `count` identifiers from `source`.
    async fn supply(&self, source: SourceId, count: usize, comment: &str) -> Result<Vec<String>>;
}

/// Snapshot of one pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub pending: usize,
    pub issued: usize,
}

#[derive(Default)]
struct PoolBuffer {
    pending: VecDeque<String>,
    // Everything ever accepted: pending and issued.
    seen: HashSet<String>,
    issued: usize,
}

impl PoolBuffer {
    fn duplicates(&self, identifiers: &[String]) -> Vec<String> {
        let mut offered = HashSet::with_capacity(identifiers.len());
        identifiers
            .iter()
            .filter(|id| self.seen.contains(*id) || !offered.insert(id.as_str()))
            .cloned()
            .collect()
    }

    fn push(&mut self, identifier: String) -> bool {
        if self.seen.insert(identifier.clone()) {
            self.pending.push_back(identifier);
            true
        } else {
            false
        }
    }

    fn drain(&mut self, count: usize) -> Vec<String> {
        self.issued += count;
        self.pending.drain(..count).collect()
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            pending: self.pending.len(),
            issued: self.issued,
        }
    }
}

/// Owner of all pool buffers.
#[derive(Default)]
pub struct PoolManager {
    buffers: KeyedMutex<SourceId, PoolBuffer>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends externally supplied identifiers (e.g. an uploaded file) to
    /// `pool`. Surrounding whitespace is trimmed and blank entries ignored.
    ///
    /// Returns the number of identifiers added.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateIdentifier`] listing every offending entry if
    /// any identifier is pending, was issued, or repeats within the upload.
    /// Nothing is appended in that case.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self, identifiers)))]
    pub async fn add_identifiers_to_pool(
        &self,
        pool: SourceId,
        identifiers: impl IntoIterator<Item = String> + Send,
    ) -> Result<usize> {
        let identifiers: Vec<String> = identifiers
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();

        let mut buffer = self.buffers.lock(&pool).await;
        let duplicates = buffer.duplicates(&identifiers);
        if !duplicates.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::warn!(%pool, duplicates = duplicates.len(), "Rejected upload with duplicate identifiers");
            return Err(Error::DuplicateIdentifier {
                identifiers: duplicates,
            });
        }

        let added = identifiers.len();
        for id in identifiers {
            buffer.push(id);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(%pool, added, pending = buffer.pending.len(), "Added identifiers to pool");
        Ok(added)
    }

    /// Requests `batch_size` identifiers from the pool's `refill_source` and
    /// appends them. Returns the number added.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `batch_size` is zero or the pool has no
    /// refill source, or the upstream's error if it fails.
    pub async fn add_identifiers_from_source(
        &self,
        pool: SourceId,
        config: &PoolConfig,
        batch_size: usize,
        upstream: &dyn Upstream,
    ) -> Result<usize> {
        if batch_size == 0 {
            return Err(Error::invalid("batch_size", "must be greater than 0"));
        }
        let refill_source = config.refill_source.ok_or_else(|| {
            Error::invalid("refill_source", "pool has no source to refill from")
        })?;
        self.refill(pool, refill_source, batch_size, upstream).await
    }

    /// Tops `pool` up to its `min_pool_size`, if it has a refill source and
    /// is below that mark. Returns the number added.
    pub async fn replenish_if_needed(
        &self,
        pool: SourceId,
        config: &PoolConfig,
        upstream: &dyn Upstream,
    ) -> Result<usize> {
        let Some(refill_source) = config.refill_source else {
            return Ok(0);
        };
        let pending = self.buffers.lock(&pool).await.pending.len();
        if pending >= config.min_pool_size {
            return Ok(0);
        }
        let batch = (config.min_pool_size - pending).max(config.refill_batch_size);
        self.refill(pool, refill_source, batch, upstream).await
    }

    /// Removes and returns the first `count` pending identifiers of `pool`.
    ///
    /// When fewer than `count` are pending, the pool is first replenished
    /// from its refill source with enough identifiers to satisfy the request
    /// and restore `min_pool_size`, but at least `refill_batch_size`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientCapacity`] if the pool cannot be
    /// replenished enough, or the upstream's error if it fails. No identifier
    /// is removed on error.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self, config, upstream)))]
    pub async fn take(
        &self,
        pool: SourceId,
        config: &PoolConfig,
        count: usize,
        upstream: &dyn Upstream,
    ) -> Result<Vec<String>> {
        for _ in 0..MAX_REFILL_ROUNDS {
            let available = {
                let mut buffer = self.buffers.lock(&pool).await;
                if buffer.pending.len() >= count {
                    return Ok(buffer.drain(count));
                }
                buffer.pending.len()
            };

            let Some(refill_source) = config.refill_source else {
                return Err(Error::InsufficientCapacity {
                    source_id: pool,
                    requested: count,
                    available,
                });
            };

            let batch = (count - available + config.min_pool_size).max(config.refill_batch_size);
            let fresh = Self::supply(pool, refill_source, batch, upstream).await?;

            // Absorb and serve in one critical section so concurrent takers
            // cannot drain the refill before this caller is served.
            let mut buffer = self.buffers.lock(&pool).await;
            Self::absorb(pool, &mut buffer, fresh);
            if buffer.pending.len() >= count {
                return Ok(buffer.drain(count));
            }
        }

        let mut buffer = self.buffers.lock(&pool).await;
        if buffer.pending.len() >= count {
            return Ok(buffer.drain(count));
        }
        Err(Error::InsufficientCapacity {
            source_id: pool,
            requested: count,
            available: buffer.pending.len(),
        })
    }

    pub async fn status(&self, pool: SourceId) -> PoolStatus {
        self.buffers.lock(&pool).await.status()
    }

    /// Forgets the buffer and history of a purged pool.
    pub async fn purge(&self, pool: SourceId) {
        let mut buffer = self.buffers.lock(&pool).await;
        *buffer = PoolBuffer::default();
        self.buffers.remove(&pool);
    }

    async fn refill(
        &self,
        pool: SourceId,
        refill_source: SourceId,
        batch: usize,
        upstream: &dyn Upstream,
    ) -> Result<usize> {
        let fresh = Self::supply(pool, refill_source, batch, upstream).await?;
        let mut buffer = self.buffers.lock(&pool).await;
        Ok(Self::absorb(pool, &mut buffer, fresh))
    }

    // Must be called with the pool unlocked.
    async fn supply(
        pool: SourceId,
        refill_source: SourceId,
        batch: usize,
        upstream: &dyn Upstream,
    ) -> Result<Vec<String>> {
        let comment = format!("Replenishing pool {pool}");
        let fresh = upstream.supply(refill_source, batch, &comment).await?;
        #[cfg(feature = "tracing")]
        tracing::debug!(%pool, %refill_source, supplied = fresh.len(), "Received refill batch");
        Ok(fresh)
    }

    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn absorb(pool: SourceId, buffer: &mut PoolBuffer, fresh: Vec<String>) -> usize {
        let offered = fresh.len();
        let added = fresh.into_iter().filter(|id| buffer.push(id.clone())).count();
        if added < offered {
            #[cfg(feature = "tracing")]
            tracing::warn!(%pool, skipped = offered - added, "Skipped upstream identifiers already known to pool");
        }
        added
    }
}
