//! Batch allocation: the single entry point that hands out identifiers.

use crate::{
    AuditSink, Error, IdentifierSource, KeyedMutex, LogEntry, PoolManager, RemoteClient, Result,
    RetryPolicy, SequentialConfig, SourceId, SourceKind, SourceLookup, SourceStore, Upstream,
    remote::fetch_with_retry,
};
use async_trait::async_trait;
use std::{collections::HashSet, sync::Arc};

/// Default upper bound on the size of one batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100_000;

/// Comment recorded when the caller gives none.
pub fn default_comment(count: usize) -> String {
    format!("Batch Export of {count} to file")
}

/// Hands out batches of unique identifiers from any kind of source.
///
/// Every successful call is recorded in the [`AuditSink`] before the batch is
/// returned. Calls fail as a whole: either all `count` identifiers are
/// returned, or none are.
///
/// - Sequential sources reserve their numbers in the [`SourceStore`] before
///   formatting them (increment-then-issue), so a failure after the
///   reservation leaves a gap, never a reuse.
/// - Pool sources go through [`PoolManager::take`], replenishing from their
///   refill source through a [`RefillUpstream`]. A refill chain that leads
///   back to a pool already being served fails with
///   [`Error::InvalidSource`].
/// - Remote sources are fetched with the configured [`RetryPolicy`], one
///   call per source at a time. Responses repeating anything the source
///   already issued through this allocator are refused.
pub struct BatchAllocator {
    store: Arc<dyn SourceStore>,
    pools: Arc<PoolManager>,
    remote: Arc<dyn RemoteClient>,
    remote_issued: KeyedMutex<SourceId, HashSet<String>>,
    audit: Arc<dyn AuditSink>,
    retry: RetryPolicy,
    max_batch_size: usize,
}

impl BatchAllocator {
    pub fn new(
        store: Arc<dyn SourceStore>,
        audit: Arc<dyn AuditSink>,
        remote: Arc<dyn RemoteClient>,
    ) -> Self {
        Self {
            store,
            pools: Arc::new(PoolManager::new()),
            remote,
            remote_issued: KeyedMutex::new(),
            audit,
            retry: RetryPolicy::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    #[must_use]
    pub fn with_pool_manager(mut self, pools: Arc<PoolManager>) -> Self {
        self.pools = pools;
        self
    }

    pub fn store(&self) -> &Arc<dyn SourceStore> {
        &self.store
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub const fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Upstream for refilling `pool` from its refill source.
    pub fn refill_upstream(&self, pool: SourceId) -> RefillUpstream<'_> {
        RefillUpstream {
            allocator: self,
            chain: vec![pool],
        }
    }

    /// Drops the in-process state kept for a purged source.
    pub async fn forget(&self, source: SourceId) {
        self.pools.purge(source).await;
        let mut issued = self.remote_issued.lock(&source).await;
        issued.clear();
        self.remote_issued.remove(&source);
    }

    /// Issues `count` identifiers from `source`, in generation order.
    ///
    /// A blank `comment` is replaced by [`default_comment`].
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `count` is zero or above the batch limit.
    /// - [`Error::SourceNotFound`] / [`Error::InvalidSource`] if the source
    ///   is missing or retired.
    /// - [`Error::InsufficientCapacity`] if a pool or generator is exhausted.
    /// - [`Error::UpstreamUnavailable`] if a remote source keeps failing.
    /// - [`Error::Storage`] if the counter or the audit record cannot be
    ///   persisted.
    pub async fn generate_identifiers(
        &self,
        source: SourceId,
        count: usize,
        comment: &str,
    ) -> Result<Vec<String>> {
        self.issue(source, count, comment, &[]).await
    }

    /// Issues a single identifier from `source`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::generate_identifiers`].
    pub async fn generate_identifier(&self, source: SourceId, comment: &str) -> Result<String> {
        self.generate_identifiers(source, 1, comment)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::InsufficientCapacity {
                source_id: source,
                requested: 1,
                available: 0,
            })
    }

    // `refilling` lists the pools whose refill led here, outermost first.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip(self, comment, refilling)))]
    async fn issue(
        &self,
        source: SourceId,
        count: usize,
        comment: &str,
        refilling: &[SourceId],
    ) -> Result<Vec<String>> {
        if refilling.contains(&source) {
            return Err(Error::InvalidSource {
                source_id: source,
                reason: "refill sources form a cycle".into(),
            });
        }
        if count == 0 {
            return Err(Error::invalid("count", "must be greater than 0"));
        }
        if count > self.max_batch_size {
            return Err(Error::invalid(
                "count",
                format!("{count} exceeds the maximum batch size ({})", self.max_batch_size),
            ));
        }
        let comment = if comment.trim().is_empty() {
            default_comment(count)
        } else {
            comment.to_string()
        };

        let definition = self.resolve(source)?;
        let batch = self
            .produce(source, &definition, count, &comment, refilling)
            .await?;
        debug_assert_eq!(batch.len(), count);

        self.audit
            .record(&LogEntry::new(source, comment, batch.clone()))
            .await?;

        #[cfg(feature = "tracing")]
        tracing::info!(%source, count, kind = ?definition.kind_tag(), "Issued identifiers");
        Ok(batch)
    }

    fn resolve(&self, source: SourceId) -> Result<IdentifierSource> {
        let definition = self
            .store
            .get_identifier_source(source)?
            .ok_or(Error::SourceNotFound(source))?;
        if definition.retired {
            return Err(Error::InvalidSource {
                source_id: source,
                reason: definition
                    .retire_reason
                    .map_or_else(|| "source is retired".into(), |r| format!("source is retired: {r}")),
            });
        }
        Ok(definition)
    }

    async fn produce(
        &self,
        source: SourceId,
        definition: &IdentifierSource,
        count: usize,
        comment: &str,
        refilling: &[SourceId],
    ) -> Result<Vec<String>> {
        match &definition.kind {
            SourceKind::Sequential(config) => self.next_sequential(source, config, count),
            SourceKind::Pool(config) => {
                let upstream = RefillUpstream {
                    allocator: self,
                    chain: refilling.iter().copied().chain([source]).collect(),
                };
                self.pools.take(source, config, count, &upstream).await
            }
            SourceKind::Remote(config) => {
                // Held across the fetch so concurrent callers check against
                // each other's batches.
                let mut issued = self.remote_issued.lock(&source).await;
                let batch = fetch_with_retry(
                    self.remote.as_ref(),
                    &self.retry,
                    source,
                    config,
                    count,
                    comment,
                    &issued,
                )
                .await?;
                issued.extend(batch.iter().cloned());
                Ok(batch)
            }
        }
    }

    fn next_sequential(
        &self,
        source: SourceId,
        config: &SequentialConfig,
        count: usize,
    ) -> Result<Vec<String>> {
        let initial = config.first_value()?;
        // Reserve first: the counter is persisted before anything is issued.
        let start = self
            .store
            .reserve_sequence_values(source, initial, count as u64)?;

        (0..count)
            .map(|offset| {
                config
                    .format(start + offset as u64)?
                    .ok_or(Error::InsufficientCapacity {
                        source_id: source,
                        requested: count,
                        available: offset,
                    })
            })
            .collect()
    }
}

/// [`Upstream`] that refills pools through a [`BatchAllocator`].
///
/// Requests above the allocator's batch limit are split into several
/// batches, each audited on its own. If a later batch fails, the identifiers
/// already issued are still returned so the pool keeps them.
pub struct RefillUpstream<'a> {
    allocator: &'a BatchAllocator,
    chain: Vec<SourceId>,
}

#[async_trait]
impl Upstream for RefillUpstream<'_> {
    async fn supply(&self, source: SourceId, count: usize, comment: &str) -> Result<Vec<String>> {
        let limit = self.allocator.max_batch_size.max(1);
        let mut supplied = Vec::with_capacity(count);
        while supplied.len() < count {
            let chunk = (count - supplied.len()).min(limit);
            match self.allocator.issue(source, chunk, comment, &self.chain).await {
                Ok(batch) => supplied.extend(batch),
                Err(e) if supplied.is_empty() => return Err(e),
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%source, supplied = supplied.len(), requested = count, error = %_e, "Refill stopped early");
                    break;
                }
            }
        }
        Ok(supplied)
    }
}
