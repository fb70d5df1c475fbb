use crate::{
    BatchAllocator, Error, IdentifierSource, IdentifierType, LogEntry, PoolConfig, PoolStatus,
    Result, SourceId, SourceKindTag, SourceLookup, validate_source,
};
use std::{collections::BTreeMap, sync::Arc};

/// Outcome of one [`IdentifierSourceService::replenish_pools`] sweep.
#[derive(Debug, Default)]
pub struct ReplenishReport {
    /// Identifiers added across all pools.
    pub added: usize,
    /// Pools whose refill failed; the sweep continues past them.
    pub failures: Vec<(SourceId, Error)>,
}

/// Administration and allocation operations over identifier sources.
///
/// This is the request-scoped API used by the HTTP layer: every call names
/// the source it acts on explicitly, no state is carried between calls.
#[derive(Clone)]
pub struct IdentifierSourceService {
    allocator: Arc<BatchAllocator>,
}

impl IdentifierSourceService {
    pub fn new(allocator: Arc<BatchAllocator>) -> Self {
        Self { allocator }
    }

    pub fn allocator(&self) -> &Arc<BatchAllocator> {
        &self.allocator
    }

    pub fn get_all_identifier_sources(&self, include_retired: bool) -> Result<Vec<IdentifierSource>> {
        self.allocator.store().get_all_identifier_sources(include_retired)
    }

    pub fn get_identifier_sources_by_type(
        &self,
        include_retired: bool,
    ) -> Result<BTreeMap<IdentifierType, Vec<IdentifierSource>>> {
        self.allocator
            .store()
            .get_identifier_sources_by_type(include_retired)
    }

    /// # Errors
    ///
    /// Returns [`Error::SourceNotFound`] if no source has this id.
    pub fn get_identifier_source(&self, id: SourceId) -> Result<IdentifierSource> {
        self.allocator
            .store()
            .get_identifier_source(id)?
            .ok_or(Error::SourceNotFound(id))
    }

    /// Kinds of source that can be created.
    pub fn get_identifier_source_types(&self) -> &'static [SourceKindTag] {
        &SourceKindTag::ALL
    }

    /// Active sources of the same identifier type as `source`, excluding
    /// `source` itself. These are the candidates for a pool's refill source.
    pub fn compatible_sources(&self, source: &IdentifierSource) -> Result<Vec<IdentifierSource>> {
        Ok(self
            .get_all_identifier_sources(false)?
            .into_iter()
            .filter(|s| s.identifier_type == source.identifier_type)
            .filter(|s| source.id.is_none() || s.id != source.id)
            .collect())
    }

    /// Validates and stores a new or updated source.
    ///
    /// Validation and the write happen as one store operation, so two
    /// concurrent saves cannot each pass the refill cycle check and together
    /// form a cycle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] with every rejected field, or the store's
    /// error.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip_all, fields(id = ?source.id, name = %source.name)))]
    pub fn save_identifier_source(&self, source: IdentifierSource) -> Result<IdentifierSource> {
        let saved = self
            .allocator
            .store()
            .save_identifier_source_checked(source, &validate_source)?;
        #[cfg(feature = "tracing")]
        tracing::info!(id = ?saved.id, kind = ?saved.kind_tag(), "Saved identifier source");
        Ok(saved)
    }

    /// Deletes a source along with its counter, pool buffer and remote
    /// history.
    pub async fn purge_identifier_source(&self, id: SourceId) -> Result<()> {
        self.allocator.store().purge_identifier_source(id)?;
        self.allocator.forget(id).await;
        #[cfg(feature = "tracing")]
        tracing::info!(%id, "Purged identifier source");
        Ok(())
    }

    /// Marks a source retired; it can no longer issue identifiers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `reason` is blank.
    pub fn retire_identifier_source(&self, id: SourceId, reason: &str) -> Result<IdentifierSource> {
        if reason.trim().is_empty() {
            return Err(Error::invalid("retire_reason", "is required when retiring a source"));
        }
        let mut source = self.get_identifier_source(id)?;
        source.retired = true;
        source.retire_reason = Some(reason.trim().to_string());
        self.allocator.store().save_identifier_source(source)
    }

    pub fn unretire_identifier_source(&self, id: SourceId) -> Result<IdentifierSource> {
        let mut source = self.get_identifier_source(id)?;
        source.retired = false;
        source.retire_reason = None;
        self.allocator.store().save_identifier_source(source)
    }

    /// See [`BatchAllocator::generate_identifiers`].
    pub async fn generate_identifiers(
        &self,
        source: SourceId,
        count: usize,
        comment: &str,
    ) -> Result<Vec<String>> {
        self.allocator
            .generate_identifiers(source, count, comment)
            .await
    }

    /// See [`BatchAllocator::generate_identifier`].
    pub async fn generate_identifier(&self, source: SourceId, comment: &str) -> Result<String> {
        self.allocator.generate_identifier(source, comment).await
    }

    /// Adds uploaded identifiers to the pool `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSource`] if `id` is not a pool, or
    /// [`Error::DuplicateIdentifier`] per the pool's duplicate policy.
    pub async fn add_identifiers_to_pool(
        &self,
        id: SourceId,
        identifiers: Vec<String>,
    ) -> Result<usize> {
        self.pool_config(id)?;
        self.allocator
            .pools()
            .add_identifiers_to_pool(id, identifiers)
            .await
    }

    /// Replenishes the pool `id` with `batch_size` identifiers from its
    /// refill source.
    pub async fn add_identifiers_from_source(&self, id: SourceId, batch_size: usize) -> Result<usize> {
        let config = self.pool_config(id)?;
        self.allocator
            .pools()
            .add_identifiers_from_source(id, &config, batch_size, &self.allocator.refill_upstream(id))
            .await
    }

    /// Tops every active pool up to its low-water mark.
    pub async fn replenish_pools(&self) -> Result<ReplenishReport> {
        let mut report = ReplenishReport::default();
        for source in self.get_all_identifier_sources(false)? {
            let (Some(id), Some(config)) = (source.id, source.as_pool()) else {
                continue;
            };
            match self
                .allocator
                .pools()
                .replenish_if_needed(id, config, &self.allocator.refill_upstream(id))
                .await
            {
                Ok(added) => report.added += added,
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%id, error = %e, "Pool replenishment failed");
                    report.failures.push((id, e));
                }
            }
        }
        Ok(report)
    }

    pub async fn pool_status(&self, id: SourceId) -> Result<PoolStatus> {
        self.pool_config(id)?;
        Ok(self.allocator.pools().status(id).await)
    }

    pub fn log_entries(&self, id: SourceId) -> Result<Vec<LogEntry>> {
        self.allocator.audit().entries(id)
    }

    fn pool_config(&self, id: SourceId) -> Result<PoolConfig> {
        let source = self.get_identifier_source(id)?;
        source.as_pool().cloned().ok_or_else(|| Error::InvalidSource {
            source_id: id,
            reason: format!("source is a {:?} source, not a pool", source.kind_tag()),
        })
    }
}
