//! HTTP service for identifier sources.
//!
//! ## Structure
//!
//! - [`config`] - CLI/environment configuration.
//! - [`routes`] - axum router and handlers.
//! - [`error`] - mapping of library errors onto HTTP responses.
//! - [`refill`] - background pool replenishment.
//! - [`telemetry`] - log subscriber setup.

pub mod config;
pub mod error;
pub mod refill;
pub mod routes;
pub mod telemetry;

use anyhow::Context;
use config::ServerConfig;
use idgen::{
    AuditSink, BatchAllocator, HttpRemoteClient, IdentifierSourceService, JsonlAuditLog,
    MemoryAuditLog, MemoryStore,
};
use std::sync::Arc;

/// Wires the library components selected by `config` into a service.
pub fn build_service(config: &ServerConfig) -> anyhow::Result<IdentifierSourceService> {
    let audit: Arc<dyn AuditSink> = match &config.audit_log_path {
        Some(path) => Arc::new(
            JsonlAuditLog::open(path)
                .with_context(|| format!("failed to open audit log {}", path.display()))?,
        ),
        None => Arc::new(MemoryAuditLog::new()),
    };
    let remote = HttpRemoteClient::new(config.remote_timeout).context("failed to build HTTP client")?;

    let allocator = BatchAllocator::new(Arc::new(MemoryStore::new()), audit, Arc::new(remote))
        .with_retry_policy(config.retry)
        .with_max_batch_size(config.max_batch_size);
    Ok(IdentifierSourceService::new(Arc::new(allocator)))
}
