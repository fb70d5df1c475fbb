//! Remote identifier sources.
//!
//! A [`RemoteClient`] performs one network call for a batch; [`RetryPolicy`]
//! bounds how often the allocator repeats it. A batch is only ever accepted
//! whole: a failed or malformed response never yields identifiers.
//!
//! The remote end is not trusted to remember what it handed out. A response
//! repeating an identifier the source already issued is treated as malformed
//! and retried like any other bad response.

use crate::{Error, RemoteConfig, Result, SourceId};
use async_trait::async_trait;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Failure of a single remote call.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Transport used to fetch batches from a remote source.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Requests exactly `count` new identifiers.
    async fn fetch(
        &self,
        config: &RemoteConfig,
        count: usize,
        comment: &str,
    ) -> core::result::Result<Vec<String>, RemoteError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest<'a> {
    number_to_generate: usize,
    comment: &'a str,
}

#[derive(Deserialize)]
struct BatchResponse {
    identifiers: Vec<String>,
}

/// HTTP transport: `POST {url}` with a JSON body
/// `{"numberToGenerate": n, "comment": "..."}`, basic auth when a user is
/// configured, expecting `{"identifiers": [...]}` back.
#[derive(Clone)]
pub struct HttpRemoteClient {
    client: reqwest::Client,
}

impl HttpRemoteClient {
    /// Builds a client whose every request is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::invalid("remote_timeout", e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self, config, comment), fields(url = %config.url)))]
    async fn fetch(
        &self,
        config: &RemoteConfig,
        count: usize,
        comment: &str,
    ) -> core::result::Result<Vec<String>, RemoteError> {
        let mut request = self.client.post(&config.url).json(&BatchRequest {
            number_to_generate: count,
            comment,
        });
        if let Some(user) = &config.user {
            request = request.basic_auth(user, config.password.as_ref());
        }

        let response = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let body: BatchResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        Ok(body.identifiers)
    }
}

/// Bounded exponential backoff for remote calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub backoff: Duration,
    /// Multiplier applied to the delay after each further failure.
    pub backoff_factor: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(200),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first failure.
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
            backoff_factor: 1,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_factor
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Checks that a response is exactly `count` distinct, non-blank identifiers,
/// none of them in `issued`.
fn check_batch(
    ids: &[String],
    count: usize,
    issued: &HashSet<String>,
) -> core::result::Result<(), RemoteError> {
    if ids.len() != count {
        return Err(RemoteError::Malformed(format!(
            "expected {count} identifiers, got {}",
            ids.len()
        )));
    }
    let mut seen = HashSet::with_capacity(ids.len());
    for id in ids {
        if id.trim().is_empty() {
            return Err(RemoteError::Malformed("blank identifier".into()));
        }
        if !seen.insert(id.as_str()) {
            return Err(RemoteError::Malformed(format!("repeated identifier {id}")));
        }
        if issued.contains(id) {
            return Err(RemoteError::Malformed(format!("identifier {id} was already issued")));
        }
    }
    Ok(())
}

/// Fetches a batch, retrying per `policy`. Only a complete, well-formed batch
/// with nothing from `issued` is returned.
pub(crate) async fn fetch_with_retry(
    client: &dyn RemoteClient,
    policy: &RetryPolicy,
    source_id: SourceId,
    config: &RemoteConfig,
    count: usize,
    comment: &str,
    issued: &HashSet<String>,
) -> Result<Vec<String>> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let outcome = client
            .fetch(config, count, comment)
            .await
            .and_then(|ids| check_batch(&ids, count, issued).map(|()| ids));

        match outcome {
            Ok(ids) => return Ok(ids),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%source_id, attempt, attempts, error = %e, "Remote source call failed");
                last_error = e.to_string();
            }
        }

        if attempt < attempts {
            tokio::time::sleep(policy.delay(attempt)).await;
        }
    }

    Err(Error::UpstreamUnavailable {
        source_id,
        attempts,
        reason: last_error,
    })
}
