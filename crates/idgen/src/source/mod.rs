//! Identifier sources and their generation strategies.
//!
//! An [`IdentifierSource`] always has exactly one [`SourceKind`]:
//!
//! - [`SourceKind::Sequential`] - deterministic increments of a persisted
//!   counter, formatted through a [`SequentialConfig`].
//! - [`SourceKind::Pool`] - a buffer of pre-generated identifiers owned by the
//!   [`PoolManager`](crate::PoolManager), optionally refilled from another
//!   source.
//! - [`SourceKind::Remote`] - batches fetched from an external service.

mod check_digit;
mod sequential;

pub use check_digit::*;
pub use sequential::*;

use core::fmt;
use serde::{Deserialize, Serialize};

/// Storage identity of an [`IdentifierSource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of identifier a source produces, e.g. a national id or a medical
/// record number. Sources of the same type are interchangeable upstreams for
/// one another.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentifierType(pub String);

impl IdentifierType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named producer of unique identifier strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierSource {
    /// Assigned by the store on first save.
    #[serde(default)]
    pub id: Option<SourceId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub identifier_type: IdentifierType,
    #[serde(default)]
    pub retired: bool,
    #[serde(default)]
    pub retire_reason: Option<String>,
    pub kind: SourceKind,
}

impl IdentifierSource {
    /// Creates an unsaved, active source.
    pub fn new(name: impl Into<String>, identifier_type: IdentifierType, kind: SourceKind) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            identifier_type,
            retired: false,
            retire_reason: None,
            kind,
        }
    }

    /// Returns the pool settings when this source is a pool.
    pub fn as_pool(&self) -> Option<&PoolConfig> {
        match &self.kind {
            SourceKind::Pool(pool) => Some(pool),
            _ => None,
        }
    }

    pub fn kind_tag(&self) -> SourceKindTag {
        self.kind.tag()
    }
}

/// Generation strategy of a source. Exactly one per source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    Sequential(SequentialConfig),
    Pool(PoolConfig),
    Remote(RemoteConfig),
}

impl SourceKind {
    pub const fn tag(&self) -> SourceKindTag {
        match self {
            Self::Sequential(_) => SourceKindTag::Sequential,
            Self::Pool(_) => SourceKindTag::Pool,
            Self::Remote(_) => SourceKindTag::Remote,
        }
    }
}

/// Discriminant of [`SourceKind`], listed when creating a new source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKindTag {
    Sequential,
    Pool,
    Remote,
}

impl SourceKindTag {
    pub const ALL: [Self; 3] = [Self::Sequential, Self::Pool, Self::Remote];

    pub const fn description(self) -> &'static str {
        match self {
            Self::Sequential => "Local identifier generator",
            Self::Pool => "Local pool of identifiers",
            Self::Remote => "Remote identifier source",
        }
    }
}

/// Settings of a pool source. The pending buffer itself lives in the
/// [`PoolManager`](crate::PoolManager).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upstream source used to replenish the buffer.
    #[serde(default)]
    pub refill_source: Option<SourceId>,
    /// Minimum number of identifiers requested from upstream per refill.
    #[serde(default = "PoolConfig::default_refill_batch_size")]
    pub refill_batch_size: usize,
    /// Low-water mark: a refill tops the buffer up to at least this many.
    #[serde(default)]
    pub min_pool_size: usize,
}

impl PoolConfig {
    const fn default_refill_batch_size() -> usize {
        1000
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            refill_source: None,
            refill_batch_size: Self::default_refill_batch_size(),
            min_pool_size: 0,
        }
    }
}

/// Connection settings of a remote source.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}
