//! Storage layer for saved parameter sets.
//!
//! Parameter sets are stored as a JSON array of definitions under a version
//! number. Every successful save bumps the version; saving from a stale
//! version is rejected so concurrent editors cannot overwrite each other.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SaveResult, StorageResult};
use crate::parameters::ParameterDefinition;

/// A named, versioned list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedParameterSet {
    /// Caller-chosen identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Version the set was read at; 0 for a set never saved.
    pub version: i64,
    /// Definitions in display order.
    pub parameters: Vec<ParameterDefinition>,
    /// When the set was first saved.
    pub created_at: DateTime<Utc>,
    /// When the set was last saved.
    pub updated_at: DateTime<Utc>,
}

impl SavedParameterSet {
    /// A set that has not been saved yet
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        parameters: Vec<ParameterDefinition>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            version: 0,
            parameters,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Persistence of parameter set definitions.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Save `set`, returning it at its new version.
    ///
    /// Fails with [`crate::error::SaveError::Conflict`] when the stored
    /// version no longer matches `set.version`, or when a new set (version
    /// 0) reuses an existing id.
    async fn save_parameter_set(&self, set: &SavedParameterSet) -> SaveResult<SavedParameterSet>;

    /// Get a saved set by id.
    async fn get_parameter_set(&self, id: &str) -> StorageResult<Option<SavedParameterSet>>;

    /// All saved sets, most recently updated first.
    async fn list_parameter_sets(&self) -> StorageResult<Vec<SavedParameterSet>>;

    /// Delete a saved set.
    async fn delete_parameter_set(&self, id: &str) -> StorageResult<()>;
}
