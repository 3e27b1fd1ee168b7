use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use super::{DefinitionStore, SavedParameterSet};
use crate::config::DatabaseConfig;
use crate::error::{SaveError, SaveResult, StorageError, StorageResult};

/// Schema migrations, embedded at build time.
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const RESOURCE: &str = "parameter set";

fn connection_error(context: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::Connection {
        message: format!("{}: {}", context, e),
    }
}

/// Saved parameter sets in SQLite
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database file and migrate it
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        if let Some(dir) = config.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| connection_error("Cannot create database directory", e))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true);
        debug!(path = %config.path.display(), "Opening parameter store");
        Self::open(options, config.max_connections).await
    }

    /// Private in-memory database.
    ///
    /// Limited to one connection: each new connection would get its own
    /// empty database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| connection_error("Bad in-memory URL", e))?;
        Self::open(options, 1).await
    }

    async fn open(options: SqliteConnectOptions, max_connections: u32) -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| connection_error("Cannot open parameter store", e))?;

        MIGRATOR.run(&pool).await.map_err(|e| StorageError::Migration {
            message: e.to_string(),
        })?;
        info!("Parameter store ready");

        Ok(Self { pool })
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn stored_version(&self, id: &str) -> StorageResult<Option<i64>> {
        let version: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM parameter_sets WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.map(|(v,)| v))
    }
}

#[async_trait]
impl DefinitionStore for SqliteStorage {
    async fn save_parameter_set(&self, set: &SavedParameterSet) -> SaveResult<SavedParameterSet> {
        let parameters = serde_json::to_string(&set.parameters).map_err(|e| {
            StorageError::Serialization {
                message: e.to_string(),
            }
        })?;
        let now = Utc::now();

        let result = if set.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO parameter_sets (id, name, version, parameters, created_at, updated_at)
                VALUES (?, ?, 1, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&set.id)
            .bind(&set.name)
            .bind(&parameters)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?
        } else {
            sqlx::query(
                r#"
                UPDATE parameter_sets
                SET name = ?, parameters = ?, version = version + 1, updated_at = ?
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(&set.name)
            .bind(&parameters)
            .bind(now.to_rfc3339())
            .bind(&set.id)
            .bind(set.version)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?
        };

        if result.rows_affected() == 0 {
            if set.version != 0 && self.stored_version(&set.id).await?.is_none() {
                return Err(StorageError::DefinitionNotFound { id: set.id.clone() }.into());
            }
            debug!(id = %set.id, version = set.version, "Rejected save from stale version");
            return Err(SaveError::Conflict {
                resource: RESOURCE.to_string(),
            });
        }

        self.get_parameter_set(&set.id)
            .await?
            .ok_or_else(|| StorageError::DefinitionNotFound { id: set.id.clone() }.into())
    }

    async fn get_parameter_set(&self, id: &str) -> StorageResult<Option<SavedParameterSet>> {
        let row: Option<ParameterSetRow> = sqlx::query_as(
            r#"
            SELECT id, name, version, parameters, created_at, updated_at
            FROM parameter_sets
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SavedParameterSet::try_from).transpose()
    }

    async fn list_parameter_sets(&self) -> StorageResult<Vec<SavedParameterSet>> {
        let rows: Vec<ParameterSetRow> = sqlx::query_as(
            r#"
            SELECT id, name, version, parameters, created_at, updated_at
            FROM parameter_sets
            ORDER BY updated_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SavedParameterSet::try_from).collect()
    }

    async fn delete_parameter_set(&self, id: &str) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM parameter_sets WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::DefinitionNotFound { id: id.to_string() });
        }
        Ok(())
    }
}

// Internal row type for SQLx mapping
#[derive(sqlx::FromRow)]
struct ParameterSetRow {
    id: String,
    name: String,
    version: i64,
    parameters: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ParameterSetRow> for SavedParameterSet {
    type Error = StorageError;

    fn try_from(row: ParameterSetRow) -> Result<Self, Self::Error> {
        let parameters =
            serde_json::from_str(&row.parameters).map_err(|e| StorageError::Serialization {
                message: format!("Stored parameters of '{}' are invalid: {}", row.id, e),
            })?;

        Ok(Self {
            id: row.id,
            name: row.name,
            version: row.version,
            parameters,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        })
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
