//! SQLite storage backend.
//!
//! Records and metadata are stored as JSON bodies next to the columns that
//! queries filter on, so bounding-box lookups run in SQL.

use super::StorageBackend;
use crate::error::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use workspot_engine::{BoundingBox, PendingMutation, SyncMetadata, WorkspaceRecord};

/// Backend persisting to a SQLite database through a `sqlx` pool.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Connect to `database_url`, creating the file if needed, and run
    /// migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to `sqlite::memory:` is its own database, so keep
        // exactly one alive.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        let backend = Self { pool };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn record_from_body(body: &str) -> Result<WorkspaceRecord> {
    Ok(serde_json::from_str(body)?)
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn load_record(&self, id: &str) -> Result<Option<WorkspaceRecord>> {
        let row = sqlx::query("SELECT body FROM records WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| record_from_body(row.try_get("body")?))
            .transpose()
    }

    async fn save_record(&self, record: &WorkspaceRecord) -> Result<()> {
        let body = serde_json::to_string(record)?;
        sqlx::query(
            r#"
            INSERT INTO records (id, lat, lon, saved, revision, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (id) DO UPDATE SET
                lat = excluded.lat,
                lon = excluded.lon,
                saved = excluded.saved,
                revision = excluded.revision,
                body = excluded.body
            "#,
        )
        .bind(&record.id)
        .bind(record.coordinate.lat)
        .bind(record.coordinate.lon)
        .bind(record.saved)
        .bind(record.revision as i64)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_record(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn records_in_bounds(&self, bounds: &BoundingBox) -> Result<Vec<WorkspaceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM records
            WHERE lat BETWEEN ?1 AND ?2 AND lon BETWEEN ?3 AND ?4
            ORDER BY id
            "#,
        )
        .bind(bounds.south)
        .bind(bounds.north)
        .bind(bounds.west)
        .bind(bounds.east)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| record_from_body(row.try_get("body")?))
            .collect()
    }

    async fn all_records(&self) -> Result<Vec<WorkspaceRecord>> {
        let rows = sqlx::query("SELECT body FROM records ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| record_from_body(row.try_get("body")?))
            .collect()
    }

    async fn load_metadata(&self, id: &str) -> Result<Option<SyncMetadata>> {
        let row = sqlx::query("SELECT body FROM sync_metadata WHERE record_id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(serde_json::from_str(row.try_get("body")?)?)),
            None => Ok(None),
        }
    }

    async fn save_metadata(&self, meta: &SyncMetadata) -> Result<()> {
        let body = serde_json::to_string(meta)?;
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (record_id, state, last_synced_at, body)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (record_id) DO UPDATE SET
                state = excluded.state,
                last_synced_at = excluded.last_synced_at,
                body = excluded.body
            "#,
        )
        .bind(&meta.record_id)
        .bind(meta.state.label())
        .bind(meta.last_synced_at.map(|t| t as i64))
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_metadata(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_metadata WHERE record_id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn all_metadata(&self) -> Result<Vec<SyncMetadata>> {
        let rows = sqlx::query("SELECT body FROM sync_metadata ORDER BY record_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<SyncMetadata> {
                Ok(serde_json::from_str(row.try_get("body")?)?)
            })
            .collect()
    }

    async fn save_mutation(&self, mutation: &PendingMutation) -> Result<()> {
        let body = serde_json::to_string(mutation)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO mutations (seq, mutation_id, record_id, body)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(mutation.seq as i64)
        .bind(&mutation.mutation_id)
        .bind(&mutation.record_id)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_mutation(&self, mutation_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM mutations WHERE mutation_id = ?1")
            .bind(mutation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_mutations(&self) -> Result<Vec<PendingMutation>> {
        let rows = sqlx::query("SELECT body FROM mutations ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<PendingMutation> {
                Ok(serde_json::from_str(row.try_get("body")?)?)
            })
            .collect()
    }
}
