//! PostgreSQL-backed status store
//!
//! Claims are single conditional `UPDATE`s; no transaction is held open while a
//! manifest is being processed.

use async_trait::async_trait;
use ccw_common::types::RifFileType;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::debug;

use super::{
    illegal_transition, DataFileRecord, ManifestRecord, ManifestStatus, ManifestStatusStore,
};
use crate::error::{PipelineError, PipelineResult};
use crate::manifest::DataSetManifest;

const MANIFEST_COLUMNS: &str = "manifest_id, s3_key, manifest_timestamp, sequence_id, status, \
     discovery_timestamp, started_timestamp, heartbeat_timestamp, completed_timestamp";

#[derive(Debug, sqlx::FromRow)]
struct ManifestRow {
    manifest_id: i64,
    s3_key: String,
    manifest_timestamp: DateTime<Utc>,
    sequence_id: i32,
    status: String,
    discovery_timestamp: DateTime<Utc>,
    started_timestamp: Option<DateTime<Utc>>,
    heartbeat_timestamp: Option<DateTime<Utc>>,
    completed_timestamp: Option<DateTime<Utc>>,
}

impl ManifestRow {
    fn into_record(self, data_files: Vec<DataFileRecord>) -> PipelineResult<ManifestRecord> {
        Ok(ManifestRecord {
            manifest_key: self.s3_key,
            manifest_timestamp: self.manifest_timestamp,
            sequence_id: self.sequence_id,
            status: self.status.parse()?,
            discovered_at: self.discovery_timestamp,
            started_at: self.started_timestamp,
            heartbeat_at: self.heartbeat_timestamp,
            completed_at: self.completed_timestamp,
            data_files,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DataFileRow {
    file_name: String,
    file_type: String,
    s3_key: String,
    entry_index: i32,
    status: String,
    discovery_timestamp: DateTime<Utc>,
    started_timestamp: Option<DateTime<Utc>>,
    completed_timestamp: Option<DateTime<Utc>>,
}

impl TryFrom<DataFileRow> for DataFileRecord {
    type Error = PipelineError;

    fn try_from(row: DataFileRow) -> Result<Self, Self::Error> {
        Ok(DataFileRecord {
            file_name: row.file_name,
            file_type: row.file_type.parse::<RifFileType>()?,
            object_key: row.s3_key,
            entry_index: row.entry_index,
            status: row.status.parse()?,
            discovered_at: row.discovery_timestamp,
            started_at: row.started_timestamp,
            completed_at: row.completed_timestamp,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn data_files(&self, manifest_id: i64) -> PipelineResult<Vec<DataFileRecord>> {
        let rows = sqlx::query_as::<_, DataFileRow>(
            r#"
            SELECT file_name, file_type, s3_key, entry_index, status,
                   discovery_timestamp, started_timestamp, completed_timestamp
            FROM s3_data_files
            WHERE manifest_id = $1
            ORDER BY entry_index
            "#,
        )
        .bind(manifest_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DataFileRecord::try_from).collect()
    }
}

#[async_trait]
impl ManifestStatusStore for PgStatusStore {
    async fn insert_discovered(
        &self,
        manifest: &DataSetManifest,
        now: DateTime<Utc>,
    ) -> PipelineResult<ManifestRecord> {
        let record = ManifestRecord::discovered(manifest, now)?;
        let mut tx = self.pool.begin().await?;

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO s3_manifest_files
                (s3_key, manifest_timestamp, sequence_id, status, discovery_timestamp)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (s3_key) DO NOTHING
            RETURNING manifest_id
            "#,
        )
        .bind(&record.manifest_key)
        .bind(record.manifest_timestamp)
        .bind(record.sequence_id)
        .bind(record.status.as_str())
        .bind(record.discovered_at)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(manifest_id) = inserted {
            for file in &record.data_files {
                sqlx::query(
                    r#"
                    INSERT INTO s3_data_files
                        (manifest_id, file_name, file_type, s3_key, entry_index, status,
                         discovery_timestamp)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(manifest_id)
                .bind(&file.file_name)
                .bind(file.file_type.as_str())
                .bind(&file.object_key)
                .bind(file.entry_index)
                .bind(file.status.as_str())
                .bind(file.discovered_at)
                .execute(&mut *tx)
                .await?;
            }
            debug!(manifest_key = %record.manifest_key, manifest_id, "Recorded new manifest");
        }

        tx.commit().await?;

        self.read(&record.manifest_key).await?.ok_or_else(|| {
            PipelineError::Precondition(format!(
                "manifest '{}' missing right after insert",
                record.manifest_key
            ))
        })
    }

    async fn read(&self, manifest_key: &str) -> PipelineResult<Option<ManifestRecord>> {
        let row = sqlx::query_as::<_, ManifestRow>(&format!(
            "SELECT {} FROM s3_manifest_files WHERE s3_key = $1",
            MANIFEST_COLUMNS
        ))
        .bind(manifest_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let files = self.data_files(row.manifest_id).await?;
                Ok(Some(row.into_record(files)?))
            }
            None => Ok(None),
        }
    }

    async fn read_many(
        &self,
        manifest_keys: &[String],
    ) -> PipelineResult<HashMap<String, ManifestRecord>> {
        if manifest_keys.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, ManifestRow>(&format!(
            "SELECT {} FROM s3_manifest_files WHERE s3_key = ANY($1)",
            MANIFEST_COLUMNS
        ))
        .bind(manifest_keys)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let record = row.into_record(Vec::new())?;
                Ok((record.manifest_key.clone(), record))
            })
            .collect()
    }

    async fn transition(
        &self,
        manifest_key: &str,
        from: ManifestStatus,
        to: ManifestStatus,
        now: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        if !from.can_transition_to(to) {
            return Err(illegal_transition(manifest_key, from, to));
        }

        let sql = match to {
            ManifestStatus::Started => {
                r#"
                UPDATE s3_manifest_files
                SET status = $3, started_timestamp = $4, heartbeat_timestamp = $4
                WHERE s3_key = $1 AND status = $2
                "#
            }
            _ => {
                r#"
                UPDATE s3_manifest_files
                SET status = $3, completed_timestamp = $4
                WHERE s3_key = $1 AND status = $2
                "#
            }
        };

        let result = sqlx::query(sql)
            .bind(manifest_key)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reclaim_stale(
        &self,
        manifest_key: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE s3_manifest_files
            SET started_timestamp = $3, heartbeat_timestamp = $3
            WHERE s3_key = $1
              AND status = 'STARTED'
              AND (GREATEST(started_timestamp, heartbeat_timestamp) IS NULL
                   OR GREATEST(started_timestamp, heartbeat_timestamp) < $2)
            "#,
        )
        .bind(manifest_key)
        .bind(stale_before)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn heartbeat(&self, manifest_key: &str, now: DateTime<Utc>) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE s3_manifest_files
            SET heartbeat_timestamp = $2
            WHERE s3_key = $1 AND status = 'STARTED'
            "#,
        )
        .bind(manifest_key)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_data_file(
        &self,
        manifest_key: &str,
        file_name: &str,
        status: ManifestStatus,
        now: DateTime<Utc>,
    ) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE s3_data_files AS f
            SET status = $3,
                started_timestamp = CASE WHEN $3 = 'STARTED' THEN $4 ELSE f.started_timestamp END,
                completed_timestamp = CASE WHEN $3 = 'COMPLETED' THEN $4 ELSE f.completed_timestamp END
            FROM s3_manifest_files AS m
            WHERE m.manifest_id = f.manifest_id
              AND m.s3_key = $1
              AND f.file_name = $2
            "#,
        )
        .bind(manifest_key)
        .bind(file_name)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::Precondition(format!(
                "no data file '{}' recorded for manifest '{}'",
                file_name, manifest_key
            )));
        }
        Ok(())
    }

    async fn list(
        &self,
        status: Option<ManifestStatus>,
        limit: i64,
    ) -> PipelineResult<Vec<ManifestRecord>> {
        let rows = sqlx::query_as::<_, ManifestRow>(&format!(
            "SELECT {} FROM s3_manifest_files \
             WHERE ($1::text IS NULL OR status = $1) \
             ORDER BY manifest_timestamp DESC, sequence_id DESC \
             LIMIT $2",
            MANIFEST_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_record(Vec::new()))
            .collect()
    }
}
