//! Pre-validation of synthetic batches
//!
//! Before a synthetic batch is loaded its id ranges are checked against the
//! warehouse; any overlap means the batch must not be loaded. Validation fails
//! closed: a query error counts as a collision.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::manifest::DataSetManifest;

pub mod checks;

pub use checks::{collision_checks, Bind, CollisionCheck, CLM_GRP_ID_END};

/// Read access to the warehouse for one validation pass.
#[async_trait]
pub trait WarehouseReader: Send + Sync {
    async fn open(&self) -> PipelineResult<Box<dyn WarehouseSession>>;
}

#[async_trait]
pub trait WarehouseSession: Send {
    async fn count(&mut self, check: &CollisionCheck) -> PipelineResult<i64>;
}

/// Runs checks inside one read-only transaction; dropping the session rolls it
/// back and returns the connection to the pool.
pub struct PgWarehouseReader {
    pool: PgPool,
}

impl PgWarehouseReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WarehouseReader for PgWarehouseReader {
    async fn open(&self) -> PipelineResult<Box<dyn WarehouseSession>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgWarehouseSession { tx }))
    }
}

struct PgWarehouseSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl WarehouseSession for PgWarehouseSession {
    async fn count(&mut self, check: &CollisionCheck) -> PipelineResult<i64> {
        let mut query = sqlx::query_scalar::<Postgres, i64>(&check.sql);
        for bind in &check.binds {
            query = match bind {
                Bind::BigInt(value) => query.bind(*value),
                Bind::Text(value) => query.bind(value.clone()),
            };
        }
        Ok(query.fetch_one(&mut *self.tx).await?)
    }
}

/// Synthetic-batch collision validator. Must be given a warehouse reader
/// before use.
#[derive(Clone, Default)]
pub struct SyntheaPreValidator {
    reader: Option<Arc<dyn WarehouseReader>>,
}

impl SyntheaPreValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(mut self, reader: Arc<dyn WarehouseReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.reader.is_some()
    }

    pub async fn is_valid(&self, manifest: &DataSetManifest) -> PipelineResult<bool> {
        let reader = self.reader.as_ref().ok_or_else(|| {
            PipelineError::Precondition("pre-validator used before a warehouse was set".to_string())
        })?;

        let manifest_key = manifest.manifest_key();
        let Some(props) = manifest.pre_validation_properties() else {
            debug!(%manifest_key, "No pre-validation properties; nothing to check");
            return Ok(true);
        };

        let checks = collision_checks(props);
        let mut session = match reader.open().await {
            Ok(session) => session,
            Err(e) => {
                error!(%manifest_key, error = %e, "Could not open warehouse session for pre-validation");
                return Ok(false);
            }
        };

        for check in &checks {
            match session.count(check).await {
                Ok(0) => debug!(%manifest_key, check = %check.name, "Pre-validation check passed"),
                Ok(count) => {
                    warn!(
                        %manifest_key,
                        check = %check.name,
                        collisions = count,
                        "Synthetic data collides with existing rows"
                    );
                    return Ok(false);
                }
                Err(e) => {
                    error!(%manifest_key, check = %check.name, error = %e, "Pre-validation query failed");
                    return Ok(false);
                }
            }
        }

        info!(%manifest_key, checks = checks.len(), "Pre-validation passed");
        Ok(true)
    }
}

/// Pre-validation strategy chosen at startup.
#[derive(Clone, Default)]
pub enum PreValidator {
    /// Accepts every batch without touching the database.
    #[default]
    NoOp,
    Synthea(SyntheaPreValidator),
}

impl PreValidator {
    pub fn synthea(pool: PgPool) -> Self {
        PreValidator::Synthea(
            SyntheaPreValidator::new().init(Arc::new(PgWarehouseReader::new(pool))),
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            PreValidator::NoOp => "noop",
            PreValidator::Synthea(_) => "synthea",
        }
    }

    /// `Ok(false)` means the batch must not be loaded.
    pub async fn is_valid(&self, manifest: &DataSetManifest) -> PipelineResult<bool> {
        match self {
            PreValidator::NoOp => Ok(true),
            PreValidator::Synthea(validator) => validator.is_valid(manifest).await,
        }
    }
}
