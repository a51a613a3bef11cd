use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPool;
use thiserror::Error;

use crate::provider::{ParseSourceError, ResolvedAddress, Source};

/// Enumeration of errors for operations on the record store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: String,
        error: sqlx::Error,
    },
    #[error(transparent)]
    ParseSourceError(#[from] ParseSourceError),
}

/// Canonical resolved address for one postal code.
///
/// Created at most once per code and never updated or deleted by the core;
/// the unique index on `code` is what enforces that, not application locks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CepRecord {
    pub code: String,
    pub street: Option<String>,
    pub city: String,
    pub state: String,
    pub is_single_address: bool,
    pub source: Source,
    pub updated_at: DateTime<Utc>,
}

impl CepRecord {
    /// Build a record ready for persistence from a chain resolution.
    pub fn from_resolved(code: &str, address: &ResolvedAddress) -> Self {
        Self {
            code: code.to_owned(),
            street: address.street.clone(),
            city: address.city.clone(),
            state: address.state.clone(),
            is_single_address: address.is_single_address,
            source: address.source,
            updated_at: Utc::now(),
        }
    }
}

/// Persistence gateway for resolved CEP records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Bulk existence lookup: every already-cached record among `codes`,
    /// keyed by code. Called once per batch and once per single lookup.
    async fn find_existing(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, CepRecord>, StoreError>;

    /// Persist a new record; silently ignored when the code already exists,
    /// so concurrent writers never produce a second row.
    async fn insert_if_absent(&self, record: &CepRecord) -> Result<(), StoreError>;
}

#[derive(sqlx::FromRow)]
struct CepRow {
    code: String,
    street: Option<String>,
    city: String,
    state: String,
    is_single_address: bool,
    source: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CepRow> for CepRecord {
    type Error = StoreError;

    fn try_from(row: CepRow) -> Result<Self, Self::Error> {
        Ok(CepRecord {
            source: row.source.parse()?,
            code: row.code,
            street: row.street,
            city: row.city,
            state: row.state,
            is_single_address: row.is_single_address,
            updated_at: row.updated_at,
        })
    }
}

/// `RecordStore` backed by the `ceps` table in PostgreSQL.
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_existing(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, CepRecord>, StoreError> {
        let rows: Vec<CepRow> = sqlx::query_as(
            r#"
SELECT
    code, street, city, state, is_single_address, source, updated_at
FROM
    ceps
WHERE
    code = ANY($1)
            "#,
        )
        .bind(codes)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            let record = CepRecord::try_from(row)?;
            found.insert(record.code.clone(), record);
        }

        Ok(found)
    }

    async fn insert_if_absent(&self, record: &CepRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO ceps
    (code, street, city, state, is_single_address, source, updated_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (code) DO NOTHING
            "#,
        )
        .bind(&record.code)
        .bind(&record.street)
        .bind(&record.city)
        .bind(&record.state)
        .bind(record.is_single_address)
        .bind(record.source.to_string())
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(())
    }
}
