//! Two-phase upsert: records are staged into the delta table, then merged
//! into the permanent table by identity in one transaction.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cslb_core::CanonicalRecord;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, info};

pub const PERMANENT_TABLE: &str = "bbb_uploaded_data";
pub const STAGING_TABLE: &str = "delta_bbb_uploaded_data";

/// Column order shared by staging inserts and the merge statement.
pub const RECORD_COLUMNS: [&str; 17] = [
    "uuid",
    "bbb_id",
    "agency_id",
    "business_name",
    "street",
    "city",
    "zip",
    "state_established",
    "date_established",
    "license_nbr",
    "agency_url",
    "phone_number",
    "license_expiration",
    "license_status",
    "reportable_data",
    "agency_name",
    "category",
];

/// Rows per INSERT statement: 17 binds per row stays well under the
/// Postgres limit of 65535 parameters.
pub const MAX_ROWS_PER_STATEMENT: usize = 1000;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("batch rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait UpsertSink: Send + Sync {
    async fn ping(&self) -> Result<(), SinkError>;

    /// Empties the staging table. A run owns staging exclusively from here on.
    async fn clear_staging(&self) -> Result<(), SinkError>;

    /// Stages one batch atomically and returns the rows written.
    async fn stage_batch(&self, batch: &[CanonicalRecord]) -> Result<u64, SinkError>;

    /// Merges everything staged into the permanent table, overwriting every
    /// field on identity collision. Returns rows inserted plus rows updated.
    async fn merge(&self) -> Result<u64, SinkError>;

    async fn close(&self);
}

fn overwrite_assignments() -> String {
    RECORD_COLUMNS
        .iter()
        .skip(1)
        .map(|col| format!("{col} = EXCLUDED.{col}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn staging_insert_prefix() -> String {
    format!(
        "INSERT INTO {STAGING_TABLE} ({}) ",
        RECORD_COLUMNS.join(", ")
    )
}

pub fn staging_conflict_clause() -> String {
    format!(" ON CONFLICT (uuid) DO UPDATE SET {}", overwrite_assignments())
}

pub fn merge_statement() -> String {
    let columns = RECORD_COLUMNS.join(", ");
    format!(
        "INSERT INTO {PERMANENT_TABLE} ({columns}) \
         SELECT {columns} FROM {STAGING_TABLE} \
         ON CONFLICT (uuid) DO UPDATE SET {}, updated_at = CURRENT_TIMESTAMP",
        overwrite_assignments()
    )
}

#[derive(Debug, Clone)]
pub struct PgUpsertSink {
    pool: PgPool,
}

impl PgUpsertSink {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        info!(max_connections, "database pool created");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), SinkError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UpsertSink for PgUpsertSink {
    async fn ping(&self) -> Result<(), SinkError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn clear_staging(&self) -> Result<(), SinkError> {
        let result = sqlx::query(&format!("DELETE FROM {STAGING_TABLE}"))
            .execute(&self.pool)
            .await?;
        info!(removed = result.rows_affected(), "staging table cleared");
        Ok(())
    }

    async fn stage_batch(&self, batch: &[CanonicalRecord]) -> Result<u64, SinkError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for chunk in batch.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(staging_insert_prefix());
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.identity.clone())
                    .push_bind(record.affiliate_id.clone())
                    .push_bind(record.agency_id.clone())
                    .push_bind(record.business_name.clone())
                    .push_bind(record.street.clone())
                    .push_bind(record.city.clone())
                    .push_bind(record.zip.clone())
                    .push_bind(record.state_established.clone())
                    .push_bind(record.date_established.clone())
                    .push_bind(record.license_number.clone())
                    .push_bind(record.source_url.clone())
                    .push_bind(record.phone_number.clone())
                    .push_bind(record.license_expiration.clone())
                    .push_bind(record.license_status.clone())
                    .push_bind(record.reportable_data)
                    .push_bind(record.agency_name.clone())
                    .push_bind(record.category.clone());
            });
            builder.push(staging_conflict_clause());
            written += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        debug!(rows = written, "staged batch");
        Ok(written)
    }

    async fn merge(&self) -> Result<u64, SinkError> {
        // Dropping the transaction on error rolls the whole merge back.
        let mut tx = self.pool.begin().await?;
        let merged = sqlx::query(&merge_statement())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        info!(merged, "merged staging into permanent table");
        Ok(merged)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("database connections closed");
    }
}

#[derive(Debug, Default)]
struct MemoryTables {
    staging: BTreeMap<String, CanonicalRecord>,
    permanent: BTreeMap<String, CanonicalRecord>,
}

/// Process-local sink with the same staging and merge semantics as the
/// Postgres sink. Backs dry runs.
#[derive(Debug, Default)]
pub struct MemoryUpsertSink {
    tables: Mutex<MemoryTables>,
}

impl MemoryUpsertSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn staged_len(&self) -> usize {
        self.lock().staging.len()
    }

    pub fn permanent_len(&self) -> usize {
        self.lock().permanent.len()
    }

    pub fn get(&self, identity: &str) -> Option<CanonicalRecord> {
        self.lock().permanent.get(identity).cloned()
    }

    /// Permanent rows ordered by identity.
    pub fn permanent_records(&self) -> Vec<CanonicalRecord> {
        self.lock().permanent.values().cloned().collect()
    }
}

#[async_trait]
impl UpsertSink for MemoryUpsertSink {
    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn clear_staging(&self) -> Result<(), SinkError> {
        self.lock().staging.clear();
        Ok(())
    }

    async fn stage_batch(&self, batch: &[CanonicalRecord]) -> Result<u64, SinkError> {
        let mut tables = self.lock();
        for record in batch {
            tables
                .staging
                .insert(record.identity.clone(), record.clone());
        }
        Ok(batch.len() as u64)
    }

    async fn merge(&self) -> Result<u64, SinkError> {
        let mut tables = self.lock();
        let MemoryTables { staging, permanent } = &mut *tables;
        for (identity, record) in staging.iter() {
            permanent.insert(identity.clone(), record.clone());
        }
        Ok(staging.len() as u64)
    }

    async fn close(&self) {}
}
