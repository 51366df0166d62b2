use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use tether_core::{ArchiveRef, SessionId, SessionRecord};
use tether_store::error::LedgerError;
use tether_store::ledger::SessionLedger;

use crate::config::PostgresConfig;

type RecordRow = (String, String, i64, DateTime<Utc>, DateTime<Utc>);

fn record_from_row(row: RecordRow) -> Result<SessionRecord, LedgerError> {
    let (id, archive_ref, size_bytes, created_at, updated_at) = row;
    let id = SessionId::parse(id).map_err(|e| LedgerError::Serialization(e.to_string()))?;
    let size_bytes = u64::try_from(size_bytes)
        .map_err(|_| LedgerError::Serialization(format!("negative size for session {id}")))?;
    Ok(SessionRecord {
        id,
        archive_ref: ArchiveRef::new(archive_ref),
        size_bytes,
        created_at,
        updated_at,
    })
}

/// PostgreSQL-backed implementation of [`SessionLedger`].
///
/// The primary key on `id` enforces one record per session.
pub struct PostgresSessionLedger {
    pool: PgPool,
    config: Arc<PostgresConfig>,
}

impl PostgresSessionLedger {
    /// Create a ledger over an existing pool.
    ///
    /// Does not run migrations; call [`crate::run_migrations`] first.
    pub fn new(pool: PgPool, config: PostgresConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl SessionLedger for PostgresSessionLedger {
    async fn find(&self, id: &SessionId) -> Result<Option<SessionRecord>, LedgerError> {
        let query = format!(
            "SELECT id, archive_ref, size_bytes, created_at, updated_at FROM {} WHERE id = $1",
            self.config.sessions_table()
        );
        let row: Option<RecordRow> = sqlx::query_as(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::Backend(e.to_string()))?;
        row.map(record_from_row).transpose()
    }

    async fn upsert(
        &self,
        id: &SessionId,
        archive_ref: &ArchiveRef,
        size_bytes: u64,
    ) -> Result<SessionRecord, LedgerError> {
        let table = self.config.sessions_table();
        let query = format!(
            "INSERT INTO {table} (id, archive_ref, size_bytes, created_at, updated_at)
             VALUES ($1, $2, $3, NOW(), NOW())
             ON CONFLICT (id) DO UPDATE SET
                archive_ref = EXCLUDED.archive_ref,
                size_bytes = EXCLUDED.size_bytes,
                updated_at = EXCLUDED.updated_at
             RETURNING id, archive_ref, size_bytes, created_at, updated_at"
        );
        let size = i64::try_from(size_bytes)
            .map_err(|_| LedgerError::Serialization("archive size out of range".into()))?;

        let row: RecordRow = sqlx::query_as(&query)
            .bind(id.as_str())
            .bind(archive_ref.as_str())
            .bind(size)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LedgerError::Backend(e.to_string()))?;
        record_from_row(row)
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, LedgerError> {
        let query = format!("DELETE FROM {} WHERE id = $1", self.config.sessions_table());
        let result = sqlx::query(&query)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| LedgerError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, LedgerError> {
        let query = format!(
            "SELECT id, archive_ref, size_bytes, created_at, updated_at FROM {} ORDER BY id COLLATE \"C\"",
            self.config.sessions_table()
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LedgerError::Backend(e.to_string()))?;
        rows.into_iter().map(record_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_with_invalid_id_is_rejected() {
        let now = Utc::now();
        let row: RecordRow = ("bad id!".into(), "ref".into(), 1, now, now);
        assert!(matches!(
            record_from_row(row),
            Err(LedgerError::Serialization(_))
        ));
    }

    #[test]
    fn row_converts_to_record() {
        let now = Utc::now();
        let row: RecordRow = ("main".into(), "ref-1".into(), 2048, now, now);
        let record = record_from_row(row).unwrap();
        assert_eq!(record.id.as_str(), "main");
        assert_eq!(record.size_bytes, 2048);
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use crate::connect::connect_lazy;
    use crate::migrations::run_migrations;

    fn test_config() -> PostgresConfig {
        PostgresConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/tether_test".to_string()),
            table_prefix: format!("test_{}_", uuid::Uuid::new_v4().simple()),
            ..PostgresConfig::default()
        }
    }

    #[tokio::test]
    async fn ledger_conformance() {
        let config = test_config();
        let pool = connect_lazy(&config).expect("pool creation should succeed");
        run_migrations(&pool, &config)
            .await
            .expect("migrations should succeed");
        let ledger = PostgresSessionLedger::new(pool, config);
        tether_store::testing::run_ledger_conformance_tests(&ledger)
            .await
            .expect("conformance tests should pass");
    }
}
