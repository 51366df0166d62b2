use sqlx::PgPool;

use crate::config::PostgresConfig;

/// Run database migrations, creating required tables if they do not exist.
///
/// This creates the session ledger table plus the header and chunk tables of
/// the configured archive bucket.
///
/// # Errors
///
/// Returns a [`sqlx::Error`] if any DDL statement fails.
pub async fn run_migrations(pool: &PgPool, config: &PostgresConfig) -> Result<(), sqlx::Error> {
    let sessions_table = config.sessions_table();
    let files_table = config.files_table();
    let chunks_table = config.chunks_table();

    let create_sessions = format!(
        "CREATE TABLE IF NOT EXISTS {sessions_table} (
            id TEXT PRIMARY KEY,
            archive_ref TEXT NOT NULL,
            size_bytes BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )"
    );

    let create_files = format!(
        "CREATE TABLE IF NOT EXISTS {files_table} (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            length BIGINT NOT NULL,
            chunk_size INTEGER NOT NULL,
            uploaded_at TIMESTAMPTZ NOT NULL,
            metadata TEXT NOT NULL
        )"
    );

    // No foreign key to the header table: chunks are written before their
    // header exists.
    let create_chunks = format!(
        "CREATE TABLE IF NOT EXISTS {chunks_table} (
            files_id TEXT NOT NULL,
            n INTEGER NOT NULL,
            data BYTEA NOT NULL,
            PRIMARY KEY (files_id, n)
        )"
    );

    let create_files_uploaded_idx = format!(
        "CREATE INDEX IF NOT EXISTS {}{}_files_uploaded_at_idx ON {files_table} (uploaded_at)",
        config.table_prefix, config.bucket
    );

    sqlx::query(&create_sessions).execute(pool).await?;
    sqlx::query(&create_files).execute(pool).await?;
    sqlx::query(&create_chunks).execute(pool).await?;
    sqlx::query(&create_files_uploaded_idx)
        .execute(pool)
        .await?;

    Ok(())
}
