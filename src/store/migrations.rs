//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially. The four
//! job tables share one column shape on purpose — the sentinel is
//! polymorphic over table identity.

use libsql::Connection;

use crate::error::StorageError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
            CREATE TABLE IF NOT EXISTS ocr_jobs (
                id TEXT PRIMARY KEY,
                deal_id TEXT,
                document_id TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5,
                last_error TEXT,
                leased_until TEXT,
                lease_owner TEXT,
                next_run_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_ocr_jobs_status ON ocr_jobs(status);
            CREATE INDEX IF NOT EXISTS idx_ocr_jobs_deal ON ocr_jobs(deal_id);
            CREATE INDEX IF NOT EXISTS idx_ocr_jobs_document ON ocr_jobs(document_id);

            CREATE TABLE IF NOT EXISTS classify_jobs (
                id TEXT PRIMARY KEY,
                deal_id TEXT,
                document_id TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5,
                last_error TEXT,
                leased_until TEXT,
                lease_owner TEXT,
                next_run_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_classify_jobs_status ON classify_jobs(status);
            CREATE INDEX IF NOT EXISTS idx_classify_jobs_deal ON classify_jobs(deal_id);
            CREATE INDEX IF NOT EXISTS idx_classify_jobs_document ON classify_jobs(document_id);

            CREATE TABLE IF NOT EXISTS extract_jobs (
                id TEXT PRIMARY KEY,
                deal_id TEXT,
                document_id TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5,
                last_error TEXT,
                leased_until TEXT,
                lease_owner TEXT,
                next_run_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_extract_jobs_status ON extract_jobs(status);
            CREATE INDEX IF NOT EXISTS idx_extract_jobs_deal ON extract_jobs(deal_id);
            CREATE INDEX IF NOT EXISTS idx_extract_jobs_document ON extract_jobs(document_id);

            CREATE TABLE IF NOT EXISTS report_jobs (
                id TEXT PRIMARY KEY,
                deal_id TEXT,
                document_id TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5,
                last_error TEXT,
                leased_until TEXT,
                lease_owner TEXT,
                next_run_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_report_jobs_status ON report_jobs(status);
            CREATE INDEX IF NOT EXISTS idx_report_jobs_deal ON report_jobs(deal_id);
            CREATE INDEX IF NOT EXISTS idx_report_jobs_document ON report_jobs(document_id);

            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'alive',
                last_heartbeat_at TEXT NOT NULL,
                jobs_processed INTEGER NOT NULL DEFAULT 0,
                jobs_failed INTEGER NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_workers_status ON workers(status);

            CREATE TABLE IF NOT EXISTS system_events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                severity TEXT NOT NULL DEFAULT 'info',
                signature TEXT,
                source TEXT NOT NULL,
                job_id TEXT,
                job_source TEXT,
                deal_id TEXT,
                document_id TEXT,
                error_class TEXT,
                error_code TEXT,
                message TEXT NOT NULL,
                stack TEXT,
                resolution_status TEXT NOT NULL DEFAULT 'open',
                resolved_by TEXT,
                resolved_at TEXT,
                resolution_note TEXT,
                attempt INTEGER,
                max_attempts INTEGER,
                next_retry_at TEXT,
                payload TEXT,
                environment TEXT NOT NULL DEFAULT '',
                release TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_events_signature ON system_events(signature);
            CREATE INDEX IF NOT EXISTS idx_events_resolution ON system_events(resolution_status);
            CREATE INDEX IF NOT EXISTS idx_events_code ON system_events(error_code);
            CREATE INDEX IF NOT EXISTS idx_events_job ON system_events(job_id);
            CREATE INDEX IF NOT EXISTS idx_events_deal ON system_events(deal_id);
            CREATE INDEX IF NOT EXISTS idx_events_created ON system_events(created_at);

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                deal_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_documents_deal ON documents(deal_id);
            CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);

            CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                deal_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                started_generating_at TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_reports_deal ON reports(deal_id);
            CREATE INDEX IF NOT EXISTS idx_reports_status ON reports(status);
        "#,
}];

/// Run all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| StorageError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StorageError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, StorageError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StorageError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StorageError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                StorageError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StorageError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "ocr_jobs",
            "classify_jobs",
            "extract_jobs",
            "report_jobs",
            "workers",
            "system_events",
            "documents",
            "reports",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 1);
    }
}
