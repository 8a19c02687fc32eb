//! Version-tracked schema migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 3,
                depends_on TEXT NOT NULL DEFAULT '[]',
                blocked_by TEXT NOT NULL DEFAULT '[]',
                file_scope TEXT NOT NULL DEFAULT '[]',
                assigned_to TEXT,
                assigned_at TEXT,
                started_at TEXT,
                completed_at TEXT,
                result_summary TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_assigned_to ON tasks(assigned_to);
            CREATE INDEX IF NOT EXISTS idx_tasks_order ON tasks(priority DESC, created_at ASC);

            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                current_task_id TEXT,
                capabilities TEXT NOT NULL DEFAULT '[]',
                last_heartbeat TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_workers_status ON workers(status);

            CREATE TABLE IF NOT EXISTS activity (
                id TEXT PRIMARY KEY,
                worker_id TEXT,
                task_id TEXT,
                event_type TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                metadata TEXT NOT NULL DEFAULT 'null',
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_activity_timestamp ON activity(timestamp);
            CREATE INDEX IF NOT EXISTS idx_activity_task ON activity(task_id);

            CREATE TABLE IF NOT EXISTS changes (
                id TEXT PRIMARY KEY,
                worker_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                change_type TEXT NOT NULL,
                lines_added INTEGER NOT NULL DEFAULT 0,
                lines_removed INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_changes_timestamp ON changes(timestamp);
            CREATE INDEX IF NOT EXISTS idx_changes_file_path ON changes(file_path);

            CREATE TABLE IF NOT EXISTS conflicts (
                id TEXT PRIMARY KEY,
                conflict_type TEXT NOT NULL,
                status TEXT NOT NULL,
                worker_ids TEXT NOT NULL DEFAULT '[]',
                task_ids TEXT NOT NULL DEFAULT '[]',
                file_paths TEXT NOT NULL DEFAULT '[]',
                resolution TEXT,
                detected_at TEXT NOT NULL,
                resolved_at TEXT,
                version INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts(status);
        "#,
    },
    Migration {
        version: 2,
        name: "task_routing_fields",
        sql: r#"
            ALTER TABLE tasks ADD COLUMN labels TEXT NOT NULL DEFAULT '[]';
            ALTER TABLE tasks ADD COLUMN required_capabilities TEXT NOT NULL DEFAULT '[]';
            ALTER TABLE tasks ADD COLUMN estimated_complexity TEXT NOT NULL DEFAULT 'medium';
            ALTER TABLE tasks ADD COLUMN unblock_processed INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE workers ADD COLUMN last_completed_task_id TEXT;
            CREATE INDEX IF NOT EXISTS idx_tasks_unblock ON tasks(status, unblock_processed);
        "#,
    },
    Migration {
        version: 3,
        name: "usage_accounting",
        sql: r#"
            ALTER TABLE tasks ADD COLUMN tokens_used INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE tasks ADD COLUMN cost_usd TEXT NOT NULL DEFAULT '0';
            ALTER TABLE tasks ADD COLUMN duration_ms INTEGER NOT NULL DEFAULT 0;

            ALTER TABLE workers ADD COLUMN tasks_completed INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE workers ADD COLUMN tasks_failed INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE workers ADD COLUMN total_tokens_used INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE workers ADD COLUMN total_cost_usd TEXT NOT NULL DEFAULT '0';

            ALTER TABLE activity ADD COLUMN files_changed TEXT NOT NULL DEFAULT '[]';
            ALTER TABLE activity ADD COLUMN tokens_used INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE activity ADD COLUMN cost_usd TEXT NOT NULL DEFAULT '0';
            ALTER TABLE activity ADD COLUMN duration_ms INTEGER NOT NULL DEFAULT 0;
        "#,
    },
];

/// Run all pending migrations.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    if tracing::enabled!(tracing::Level::DEBUG) {
        let version = get_current_version(conn).await?;
        tracing::debug!(version = version, "Database migrations complete");
    }
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
