use std::collections::HashSet;

use libsql::params;
use thiserror::Error;
use tracing::info;

use crate::db::{Database, DbError, write_transaction};

struct Migration {
    version: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: "001_rule_store",
        sql: include_str!("../../../migrations/001_rule_store.sql"),
    },
    Migration {
        version: "002_audit_log",
        sql: include_str!("../../../migrations/002_audit_log.sql"),
    },
    Migration {
        version: "003_messages",
        sql: include_str!("../../../migrations/003_messages.sql"),
    },
];

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("migration failed: {0}")]
    LibSql(#[from] libsql::Error),
}

async fn apply_migrations(
    conn: &libsql::Connection,
    migrations: &[Migration],
) -> Result<usize, MigrationError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
        (),
    )
    .await?;

    let mut applied = HashSet::new();
    let mut rows = conn
        .query("SELECT version FROM schema_migrations", ())
        .await?;
    while let Some(row) = rows.next().await? {
        let version: String = row.get(0)?;
        applied.insert(version);
    }

    let mut newly_applied = 0;
    for migration in migrations {
        if applied.contains(migration.version) {
            continue;
        }

        let tx = write_transaction(&conn).await?;
        tx.execute_batch(migration.sql).await?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))",
            params![migration.version],
        )
        .await?;
        tx.commit().await?;
        info!(version = migration.version, "applied migration");
        newly_applied += 1;
    }

    Ok(newly_applied)
}

/// Bring the rule store schema up to date. Returns how many migrations ran.
pub async fn run_migrations(db: &Database) -> Result<usize, MigrationError> {
    let conn = db.connection().await?;
    apply_migrations(&conn, MIGRATIONS).await
}
