//! Version-tracked database migrations for the libSQL backend.
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
        name: "customers_and_conversations",
        sql: r#"
            CREATE TABLE IF NOT EXISTS customers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                platform TEXT NOT NULL,
                platform_user_id TEXT NOT NULL,
                name TEXT,
                email TEXT,
                phone TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (platform, platform_user_id)
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                customer_id INTEGER NOT NULL REFERENCES customers(id),
                platform TEXT NOT NULL,
                platform_message_id TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                raw_data TEXT,
                received_at TEXT NOT NULL,
                ai_replied INTEGER NOT NULL DEFAULT 0,
                ai_reply_content TEXT,
                ai_reply_at TEXT,
                priority TEXT NOT NULL DEFAULT 'low',
                filtered INTEGER NOT NULL DEFAULT 0,
                filter_reason TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (platform, platform_message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_customer
                ON conversations(customer_id, received_at);
            CREATE INDEX IF NOT EXISTS idx_conversations_unreplied
                ON conversations(ai_replied, received_at);
        "#,
    },
    Migration {
        version: 2,
        name: "prompt_experiments",
        sql: r#"
            CREATE TABLE IF NOT EXISTS prompt_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version_code TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                content TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                total_uses INTEGER NOT NULL DEFAULT 0,
                avg_response_time_ms REAL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_prompt_versions_active
                ON prompt_versions(is_active, created_at);

            CREATE TABLE IF NOT EXISTS prompt_usage_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version_id INTEGER NOT NULL REFERENCES prompt_versions(id),
                customer_id INTEGER NOT NULL,
                conversation_id INTEGER,
                response_time_ms INTEGER NOT NULL,
                tokens_used INTEGER,
                cost TEXT,
                success INTEGER NOT NULL,
                error TEXT,
                used_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_prompt_usage_version
                ON prompt_usage_logs(version_id, used_at);
        "#,
    },
    Migration {
        version: 3,
        name: "reply_retry_budget",
        sql: r#"
            ALTER TABLE conversations ADD COLUMN reply_attempts INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE conversations ADD COLUMN review_requested INTEGER NOT NULL DEFAULT 0;
        "#,
    },
];

/// Run all pending migrations against the given connection.
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

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
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
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
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
