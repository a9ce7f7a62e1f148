//! Versioned schema migrations
//!
//! Migrations are numbered, forward-only functions with an optional inverse.
//! Each pending version runs inside its own IMMEDIATE transaction together
//! with its `schema_migrations` bookkeeping row, so a crash mid-migration
//! leaves the schema at a clean version boundary. Applying is idempotent.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};

type MigrationFn = fn(&Transaction) -> rusqlite::Result<()>;

/// A single schema migration
pub struct Migration {
    pub version: i64,
    pub up: MigrationFn,
    pub down: Option<MigrationFn>,
}

fn migration_1_up(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS positions (
            position_id TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT
        );
        CREATE TABLE IF NOT EXISTS orders (
            order_id TEXT PRIMARY KEY,
            position_id TEXT,
            value TEXT NOT NULL,
            state TEXT,
            created_at TEXT,
            updated_at TEXT
        );",
    )
}

fn migration_1_down(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "DROP TABLE IF EXISTS orders;
        DROP TABLE IF EXISTS positions;",
    )
}

fn migration_2_up(tx: &Transaction) -> rusqlite::Result<()> {
    // reconciliation scans by position and by order state
    tx.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_orders_position_id ON orders(position_id);
        CREATE INDEX IF NOT EXISTS idx_orders_state ON orders(state);",
    )
}

fn migration_2_down(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "DROP INDEX IF EXISTS idx_orders_position_id;
        DROP INDEX IF EXISTS idx_orders_state;",
    )
}

/// All known migrations, ascending by version.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up: migration_1_up,
        down: Some(migration_1_down),
    },
    Migration {
        version: 2,
        up: migration_2_up,
        down: Some(migration_2_down),
    },
];

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )
    .context("Failed to create schema_migrations table")?;
    Ok(())
}

/// Versions currently recorded as applied.
pub fn applied_versions(conn: &Connection) -> Result<Vec<i64>> {
    ensure_migrations_table(conn)?;
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(versions)
}

/// Apply every pending migration; returns the versions applied by this call.
pub fn apply_migrations(conn: &mut Connection) -> Result<Vec<i64>> {
    let applied = applied_versions(conn)?;

    let mut applied_now = Vec::new();
    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin migration transaction")?;
        (migration.up)(&tx)
            .with_context(|| format!("Migration {} failed", migration.version))?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES(?1, ?2)",
            params![migration.version, Utc::now().to_rfc3339()],
        )?;
        tx.commit()
            .with_context(|| format!("Failed to commit migration {}", migration.version))?;
        tracing::info!("Applied schema migration {}", migration.version);
        applied_now.push(migration.version);
    }

    Ok(applied_now)
}

/// Roll back a specific version using its registered inverse.
pub fn rollback_migration(conn: &mut Connection, version: i64) -> Result<()> {
    let migration = MIGRATIONS
        .iter()
        .find(|m| m.version == version)
        .with_context(|| format!("Unknown migration version {version}"))?;
    let down = migration
        .down
        .with_context(|| format!("No down migration registered for version {version}"))?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("Failed to begin rollback transaction")?;
    down(&tx).with_context(|| format!("Rollback of migration {version} failed"))?;
    tx.execute(
        "DELETE FROM schema_migrations WHERE version = ?1",
        params![version],
    )?;
    tx.commit()
        .with_context(|| format!("Failed to commit rollback of migration {version}"))?;
    tracing::info!("Rolled back schema migration {}", version);
    Ok(())
}

/// Roll back the most recently applied migration; returns its version.
pub fn rollback_last(conn: &mut Connection) -> Result<Option<i64>> {
    ensure_migrations_table(conn)?;
    let last: Option<i64> = conn
        .query_row(
            "SELECT version FROM schema_migrations ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match last {
        Some(version) => {
            rollback_migration(conn, version)?;
            Ok(Some(version))
        }
        None => Ok(None),
    }
}
