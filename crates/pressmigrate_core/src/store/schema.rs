use anyhow::{Context, Result};
use rusqlite::{Connection, params};

struct SchemaMigration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[SchemaMigration] = &[
    SchemaMigration {
        version: 1,
        name: "content",
        sql: include_str!("../migrations/v001_content.sql"),
    },
    SchemaMigration {
        version: 2,
        name: "indexes",
        sql: include_str!("../migrations/v002_indexes.sql"),
    },
];

/// Report returned after applying schema migrations.
#[derive(Debug, Clone)]
pub struct SchemaReport {
    pub applied: Vec<AppliedSchemaMigration>,
    pub current_version: u32,
}

#[derive(Debug, Clone)]
pub struct AppliedSchemaMigration {
    pub version: u32,
    pub name: String,
}

pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Apply every pending schema migration, each inside its own savepoint.
pub fn apply_schema(connection: &Connection) -> Result<SchemaReport> {
    ensure_schema_migrations_table(connection)?;
    let current = current_version(connection)?;
    let mut applied = Vec::new();

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        apply_migration(connection, migration).with_context(|| {
            format!(
                "failed to apply schema migration v{:03}_{}",
                migration.version, migration.name
            )
        })?;
        applied.push(AppliedSchemaMigration {
            version: migration.version,
            name: migration.name.to_string(),
        });
    }

    Ok(SchemaReport {
        applied,
        current_version: current_version(connection)?,
    })
}

pub fn pending_count(connection: &Connection) -> Result<usize> {
    ensure_schema_migrations_table(connection)?;
    let current = current_version(connection)?;
    Ok(MIGRATIONS
        .iter()
        .filter(|migration| migration.version > current)
        .count())
}

/// Returns the highest applied version, or 0 if none applied.
pub fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read current schema version")?;
    u32::try_from(version).context("schema version does not fit into u32")
}

fn ensure_schema_migrations_table(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")
}

fn apply_migration(connection: &Connection, migration: &SchemaMigration) -> Result<()> {
    connection
        .execute_batch("SAVEPOINT schema_apply")
        .context("failed to create savepoint")?;

    let result = (|| -> Result<()> {
        connection
            .execute_batch(migration.sql)
            .with_context(|| format!("SQL execution failed for v{:03}", migration.version))?;
        connection
            .execute(
                "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
                params![
                    i64::from(migration.version),
                    migration.name,
                    chrono::Utc::now().timestamp(),
                ],
            )
            .context("failed to record schema migration")?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            connection
                .execute_batch("RELEASE SAVEPOINT schema_apply")
                .context("failed to release savepoint")?;
            Ok(())
        }
        Err(err) => {
            let _ = connection.execute_batch("ROLLBACK TO SAVEPOINT schema_apply");
            let _ = connection.execute_batch("RELEASE SAVEPOINT schema_apply");
            Err(err)
        }
    }
}
