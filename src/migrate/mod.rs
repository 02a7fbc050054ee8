//! Schema bootstrap for the traffic store.
//!
//! Creates the database when missing, then applies embedded, versioned SQL
//! migrations. The applied version lives in `schema_migrations` using the
//! golang-migrate layout (`version`, `dirty`, `sequence`).

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;
use crate::store::clickhouse::build_dsn;

/// Replaced by the configured traffic table name before execution.
const TRAFFIC_TABLE_PLACEHOLDER: &str = "{traffic_table}";

struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// Ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_init.up.sql"),
    down_sql: include_str!("sql/001_init.down.sql"),
}];

/// Applies and rolls back schema versions.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

pub struct ClickHouseMigrator {
    pool: Pool,
    traffic_table: String,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool, traffic_table: impl Into<String>) -> Self {
        Self {
            pool,
            traffic_table: traffic_table.into(),
        }
    }

    async fn run(&self, statements: &[&str], what: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting ClickHouse handle for {what}"))?;

        for statement in statements {
            handle.execute(*statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("{what}: {preview}")
            })?;
        }

        Ok(())
    }

    async fn ensure_version_table(&self) -> Result<()> {
        self.run(
            &["CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog"],
            "creating schema_migrations",
        )
        .await
    }

    async fn read_version(&self) -> Result<(u32, bool)> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version check")?;

        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying migration version")?;

        let Some(row) = block.rows().next() else {
            return Ok((0, false));
        };

        let version: i64 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty flag")?;

        let version = u32::try_from(version)
            .with_context(|| format!("migration version {version} out of range"))?;

        Ok((version, dirty != 0))
    }

    /// Replaces the tracked version. Version 0 clears the table.
    async fn write_version(&self, version: u32, dirty: bool) -> Result<()> {
        let insert = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {}, 1)",
            u8::from(dirty)
        );

        let mut statements = vec!["TRUNCATE TABLE schema_migrations"];
        if version > 0 {
            statements.push(insert.as_str());
        }

        self.run(&statements, "updating schema_migrations").await
    }

    async fn apply(&self, version: u32, sql: &str) -> Result<()> {
        let sql = render(sql, &self.traffic_table);
        let statements = split_statements(&sql);
        self.run(&statements, &format!("migration {version}")).await
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_version_table().await?;

        let (current, dirty) = self.read_version().await?;
        if dirty {
            anyhow::bail!("migration version {current} is dirty, manual intervention required");
        }

        let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
        if pending.is_empty() {
            tracing::info!(version = current, "schema up to date");
            return Ok(());
        }

        for migration in &pending {
            tracing::info!(version = migration.version, "applying migration");

            self.write_version(migration.version, true).await?;
            self.apply(migration.version, migration.up_sql).await?;
            self.write_version(migration.version, false).await?;
        }

        tracing::info!(
            from = current,
            to = pending.last().map_or(current, |m| m.version),
            applied = pending.len(),
            "migrations completed"
        );

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_version_table().await?;

        let (current, _) = self.read_version().await?;
        if current == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current)
            .with_context(|| format!("migration version {current} not found"))?;

        let previous = previous_version(current);

        tracing::info!(from = current, to = previous, "rolling back migration");

        self.write_version(current, true).await?;
        self.apply(current, migration.down_sql).await?;
        self.write_version(previous, false).await?;

        Ok(())
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_version_table().await?;
        self.read_version().await
    }
}

/// Creates the configured database when it does not exist yet.
///
/// Connects through the server's `default` database since the target may be
/// missing.
pub async fn ensure_database(cfg: &ClickHouseConfig) -> Result<()> {
    let pool = Pool::new(build_dsn(cfg, "default"));

    let mut handle = pool
        .get_handle()
        .await
        .context("getting ClickHouse handle for database creation")?;

    handle
        .execute(format!("CREATE DATABASE IF NOT EXISTS `{}`", cfg.database))
        .await
        .with_context(|| format!("creating database {}", cfg.database))?;

    tracing::info!(database = %cfg.database, "database ready");

    Ok(())
}

fn previous_version(current: u32) -> u32 {
    MIGRATIONS
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < current)
        .max()
        .unwrap_or(0)
}

fn render(sql: &str, traffic_table: &str) -> String {
    sql.replace(TRAFFIC_TABLE_PLACEHOLDER, traffic_table)
}

/// Splits SQL text on semicolons, dropping blank segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements() {
        let stmts = split_statements("CREATE TABLE a (id Int32);\n\n  ;CREATE TABLE b (id Int32);;");
        assert_eq!(stmts, vec!["CREATE TABLE a (id Int32)", "CREATE TABLE b (id Int32)"]);
        assert!(split_statements("  \n ").is_empty());
    }

    #[test]
    fn test_render_substitutes_traffic_table() {
        let up = render(MIGRATIONS[0].up_sql, "traffic_data");
        assert!(up.contains("CREATE TABLE IF NOT EXISTS traffic_data ("));
        assert!(up.contains("CREATE TABLE IF NOT EXISTS predictions ("));
        assert!(!up.contains(TRAFFIC_TABLE_PLACEHOLDER));

        let down = render(MIGRATIONS[0].down_sql, "packets");
        assert!(down.contains("DROP TABLE IF EXISTS packets"));
    }

    #[test]
    fn test_init_migration_has_store_columns() {
        let up = MIGRATIONS[0].up_sql;
        for column in [
            "timestamp",
            "source_ip",
            "destination_ip",
            "protocol",
            "packet_size",
            "anomaly_detected",
        ] {
            assert!(up.contains(column), "missing column {column}");
        }
        assert_eq!(split_statements(up).len(), 2);
    }

    #[test]
    fn test_migrations_ordered_and_non_empty() {
        for m in MIGRATIONS {
            assert!(m.version > 0);
            assert!(!m.up_sql.trim().is_empty(), "migration {} up", m.version);
            assert!(!m.down_sql.trim().is_empty(), "migration {} down", m.version);
        }
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn test_previous_version() {
        assert_eq!(previous_version(1), 0);
        assert_eq!(previous_version(0), 0);
    }
}
