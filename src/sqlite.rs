//!
//! # SQLite migration support
//!
//! This module runs migrations against a SQLite database file using the
//! [`rusqlite`](https://crates.io/crates/rusqlite) crate.
//!
//! ## Serialization of concurrent runs
//!
//! SQLite has no row locks, so the row-locking ledger read used on PostgreSQL has no
//! equivalent here. Instead each migration's transaction begins with `BEGIN IMMEDIATE`,
//! which takes the database write lock up front and serializes concurrent runs against
//! the same database file.
//!
//! ## Example
//!
//! ```no_run
//! use sqlstep::sqlite::{SqliteConnector, SqliteMigrator};
//!
//! # fn main() -> Result<(), sqlstep::Error> {
//! let migrator = SqliteMigrator::new(SqliteConnector::new("app.db"));
//! let report = migrator.run("migrations")?;
//! report.write_json(sqlstep::DEFAULT_REPORT_PATH)?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::core::{ledger_status, LedgerStatus, Migration, LEDGER_TABLE_NAME};
use crate::error::Error;
use crate::report::{MigrationOutcome, MigrationReport};
use crate::source;

/// Opens connections to a SQLite database file.
///
/// The engine opens one connection per operation and closes it before the next one
/// starts, so there is exactly one open connection at any instant.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn connect(&self) -> Result<Connection, Error> {
        Connection::open(&self.path).map_err(|e| Error::Connection(e.to_string()))
    }
}

/// The entrypoint for applying a directory of SQL migration scripts to a SQLite
/// database.
///
/// Owns the `schema_version` ledger: it creates the table on demand, reads the
/// current version and stored checksums, and records each successfully applied
/// migration inside that migration's own transaction.
#[derive(Debug, Clone)]
pub struct SqliteMigrator {
    connector: SqliteConnector,
    ledger_table: String,
}

impl SqliteMigrator {
    pub fn new(connector: SqliteConnector) -> Self {
        Self {
            connector,
            ledger_table: LEDGER_TABLE_NAME.to_string(),
        }
    }

    /// Set a custom name for the ledger table. Defaults to `schema_version`.
    pub fn with_ledger_table_name(mut self, name: impl Into<String>) -> Self {
        self.ledger_table = name.into();
        self
    }

    pub fn ledger_table_name(&self) -> &str {
        &self.ledger_table
    }

    /// Idempotently create the ledger table.
    pub fn ensure_ledger(&self) -> Result<(), Error> {
        let conn = self.connector.connect()?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (version INTEGER PRIMARY KEY, checksum INTEGER)",
                self.ledger_table
            ),
            [],
        )
        .map_err(|e| Error::SchemaVersion(format!("failed to create ledger table: {e}")))?;
        tracing::info!(table = %self.ledger_table, "schema version ledger ready");
        Ok(())
    }

    /// Highest applied version, or 0 if no migrations have been applied.
    pub fn current_version(&self) -> Result<u32, Error> {
        let conn = self.connector.connect()?;
        let version: i64 = conn
            .query_row(
                &format!("SELECT COALESCE(MAX(version), 0) FROM {}", self.ledger_table),
                [],
                |row| row.get(0),
            )
            .map_err(|e| Error::SchemaVersion(format!("failed to read current version: {e}")))?;
        Ok(version as u32)
    }

    /// The checksum recorded when `version` was applied; `None` means never applied.
    pub fn stored_checksum(&self, version: u32) -> Result<Option<u32>, Error> {
        let conn = self.connector.connect()?;
        let checksum = conn
            .query_row(
                &format!("SELECT checksum FROM {} WHERE version = ?1", self.ledger_table),
                params![version as i64],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(checksum.map(|c| c as u32))
    }

    /// Insert a ledger row for `version`. Fails with [`Error::DuplicateVersion`] if a
    /// row for that version already exists.
    pub fn record_applied(&self, version: u32, checksum: u32) -> Result<(), Error> {
        let conn = self.connector.connect()?;
        insert_version_record(&conn, &self.ledger_table, version, checksum)
    }

    /// Apply one migration inside its own transaction.
    ///
    /// Either the script and its ledger row both commit, or neither does. The
    /// connection is closed on every exit path; a close failure is reported as
    /// [`Error::ConnectionClose`] but occurs strictly after commit or rollback.
    pub fn apply(&self, migration: &Migration) -> Result<(), Error> {
        let version = migration.version;
        tracing::info!(version, "starting migration");

        let mut conn = self.connector.connect()?;
        let result = self.apply_in_tx(&mut conn, migration);
        if let Err((_conn, e)) = conn.close() {
            return Err(Error::ConnectionClose {
                version,
                message: e.to_string(),
            });
        }
        result
    }

    fn apply_in_tx(&self, conn: &mut Connection, migration: &Migration) -> Result<(), Error> {
        let version = migration.version;
        // BEGIN IMMEDIATE takes the write lock before any statement runs; the
        // serialization point for concurrent runs against this database file.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Execution {
                version,
                phase: "lock",
                message: e.to_string(),
            })?;

        if let Err(e) = tx.execute_batch(&migration.sql) {
            let cause = Error::Execution {
                version,
                phase: "execute",
                message: e.to_string(),
            };
            return rollback(tx, version, "execute", cause);
        }

        if let Err(e) = insert_version_record(&tx, &self.ledger_table, version, migration.checksum)
        {
            return rollback(tx, version, "record", e);
        }

        tx.commit().map_err(|e| Error::Execution {
            version,
            phase: "commit",
            message: e.to_string(),
        })?;
        tracing::info!(version, "migration committed");
        Ok(())
    }

    /// Run a full migration pass over the scripts in `migrations_dir`.
    ///
    /// Ensures the ledger exists, loads migrations in ascending version order, and
    /// records one outcome per script. Per-migration failures (bad SQL, drift,
    /// duplicate ledger rows) become failed outcomes and the run continues; structural
    /// failures (unparsable file names, ledger read errors) abort the run.
    pub fn run(&self, migrations_dir: impl AsRef<Path>) -> Result<MigrationReport, Error> {
        self.ensure_ledger()?;
        let migrations = source::load_migrations(migrations_dir)?;
        let current = self.current_version()?;
        tracing::info!(current, count = migrations.len(), "beginning migration run");

        let mut report = MigrationReport::new();
        for migration in &migrations {
            let outcome = self.process(migration, current)?;
            report.record(outcome);
        }
        Ok(report)
    }

    /// [`run`](Self::run), then write the report to `report_path`. A report write
    /// failure is fatal but occurs only after all migrations were attempted.
    pub fn run_and_report(
        &self,
        migrations_dir: impl AsRef<Path>,
        report_path: impl AsRef<Path>,
    ) -> Result<MigrationReport, Error> {
        let report = self.run(migrations_dir)?;
        report.write_json(report_path)?;
        Ok(report)
    }

    fn process(&self, migration: &Migration, current: u32) -> Result<MigrationOutcome, Error> {
        let version = migration.version;
        match ledger_status(migration, self.stored_checksum(version)?) {
            LedgerStatus::UpToDate => {
                tracing::info!(version, "migration already applied");
                Ok(MigrationOutcome::already_applied(version))
            }
            LedgerStatus::Drifted { recorded } => {
                let err = Error::Drift {
                    version,
                    recorded,
                    computed: migration.checksum,
                };
                tracing::error!(version, recorded, computed = migration.checksum, "drift detected");
                Ok(MigrationOutcome::failed(version, err.to_string()))
            }
            LedgerStatus::Unapplied if version > current => match self.apply(migration) {
                Ok(()) => Ok(MigrationOutcome::applied(version)),
                Err(e) => {
                    tracing::error!(version, error = %e, "migration failed");
                    Ok(MigrationOutcome::failed(version, e.to_string()))
                }
            },
            LedgerStatus::Unapplied => {
                tracing::warn!(
                    version,
                    current,
                    "migration at or below current version with no ledger record"
                );
                Ok(MigrationOutcome::skipped(version, current))
            }
        }
    }
}

fn insert_version_record(
    conn: &Connection,
    table: &str,
    version: u32,
    checksum: u32,
) -> Result<(), Error> {
    conn.execute(
        &format!("INSERT INTO {table} (version, checksum) VALUES (?1, ?2)"),
        params![version as i64, checksum as i64],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::DuplicateVersion(version)
        }
        other => Error::SchemaVersion(format!("failed to record version {version}: {other}")),
    })?;
    Ok(())
}

fn rollback(
    tx: rusqlite::Transaction<'_>,
    version: u32,
    phase: &'static str,
    cause: Error,
) -> Result<(), Error> {
    match tx.rollback() {
        Ok(()) => {
            tracing::warn!(version, phase, error = %cause, "migration rolled back");
            Err(cause)
        }
        Err(e) => Err(Error::RollbackFailed {
            version,
            phase,
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checksum;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, SqliteMigrator) {
        let dir = tempfile::tempdir().unwrap();
        let migrations_dir = dir.path().join("migrations");
        std::fs::create_dir(&migrations_dir).unwrap();
        let migrator = SqliteMigrator::new(SqliteConnector::new(dir.path().join("test.db")));
        (dir, migrations_dir, migrator)
    }

    fn write_migration(dir: &Path, name: &str, sql: &str) {
        std::fs::write(dir.join(name), sql).unwrap();
    }

    fn table_exists(migrator: &SqliteMigrator, name: &str) -> bool {
        let conn = migrator.connector.connect().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .unwrap();
        count > 0
    }

    #[test]
    fn applies_migrations_in_order_from_clean() {
        let (_dir, migrations_dir, migrator) = setup();
        write_migration(
            &migrations_dir,
            "V1__init.sql",
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
        );
        write_migration(
            &migrations_dir,
            "V2__seed.sql",
            "INSERT INTO users (name) VALUES ('alice')",
        );

        let report = migrator.run(&migrations_dir).unwrap();

        let outcomes = report.outcomes();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(outcomes[0].version, 1);
        assert_eq!(outcomes[1].version, 2);
        assert_eq!(outcomes[0].message, "Migration executed successfully");
        assert_eq!(migrator.current_version().unwrap(), 2);

        let conn = migrator.connector.connect().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn second_run_is_idempotent() {
        let (_dir, migrations_dir, migrator) = setup();
        write_migration(
            &migrations_dir,
            "V1__init.sql",
            "CREATE TABLE users (id INTEGER PRIMARY KEY)",
        );
        write_migration(
            &migrations_dir,
            "V2__posts.sql",
            "CREATE TABLE posts (id INTEGER PRIMARY KEY)",
        );

        migrator.run(&migrations_dir).unwrap();
        let second = migrator.run(&migrations_dir).unwrap();

        assert_eq!(second.outcomes().len(), 2);
        for outcome in second.outcomes() {
            assert!(outcome.success);
            assert_eq!(outcome.message, "Migration already applied");
        }
        assert_eq!(migrator.current_version().unwrap(), 2);
    }

    #[test]
    fn modified_applied_migration_is_reported_as_drift() {
        let (_dir, migrations_dir, migrator) = setup();
        write_migration(
            &migrations_dir,
            "V1__init.sql",
            "CREATE TABLE users (id INTEGER PRIMARY KEY)",
        );
        migrator.run(&migrations_dir).unwrap();

        // Rewrite the already-applied script with different content
        write_migration(
            &migrations_dir,
            "V1__init.sql",
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
        );
        let report = migrator.run(&migrations_dir).unwrap();

        let outcomes = report.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
        assert!(
            outcomes[0].message.contains("checksum mismatch"),
            "unexpected message: {}",
            outcomes[0].message
        );
        // No duplicate-key insert was attempted and the ledger is untouched
        assert_eq!(migrator.current_version().unwrap(), 1);
    }

    #[test]
    fn failed_migration_rolls_back_and_run_continues() {
        let (_dir, migrations_dir, migrator) = setup();
        write_migration(
            &migrations_dir,
            "V1__init.sql",
            "CREATE TABLE users (id INTEGER PRIMARY KEY)",
        );
        // First statement succeeds, second fails; the whole batch must roll back
        write_migration(
            &migrations_dir,
            "V2__broken.sql",
            "CREATE TABLE halfway (id INTEGER);\nINSERT INTO missing_table VALUES (1);",
        );
        write_migration(
            &migrations_dir,
            "V3__comments.sql",
            "CREATE TABLE comments (id INTEGER PRIMARY KEY)",
        );

        let report = migrator.run(&migrations_dir).unwrap();

        let outcomes = report.outcomes();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(outcomes[2].success);

        // Atomicity: no trace of migration 2, later migration 3 still committed
        assert!(!table_exists(&migrator, "halfway"));
        assert!(table_exists(&migrator, "comments"));
        assert!(migrator.stored_checksum(2).unwrap().is_none());
        assert_eq!(migrator.current_version().unwrap(), 3);
    }

    #[test]
    fn absent_migrations_directory_yields_empty_run() {
        let (dir, _migrations_dir, migrator) = setup();
        let missing = dir.path().join("no-such-dir");

        let report = migrator.run(&missing).unwrap();

        assert!(report.outcomes().is_empty());
        // The ledger was still created
        assert!(table_exists(&migrator, LEDGER_TABLE_NAME));
        assert_eq!(migrator.current_version().unwrap(), 0);
    }

    #[test]
    fn gap_below_current_is_reported_as_skipped() {
        let (_dir, migrations_dir, migrator) = setup();
        migrator.ensure_ledger().unwrap();
        migrator.record_applied(2, 99).unwrap();
        write_migration(&migrations_dir, "V1__one.sql", "CREATE TABLE one (id INTEGER)");

        let report = migrator.run(&migrations_dir).unwrap();

        let outcomes = report.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert!(
            outcomes[0].message.contains("at or below current version"),
            "unexpected message: {}",
            outcomes[0].message
        );
        // The gap migration was not executed
        assert!(migrator.stored_checksum(1).unwrap().is_none());
        assert!(!table_exists(&migrator, "one"));
    }

    #[test]
    fn record_applied_rejects_duplicate_version() {
        let (_dir, _migrations_dir, migrator) = setup();
        migrator.ensure_ledger().unwrap();
        migrator.record_applied(1, 42).unwrap();

        let err = migrator.record_applied(1, 43).unwrap_err();
        assert!(matches!(err, Error::DuplicateVersion(1)), "got {err:?}");
    }

    #[test]
    fn ensure_ledger_is_idempotent() {
        let (_dir, _migrations_dir, migrator) = setup();
        migrator.ensure_ledger().unwrap();
        migrator.ensure_ledger().unwrap();
        assert_eq!(migrator.current_version().unwrap(), 0);
    }

    #[test]
    fn apply_records_version_and_checksum() {
        let (_dir, _migrations_dir, migrator) = setup();
        migrator.ensure_ledger().unwrap();

        let migration = Migration::new(1, "CREATE TABLE t (id INTEGER)");
        migrator.apply(&migration).unwrap();

        assert_eq!(
            migrator.stored_checksum(1).unwrap(),
            Some(checksum("CREATE TABLE t (id INTEGER)"))
        );
        assert_eq!(migrator.current_version().unwrap(), 1);
    }

    #[test]
    fn apply_surfaces_execution_failure_with_context() {
        let (_dir, _migrations_dir, migrator) = setup();
        migrator.ensure_ledger().unwrap();

        let migration = Migration::new(7, "THIS IS NOT SQL");
        let err = migrator.apply(&migration).unwrap_err();
        assert!(
            matches!(
                err,
                Error::Execution {
                    version: 7,
                    phase: "execute",
                    ..
                }
            ),
            "got {err:?}"
        );
        assert!(migrator.stored_checksum(7).unwrap().is_none());
    }

    #[test]
    fn run_writes_report_file() {
        let (dir, migrations_dir, migrator) = setup();
        write_migration(
            &migrations_dir,
            "V1__init.sql",
            "CREATE TABLE users (id INTEGER PRIMARY KEY)",
        );
        let report_path = dir.path().join("migration-report.json");

        migrator.run_and_report(&migrations_dir, &report_path).unwrap();

        let text = std::fs::read_to_string(&report_path).unwrap();
        let parsed: Vec<MigrationOutcome> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].version, 1);
        assert!(parsed[0].success);
    }
}
