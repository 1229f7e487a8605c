//!
//! # PostgreSQL migration support
//!
//! This module runs migrations against a PostgreSQL database using the
//! [`postgres`](https://crates.io/crates/postgres) crate.
//!
//! ## Serialization of concurrent runs
//!
//! Each migration's transaction begins with a row-locking read against the ledger
//! (`SELECT version FROM schema_version FOR UPDATE`), held until commit or rollback.
//! Two runs against the same database therefore apply migrations one at a time.
//! The lock is best-effort: a locking read against an empty ledger locks no rows, so
//! two processes that both see version 0 can both attempt migration 1. The loser
//! fails on the ledger's primary key and reports a duplicate-version outcome.
//!
//! PostgreSQL supports transactional DDL, so a failed migration rolls back
//! completely, including any statements that had already run.
//!
//! ## Example
//!
//! ```no_run
//! use sqlstep::DbConfig;
//! use sqlstep::postgres::{PostgresConnector, PostgresMigrator};
//!
//! # fn main() -> Result<(), sqlstep::Error> {
//! let config = DbConfig::from_file("db.toml")?;
//! let migrator = PostgresMigrator::new(PostgresConnector::new(config));
//! let report = migrator.run_and_report("migrations", "migration-report.json")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use postgres::error::SqlState;
use postgres::{Client, GenericClient, NoTls};

use crate::config::DbConfig;
use crate::core::{ledger_status, LedgerStatus, Migration, LEDGER_TABLE_NAME};
use crate::error::Error;
use crate::report::{MigrationOutcome, MigrationReport};
use crate::source;

/// Opens connections to a PostgreSQL database from a [`DbConfig`].
///
/// The engine opens one connection per operation and closes it before the next one
/// starts; no pooling.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    config: DbConfig,
}

impl PostgresConnector {
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }

    fn pg_config(&self) -> Result<postgres::Config, Error> {
        let mut config: postgres::Config = self
            .config
            .url
            .parse()
            .map_err(|e| Error::Connection(format!("invalid database url: {e}")))?;
        config.user(&self.config.user);
        config.password(&self.config.password);
        Ok(config)
    }

    pub fn connect(&self) -> Result<Client, Error> {
        self.pg_config()?
            .connect(NoTls)
            .map_err(|e| Error::Connection(e.to_string()))
    }
}

/// The entrypoint for applying a directory of SQL migration scripts to a PostgreSQL
/// database.
#[derive(Debug, Clone)]
pub struct PostgresMigrator {
    connector: PostgresConnector,
    ledger_table: String,
}

impl PostgresMigrator {
    pub fn new(connector: PostgresConnector) -> Self {
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
        let mut client = self.connector.connect()?;
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {} (version INTEGER PRIMARY KEY, checksum INTEGER)",
                self.ledger_table
            ))
            .map_err(|e| Error::SchemaVersion(format!("failed to create ledger table: {e}")))?;
        tracing::info!(table = %self.ledger_table, "schema version ledger ready");
        Ok(())
    }

    /// Highest applied version, or 0 if no migrations have been applied.
    pub fn current_version(&self) -> Result<u32, Error> {
        let mut client = self.connector.connect()?;
        let row = client
            .query_one(
                &format!("SELECT COALESCE(MAX(version), 0) FROM {}", self.ledger_table),
                &[],
            )
            .map_err(|e| Error::SchemaVersion(format!("failed to read current version: {e}")))?;
        let version: i32 = row.get(0);
        Ok(version as u32)
    }

    /// The checksum recorded when `version` was applied; `None` means never applied.
    pub fn stored_checksum(&self, version: u32) -> Result<Option<u32>, Error> {
        let mut client = self.connector.connect()?;
        let row = client.query_opt(
            &format!("SELECT checksum FROM {} WHERE version = $1", self.ledger_table),
            &[&(version as i32)],
        )?;
        Ok(row.map(|row| {
            let checksum: i32 = row.get(0);
            checksum as u32
        }))
    }

    /// Insert a ledger row for `version`. Fails with [`Error::DuplicateVersion`] if a
    /// row for that version already exists.
    pub fn record_applied(&self, version: u32, checksum: u32) -> Result<(), Error> {
        let mut client = self.connector.connect()?;
        insert_version_record(&mut client, &self.ledger_table, version, checksum)
    }

    /// Apply one migration inside its own transaction.
    ///
    /// Either the script and its ledger row both commit, or neither does. The
    /// connection is closed on every exit path; a close failure is reported as
    /// [`Error::ConnectionClose`] but occurs strictly after commit or rollback.
    pub fn apply(&self, migration: &Migration) -> Result<(), Error> {
        let version = migration.version;
        tracing::info!(version, "starting migration");

        let mut client = self.connector.connect()?;
        let result = self.apply_in_tx(&mut client, migration);
        if let Err(e) = client.close() {
            return Err(Error::ConnectionClose {
                version,
                message: e.to_string(),
            });
        }
        result
    }

    fn apply_in_tx(&self, client: &mut Client, migration: &Migration) -> Result<(), Error> {
        let version = migration.version;
        let mut tx = client.transaction().map_err(|e| Error::Execution {
            version,
            phase: "begin",
            message: e.to_string(),
        })?;

        // Row-locking read against the ledger, held until commit or rollback. Locks
        // nothing while the ledger is empty (best-effort, see module docs).
        if let Err(e) = tx.query(
            &format!("SELECT version FROM {} FOR UPDATE", self.ledger_table),
            &[],
        ) {
            let cause = Error::Execution {
                version,
                phase: "lock",
                message: e.to_string(),
            };
            return rollback(tx, version, "lock", cause);
        }

        if let Err(e) = tx.batch_execute(&migration.sql) {
            let cause = Error::Execution {
                version,
                phase: "execute",
                message: e.to_string(),
            };
            return rollback(tx, version, "execute", cause);
        }

        if let Err(e) = insert_version_record(&mut tx, &self.ledger_table, version, migration.checksum)
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

/// Build a [`PostgresMigrator`] from `config`, run a full pass over `migrations_dir`,
/// and write the report to [`DEFAULT_REPORT_PATH`](crate::DEFAULT_REPORT_PATH).
pub fn run_migrations(
    config: DbConfig,
    migrations_dir: impl AsRef<Path>,
) -> Result<MigrationReport, Error> {
    PostgresMigrator::new(PostgresConnector::new(config))
        .run_and_report(migrations_dir, crate::report::DEFAULT_REPORT_PATH)
}

fn insert_version_record<C: GenericClient>(
    client: &mut C,
    table: &str,
    version: u32,
    checksum: u32,
) -> Result<(), Error> {
    // The u32 checksum is stored bit-cast into the signed INTEGER column.
    client
        .execute(
            &format!("INSERT INTO {table} (version, checksum) VALUES ($1, $2)"),
            &[&(version as i32), &(checksum as i32)],
        )
        .map_err(|e| {
            if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                Error::DuplicateVersion(version)
            } else {
                Error::SchemaVersion(format!("failed to record version {version}: {e}"))
            }
        })?;
    Ok(())
}

fn rollback(
    tx: postgres::Transaction<'_>,
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

    // Transactional behavior against a live server is covered by the SQLite engine
    // tests, which share the same decision logic; these tests stay offline.

    #[test]
    fn connector_builds_config_from_url_and_credentials() {
        let connector = PostgresConnector::new(DbConfig::new(
            "postgres://db.internal:5433/app",
            "app_user",
            "secret",
        ));

        let config = connector.pg_config().unwrap();
        assert_eq!(config.get_user(), Some("app_user"));
        assert_eq!(config.get_password(), Some("secret".as_bytes()));
        assert_eq!(config.get_dbname(), Some("app"));
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        let connector =
            PostgresConnector::new(DbConfig::new("not a database url", "user", "pw"));
        let err = connector.pg_config().unwrap_err();
        assert!(matches!(err, Error::Connection(_)), "got {err:?}");
    }
}
