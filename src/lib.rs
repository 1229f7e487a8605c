#![cfg_attr(docsrs, feature(doc_cfg))]
//! `sqlstep` applies a directory of versioned SQL scripts to a relational database,
//! exactly once each.
//!
//! Core concepts:
//! - Migration scripts are plain SQL files named `<marker><version>__<description>.<ext>`
//!   (for example `V1__create_users.sql`), applied in ascending version order.
//! - Applied versions are recorded in a `schema_version` ledger table together with a
//!   CRC32 checksum of the script content at the time it was applied.
//! - On later runs, already-applied scripts are skipped when their checksum still
//!   matches; a changed script is reported as **drift** rather than re-applied.
//! - Each script runs inside its own transaction: either the SQL and the ledger row
//!   both commit, or neither does.
//!
//! A run never stops at the first failing script. Every script gets an outcome
//! (applied, already applied, drifted, failed, or skipped) and the accumulated
//! outcomes can be written as a pretty-printed JSON report.
//!
//! # Example
//!
//! ```no_run
//! use sqlstep::sqlite::{SqliteConnector, SqliteMigrator};
//!
//! # fn main() -> Result<(), sqlstep::Error> {
//! let migrator = SqliteMigrator::new(SqliteConnector::new("app.db"));
//! let report = migrator.run_and_report("migrations", "migration-report.json")?;
//! for outcome in report.outcomes() {
//!     println!("{}: {}", outcome.version, outcome.message);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag (on by default).
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.

mod core;
pub use core::{checksum, Migration, LEDGER_TABLE_NAME};

mod error;
pub use error::Error;

mod config;
pub use config::DbConfig;

pub mod source;

pub mod report;
pub use report::{MigrationOutcome, MigrationReport, DEFAULT_REPORT_PATH};

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;
