use std::path::PathBuf;

/// Error type for the sqlstep crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    /// A database connection could not be opened.
    #[error("failed to open database connection: {0}")]
    Connection(String),
    /// A connection could not be closed after a migration ran. Occurs strictly after
    /// commit or rollback and cannot undo a committed migration.
    #[error("failed to close connection after migration {version}: {message}")]
    ConnectionClose { version: u32, message: String },
    /// A failed migration's transaction could not be rolled back. The database state
    /// for this migration is now ambiguous.
    #[error("failed to roll back migration {version} after {phase} failure: {message}")]
    RollbackFailed {
        version: u32,
        phase: &'static str,
        message: String,
    },
    /// A migration failed inside its transaction and was rolled back.
    #[error("migration {version} failed during {phase}: {message}")]
    Execution {
        version: u32,
        phase: &'static str,
        message: String,
    },
    /// Two migration files carry the same version, or a ledger row for this version
    /// already exists.
    #[error("duplicate migration version {0}")]
    DuplicateVersion(u32),
    /// The schema version ledger could not be created, read, or written.
    #[error("schema version ledger error: {0}")]
    SchemaVersion(String),
    /// A file in the migrations directory does not follow the
    /// `<marker><version>__<description>` naming rule. Fatal for the whole discovery
    /// step, since the migration list cannot be trusted.
    #[error("malformed migration file name '{0}': expected <marker><version>__<description>")]
    MalformedFileName(String),
    /// A previously applied migration's file content no longer matches the checksum
    /// recorded at application time.
    #[error("checksum mismatch for migration {version}: ledger has {recorded}, file has {computed}")]
    Drift {
        version: u32,
        recorded: u32,
        computed: u32,
    },
    /// The run report could not be written. Raised after all migrations were attempted.
    #[error("failed to write migration report to {}", .path.display())]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The database configuration file is missing, unreadable, or incomplete.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
