/// Name of the ledger table that records applied migration versions.
pub const LEDGER_TABLE_NAME: &str = "schema_version";

/// One versioned, checksummed SQL script.
///
/// Constructed by [`source::load_migrations`](crate::source::load_migrations) from the
/// files in the migrations directory. Only the version and checksum are ever persisted;
/// the SQL text exists for the duration of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Version number, unique and greater than 0. The total order key for a run.
    pub version: u32,
    /// The script text, in canonical form (lines joined with a single `\n`).
    pub sql: String,
    /// CRC32 of the canonical script text.
    pub checksum: u32,
}

impl Migration {
    /// Build a migration from its version and canonical SQL text, computing the checksum.
    pub fn new(version: u32, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let checksum = checksum(&sql);
        Self {
            version,
            sql,
            checksum,
        }
    }
}

/// CRC32 checksum of a script's canonical text.
///
/// Deterministic across platforms and runs; recorded in the ledger when a migration
/// is applied and compared against the file's current content on every later run.
/// The input must already be canonicalized (see [`source`](crate::source)), or
/// unchanged files will appear to have drifted.
pub fn checksum(sql: &str) -> u32 {
    crc32fast::hash(sql.as_bytes())
}

/// Where a migration stands relative to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LedgerStatus {
    /// No ledger record for this version.
    Unapplied,
    /// A ledger record exists and its checksum matches the file.
    UpToDate,
    /// A ledger record exists but the file content has changed since it was applied.
    Drifted { recorded: u32 },
}

/// Classify a migration against the checksum stored in the ledger, if any.
pub(crate) fn ledger_status(migration: &Migration, stored: Option<u32>) -> LedgerStatus {
    match stored {
        Some(recorded) if recorded == migration.checksum => LedgerStatus::UpToDate,
        Some(recorded) => LedgerStatus::Drifted { recorded },
        None => LedgerStatus::Unapplied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        let sql = "CREATE TABLE users (id INTEGER PRIMARY KEY)";
        assert_eq!(checksum(sql), checksum(sql));
        assert_ne!(checksum(sql), checksum("CREATE TABLE posts (id INTEGER)"));
    }

    #[test]
    fn new_computes_checksum_over_sql() {
        let migration = Migration::new(1, "SELECT 1");
        assert_eq!(migration.checksum, checksum("SELECT 1"));
    }

    #[test]
    fn status_is_three_way() {
        let migration = Migration::new(1, "SELECT 1");
        assert_eq!(ledger_status(&migration, None), LedgerStatus::Unapplied);
        assert_eq!(
            ledger_status(&migration, Some(migration.checksum)),
            LedgerStatus::UpToDate
        );
        assert_eq!(
            ledger_status(&migration, Some(migration.checksum.wrapping_add(1))),
            LedgerStatus::Drifted {
                recorded: migration.checksum.wrapping_add(1)
            }
        );
    }
}
