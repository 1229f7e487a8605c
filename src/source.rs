//! Migration discovery: scans a directory for SQL scripts and turns them into an
//! ordered list of [`Migration`]s.
//!
//! File names encode the version as `<marker><version>__<description>.<ext>`, e.g.
//! `V1__create_users.sql`. The marker is a single non-digit character and is optional.
//!
//! Script content is canonicalized before checksumming: the file is read as UTF-8 and
//! its lines are joined with a single `\n`, which normalizes CRLF line endings and
//! drops any trailing newline. This policy is fixed; changing it would make every
//! previously applied migration appear to have drifted.

use std::fs;
use std::path::Path;

use crate::core::Migration;
use crate::error::Error;

/// Load all migrations from `dir`, sorted ascending by version.
///
/// An absent or unreadable directory is not an error: it means "no migrations to run"
/// and yields an empty list. A file whose name cannot be parsed aborts the whole load
/// with [`Error::MalformedFileName`], and two files with the same version abort it
/// with [`Error::DuplicateVersion`]. Subdirectory entries are ignored.
pub fn load_migrations(dir: impl AsRef<Path>) -> Result<Vec<Migration>, Error> {
    let dir = dir.as_ref();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => {
            tracing::info!(dir = %dir.display(), "migrations directory absent, nothing to load");
            return Ok(Vec::new());
        }
    };

    let mut migrations = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let version = parse_version(&name)?;
        let raw = fs::read_to_string(entry.path())?;
        migrations.push(Migration::new(version, canonical_text(&raw)));
    }

    migrations.sort_by_key(|m| m.version);
    for pair in migrations.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(Error::DuplicateVersion(pair[0].version));
        }
    }

    tracing::info!(dir = %dir.display(), count = migrations.len(), "migrations loaded");
    Ok(migrations)
}

/// Extract the version from a file name: the integer between one optional leading
/// non-digit marker character and the first `__`. Version 0 is rejected, since 0 is
/// the "nothing applied yet" sentinel in the ledger.
fn parse_version(file_name: &str) -> Result<u32, Error> {
    let malformed = || Error::MalformedFileName(file_name.to_string());
    let (tag, _) = file_name.split_once("__").ok_or_else(malformed)?;
    let digits = tag.strip_prefix(|c: char| !c.is_ascii_digit()).unwrap_or(tag);
    let version: u32 = digits.parse().map_err(|_| malformed())?;
    if version == 0 {
        return Err(malformed());
    }
    Ok(version)
}

fn canonical_text(raw: &str) -> String {
    raw.lines().collect::<Vec<_>>().join("\n")
}
