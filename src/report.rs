//! The run report: per-migration outcomes accumulated in the order they were
//! produced, serializable as a pretty-printed JSON document.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default path the report is written to.
pub const DEFAULT_REPORT_PATH: &str = "migration-report.json";

/// The outcome of processing one migration within a run.
///
/// Serialized with the wire field names `version`, `isSuccess`, `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub version: u32,
    #[serde(rename = "isSuccess")]
    pub success: bool,
    pub message: String,
}

impl MigrationOutcome {
    pub(crate) fn applied(version: u32) -> Self {
        Self {
            version,
            success: true,
            message: "Migration executed successfully".to_string(),
        }
    }

    pub(crate) fn already_applied(version: u32) -> Self {
        Self {
            version,
            success: true,
            message: "Migration already applied".to_string(),
        }
    }

    pub(crate) fn skipped(version: u32, current: u32) -> Self {
        Self {
            version,
            success: true,
            message: format!(
                "Skipped: version {version} is at or below current version {current} with no ledger record"
            ),
        }
    }

    pub(crate) fn failed(version: u32, message: impl Into<String>) -> Self {
        Self {
            version,
            success: false,
            message: message.into(),
        }
    }
}

/// Append-only collection of [`MigrationOutcome`]s for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    outcomes: Vec<MigrationOutcome>,
}

impl MigrationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, outcome: MigrationOutcome) {
        self.outcomes.push(outcome);
    }

    /// All outcomes, in the order they were produced.
    pub fn outcomes(&self) -> &[MigrationOutcome] {
        &self.outcomes
    }

    /// Whether every recorded outcome succeeded. True for an empty report.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }

    /// Write the report as an indented JSON array to `path`.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.outcomes).map_err(|e| Error::ReportWrite {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        std::fs::write(path, json).map_err(|e| Error::ReportWrite {
            path: path.to_path_buf(),
            source: e,
        })?;
        tracing::info!(path = %path.display(), outcomes = self.outcomes.len(), "migration report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_wire_field_names() {
        let mut report = MigrationReport::new();
        report.record(MigrationOutcome::applied(1));

        let json = serde_json::to_string_pretty(report.outcomes()).unwrap();
        assert!(json.contains("\"version\": 1"), "{json}");
        assert!(json.contains("\"isSuccess\": true"), "{json}");
        assert!(json.contains("\"message\": \"Migration executed successfully\""), "{json}");
        // Indented output spans multiple lines
        assert!(json.lines().count() > 1);
    }

    #[test]
    fn writes_report_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let mut report = MigrationReport::new();
        report.record(MigrationOutcome::applied(1));
        report.record(MigrationOutcome::failed(2, "syntax error"));
        report.write_json(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<MigrationOutcome> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, report.outcomes());
        assert!(!report.is_success());
    }

    #[test]
    fn write_failure_is_surfaced() {
        let report = MigrationReport::new();
        let err = report.write_json("/nonexistent-dir/report.json").unwrap_err();
        assert!(matches!(err, Error::ReportWrite { .. }), "got {err:?}");
    }
}
