use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

/// Database connection settings.
///
/// Constructed explicitly (directly or via [`DbConfig::from_file`]) and passed by
/// parameter into the pieces that need it; there is no process-wide configuration
/// singleton.
///
/// The TOML file shape is three top-level keys, all required:
///
/// ```toml
/// url = "postgres://localhost:5432/app"
/// user = "app"
/// password = "secret"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DbConfig {
    pub url: String,
    pub user: String,
    pub password: String,
}

impl DbConfig {
    pub fn new(url: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    /// Load configuration from a TOML file. A missing file or missing key is fatal
    /// before any migration runs.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "database configuration loaded");
        Ok(config)
    }
}
