//! Store and replica options.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};

/// Directory created under the platform data dir when no path is given.
pub const APP_DIR: &str = "confsync";

/// Prefix for environment overrides, e.g. `CONFSYNC_WATCH_FILE=true`.
pub const ENV_PREFIX: &str = "CONFSYNC";

/// Options recognised by the owner store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Extension of the settings document, without the dot.
    #[serde(alias = "fileExtension")]
    pub file_extension: String,
    /// File name of the settings document, without extension.
    #[serde(alias = "fileName")]
    pub file_name: String,
    /// Directory holding the settings document.
    #[serde(alias = "filePath")]
    pub file_path: PathBuf,
    /// Write the document with 4-space indentation.
    #[serde(alias = "prettyPrint")]
    pub pretty_print: bool,
    /// Validate the document when loading it.
    #[serde(alias = "validateFile")]
    pub validate_file: bool,
    /// Validate values passed to `set`.
    pub validate: bool,
    /// Create the settings directory before the first read.
    #[serde(alias = "mkdirOnStartup")]
    pub mkdir_on_startup: bool,
    /// Replace invalid values with their defaults instead of rejecting them.
    #[serde(alias = "defaultOnFailValidation")]
    pub default_on_fail_validation: bool,
    /// Reload the document when it is modified externally.
    #[serde(alias = "watchFile")]
    pub watch_file: bool,
    /// Write the settings once more on shutdown.
    #[serde(alias = "writeBeforeQuit")]
    pub write_before_quit: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            file_extension: "json".to_string(),
            file_name: "config".to_string(),
            file_path: default_settings_dir(),
            pretty_print: true,
            validate_file: true,
            validate: true,
            mkdir_on_startup: true,
            default_on_fail_validation: true,
            watch_file: false,
            write_before_quit: false,
        }
    }
}

impl StoreOptions {
    /// Load options from a TOML file, layered with `CONFSYNC_*` environment
    /// variables. A missing file yields the defaults.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;

        let options: StoreOptions = settings
            .try_deserialize()
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        options.validated()
    }

    /// Check the options and normalise the extension.
    pub fn validated(mut self) -> StoreResult<Self> {
        self.file_extension = self.file_extension.trim_start_matches('.').to_string();

        if self.file_name.trim().is_empty() {
            return Err(StoreError::InvalidConfig("file_name must not be empty".into()));
        }
        if self.file_extension.trim().is_empty() {
            return Err(StoreError::InvalidConfig(
                "file_extension must not be empty".into(),
            ));
        }
        if self.file_name.contains(std::path::MAIN_SEPARATOR) {
            return Err(StoreError::InvalidConfig(format!(
                "file_name must not contain a path separator: {}",
                self.file_name
            )));
        }
        Ok(self)
    }

    /// Full path of the settings document.
    pub fn complete_file_path(&self) -> PathBuf {
        self.file_path
            .join(format!("{}.{}", self.file_name, self.file_extension))
    }

    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = path.into();
        self
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    pub fn with_watch_file(mut self, watch: bool) -> Self {
        self.watch_file = watch;
        self
    }

    pub fn with_default_on_fail_validation(mut self, enabled: bool) -> Self {
        self.default_on_fail_validation = enabled;
        self
    }

    pub fn with_write_before_quit(mut self, enabled: bool) -> Self {
        self.write_before_quit = enabled;
        self
    }
}

/// Platform user-data directory for settings.
fn default_settings_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Options recognised by a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaOptions {
    /// Emit an "updated" notification to local subscribers on every push.
    #[serde(alias = "emitEventOnUpdated")]
    pub emit_event_on_updated: bool,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            emit_event_on_updated: true,
        }
    }
}
