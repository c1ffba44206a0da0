//! Loader configuration.
//!
//! Every section is optional; a missing file means defaults throughout.
//!
//! ```toml
//! [store]
//! backend = "elasticsearch"
//! uri = "http://localhost:9200/"
//! username = "elastic"
//! password = "elastic"
//!
//! [import]
//! checkpoint = 1000
//! views_dir = "views"
//! view_mode = "rebuild"
//!
//! [logging]
//! level = "info"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::batch::DEFAULT_CHECKPOINT;
use crate::record::MAKE;
use crate::store::SortDirection;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reports every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.store.backend == Backend::Elasticsearch && self.store.uri.trim().is_empty() {
            errors.push("store.uri must not be empty".to_owned());
        }
        if self.store.username.is_some() != self.store.password.is_some() {
            errors.push("store.username and store.password must be set together".to_owned());
        }
        if self.store.page_size == 0 {
            errors.push("store.page_size must be positive".to_owned());
        }
        if self.import.checkpoint == 0 {
            errors.push("import.checkpoint must be positive".to_owned());
        }
        if self.import.index_field.trim().is_empty() {
            errors.push("import.index_field must not be empty".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Elasticsearch,
    /// Keeps everything in process. Nothing survives the run.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Documents per scroll page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_retry_on_conflict")]
    pub retry_on_conflict: u32,
}

fn default_uri() -> String {
    "http://localhost:9200/".to_owned()
}

fn default_page_size() -> usize {
    1_000
}

fn default_retry_on_conflict() -> u32 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            uri: default_uri(),
            username: None,
            password: None,
            page_size: default_page_size(),
            retry_on_conflict: default_retry_on_conflict(),
        }
    }
}

/// How views follow an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    /// Rebuild every view once the import is done.
    #[default]
    Rebuild,
    /// Fold each flushed record into every view.
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportConfig {
    #[serde(default = "default_checkpoint")]
    pub checkpoint: usize,
    #[serde(default = "default_views_dir")]
    pub views_dir: PathBuf,
    #[serde(default = "default_index_field")]
    pub index_field: String,
    #[serde(default)]
    pub index_direction: SortDirection,
    #[serde(default)]
    pub view_mode: ViewMode,
}

fn default_checkpoint() -> usize {
    DEFAULT_CHECKPOINT
}

fn default_views_dir() -> PathBuf {
    PathBuf::from("views")
}

fn default_index_field() -> String {
    MAKE.to_owned()
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            checkpoint: default_checkpoint(),
            views_dir: default_views_dir(),
            index_field: default_index_field(),
            index_direction: SortDirection::default(),
            view_mode: ViewMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            Self::Trace => log::LevelFilter::Trace,
            Self::Debug => log::LevelFilter::Debug,
            Self::Info => log::LevelFilter::Info,
            Self::Warn => log::LevelFilter::Warn,
            Self::Error => log::LevelFilter::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set.
    #[serde(default)]
    pub level: LogLevel,
}
