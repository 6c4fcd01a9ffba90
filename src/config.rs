//! This module provides functionality for loading and handling the application's configuration.
//!
//! It defines the `AnalystConfig` struct, which holds the configuration parameters,
//! and a `load_config` function to load the configuration from a YAML file.
//!
//! # Examples
//!
//! Loading the configuration from a file:
//!
//! ```no_run
//! use db_analyst::config::{AnalystConfig, load_config};
//!
//! let config: AnalystConfig = load_config("/path/to/config.yaml").unwrap();
//! println!("{:?}", config);
//! ```
//!
//! A minimal file only names the backend and the database:
//!
//! ```yaml
//! api_key: "CHANGEME"
//! api_base: "http://localhost:5001/v1"
//! model: "gpt-4o-mini"
//! database_path: "analytics.db"
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AnalystError, Result};

/// Default lifetime of the cached schema context.
pub const DEFAULT_SCHEMA_CACHE_TTL_SECS: u64 = 60 * 60;

/// Represents the application's configuration.
///
/// Paths left unset resolve relative to the configuration directory, see
/// [`AnalystConfig::prompts_dir`] and [`AnalystConfig::thread_store_path`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct AnalystConfig {
    /// The API key used to authenticate requests to the API.
    pub api_key: String,

    /// The base URL of the OpenAI-compatible API.
    pub api_base: String,

    /// The name of the model used for SQL generation and reports.
    pub model: String,

    /// Upper bound on tokens per completion.
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Stream completions token by token (`true`) or fetch them whole.
    #[serde(default)]
    pub should_stream: Option<bool>,

    /// Sent as the system message of every request, when set.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// SQLite database file to analyse.
    pub database_path: PathBuf,

    /// Directory of example `.sql` files added to the schema context.
    #[serde(default)]
    pub query_library_dir: Option<PathBuf>,

    /// Directory holding the prompt templates.
    #[serde(default)]
    pub prompts_dir: Option<PathBuf>,

    /// JSON file holding the analysis threads.
    #[serde(default)]
    pub thread_store_path: Option<PathBuf>,

    /// Seconds the schema context stays cached; `0` rebuilds it every time.
    #[serde(default = "default_schema_cache_ttl_secs")]
    pub schema_cache_ttl_secs: u64,

    /// SQL file producing the weekly cohort retention table.
    #[serde(default)]
    pub retention_query: Option<PathBuf>,

    /// JSON file keeping the latest retention analysis.
    #[serde(default)]
    pub retention_cache_path: Option<PathBuf>,
}

fn default_schema_cache_ttl_secs() -> u64 {
    DEFAULT_SCHEMA_CACHE_TTL_SECS
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            api_key: "CHANGEME".to_string(),
            api_base: "http://localhost:5001/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: None,
            should_stream: Some(true),
            system_prompt: None,
            database_path: PathBuf::from("analytics.db"),
            query_library_dir: Some(PathBuf::from("queries")),
            prompts_dir: None,
            thread_store_path: None,
            schema_cache_ttl_secs: DEFAULT_SCHEMA_CACHE_TTL_SECS,
            retention_query: Some(PathBuf::from("queries/student_retention.sql")),
            retention_cache_path: None,
        }
    }
}

impl AnalystConfig {
    pub fn schema_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.schema_cache_ttl_secs)
    }

    /// Where prompt templates live: `prompts_dir`, else `<config_dir>/templates`.
    pub fn prompts_dir(&self, config_dir: &Path) -> PathBuf {
        self.prompts_dir
            .clone()
            .unwrap_or_else(|| config_dir.join("templates"))
    }

    /// Where threads are stored: `thread_store_path`, else `<config_dir>/threads.json`.
    pub fn thread_store_path(&self, config_dir: &Path) -> PathBuf {
        self.thread_store_path
            .clone()
            .unwrap_or_else(|| config_dir.join("threads.json"))
    }

    /// Where the retention analysis is cached: `retention_cache_path`, else
    /// `<config_dir>/ai_cache.json`.
    pub fn retention_cache_path(&self, config_dir: &Path) -> PathBuf {
        self.retention_cache_path
            .clone()
            .unwrap_or_else(|| config_dir.join("ai_cache.json"))
    }
}

/// Loads the application's configuration from a YAML file.
///
/// # Errors
///
/// Fails when the file cannot be read or does not parse as an [`AnalystConfig`].
///
/// # Examples
///
/// ```no_run
/// use db_analyst::config::load_config;
///
/// match load_config("/path/to/config.yaml") {
///     Ok(config) => println!("{:?}", config),
///     Err(err) => eprintln!("Error loading config: {}", err),
/// }
/// ```
pub fn load_config(file: impl AsRef<Path>) -> Result<AnalystConfig> {
    let file = file.as_ref();
    debug!("Loading config from {}", file.display());
    let content = fs::read_to_string(file)
        .map_err(|err| AnalystError::Config(format!("{}: {err}", file.display())))?;
    let config: AnalystConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
