//! # Error types
//!
//! Every fallible operation in the crate returns [`Result<T>`], aliased over
//! [`AnalystError`]. The variants follow the pipeline's failure classes:
//!
//! - **Generation** failures ([`AnalystError::Llm`]) end the current action.
//! - **Execution** failures surface only after the correction loop gave up, as
//!   [`AnalystError::QueryFailed`], which carries the last SQL and the last
//!   database message so the operator can debug it.
//! - **Persistence** failures ([`AnalystError::Persist`]) are reported but never
//!   roll back an in-memory change.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalystError {
    #[error("LLM request failed: {0}")]
    OpenAi(#[from] async_openai::error::OpenAIError),

    #[error("LLM request failed: {0}")]
    Llm(String),

    #[error("query failed after {attempts} attempt(s): {message}")]
    QueryFailed {
        attempts: usize,
        sql: String,
        message: String,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database connection unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error("template `{name}`: {reason}")]
    Template { name: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("failed to write {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: Box<AnalystError>,
    },

    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("no thread is selected")]
    NoActiveThread,
}

impl AnalystError {
    /// `true` for failures raised by the language model (generation, correction
    /// or report synthesis).
    pub fn is_generation_error(&self) -> bool {
        matches!(self, AnalystError::OpenAi(_) | AnalystError::Llm(_))
    }

    pub(crate) fn template(name: &str, reason: impl Into<String>) -> Self {
        AnalystError::Template {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalystError>;
