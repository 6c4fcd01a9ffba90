//! # DB Analyst (library root)
//!
//! This crate provides the core plumbing for the **`analyst`** CLI: ask a
//! question about a relational database in plain language, get back a report.
//!
//! - Model access (`api`) and prompt templates (`template`).
//! - Database access (`database`) and the schema context fed to the model (`context`).
//! - The generate / execute / correct / report loop (`pipeline`).
//! - The weekly cohort retention table and its cached analysis (`retention`).
//! - Durable conversation threads (`models`, `thread_store`) and the follow-up
//!   state machine on top of them (`session`).
//! - CLI parsing (`commands`), configuration (`config`) and terminal output (`pretty`).
//!
//! ## Configuration layout
//! Everything lives under the per-platform configuration directory:
//!
//! - Linux (XDG): `~/.config/analyst/`
//! - macOS: `~/Library/Application Support/com.db-analyst.analyst/`
//! - Windows: `C:\Users\<you>\AppData\Roaming\db-analyst\analyst\config\`
//!
//! ```text
//! config.yaml        # AnalystConfig
//! templates/*.yaml   # db_analyst, sql_corrector, final_analyst, follow_up,
//!                    # retention_analysis
//! threads.json       # saved analysis threads
//! ai_cache.json      # latest retention analysis
//! ```
//!
//! ## Modules
//! - [`api`], [`commands`], [`config`], [`context`], [`database`], [`error`],
//!   [`models`], [`pipeline`], [`pretty`], [`retention`], [`session`], [`template`],
//!   [`thread_store`]

use std::path::PathBuf;

use directories::ProjectDirs;

pub mod api;
pub mod commands;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod pretty;
pub mod retention;
pub mod session;
pub mod template;
pub mod thread_store;

use error::{AnalystError, Result};

/// Return the per-platform configuration directory used by the analyst.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "db-analyst", "analyst")`.
///
/// The directory is **not** created by this function; callers that need it should
/// create it with `fs::create_dir_all`.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be determined
/// (which is rare but possible in heavily sandboxed environments).
///
/// # Examples
/// ```no_run
/// let cfg = db_analyst::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("com", "db-analyst", "analyst")
        .ok_or_else(|| AnalystError::Config("Unable to determine config directory".into()))?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
