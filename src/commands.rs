//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum that represents the available subcommands and their
//! options.
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use db_analyst::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Ask { question } => println!("asking: {question}"),
//!     _ => {}
//! }
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Configuration file to use instead of `<config_dir>/config.yaml`.
    #[arg(long, short = 'c', global = true, env = "ANALYST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log more (`-v` info, `-vv` debug). Logs go to stderr.
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Analyse a new question and save it as a thread.
    #[clap(name = "ask", alias = "a")]
    Ask {
        /// The question, in plain language.
        #[arg(value_parser = non_blank)]
        question: String,
    },

    /// Ask a follow-up question in an existing thread.
    #[clap(name = "follow-up", alias = "f")]
    FollowUp {
        /// Thread id, or a unique prefix of it.
        thread: String,

        /// The follow-up question.
        #[arg(value_parser = non_blank)]
        question: String,
    },

    /// List saved threads, most recent first.
    Threads,

    /// Print every message of a thread.
    Show {
        /// Thread id, or a unique prefix of it.
        thread: String,
    },

    /// Delete a thread.
    Delete {
        /// Thread id, or a unique prefix of it.
        thread: String,
    },

    /// Delete every thread.
    Clear,

    /// Start an interactive session.
    ///
    /// This subcommand can be invoked with either 'i' or 'interactive'.
    #[clap(name = "interactive", alias = "i")]
    Interactive,

    /// Print the weekly cohort retention table.
    ///
    /// Runs the configured `retention_query` (or `--query`). With `--analyze`
    /// the model also comments on the table; its analysis is kept for 24 hours.
    Retention {
        /// Query file to run instead of the configured one.
        #[arg(long, short = 'q')]
        query: Option<PathBuf>,

        /// Column to sort the cohorts by.
        #[arg(long, value_enum, default_value_t = RetentionSort::CohortWeek)]
        sort: RetentionSort,

        /// Sort in ascending order (default is descending).
        #[arg(long)]
        ascending: bool,

        /// Ask the model to analyse the table.
        #[arg(long)]
        analyze: bool,

        /// Analyse again even when a recent analysis is cached.
        #[arg(long, requires = "analyze")]
        refresh: bool,
    },

    /// Print the schema context sent to the model.
    Schema,

    /// Write a default configuration and the prompt templates.
    Init,
}

/// Sort keys of the retention table.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetentionSort {
    CohortWeek,
    CohortSize,
}

impl RetentionSort {
    /// Name of the result column sorted on.
    pub fn column(self) -> &'static str {
        match self {
            RetentionSort::CohortWeek => "cohort_week",
            RetentionSort::CohortSize => "cohort_size",
        }
    }
}

/// Questions must contain something besides whitespace.
fn non_blank(value: &str) -> Result<String, String> {
    if value.trim().is_empty() {
        return Err("the question must not be empty".to_string());
    }
    Ok(value.to_string())
}
