//! # Analysis pipeline
//!
//! One question goes through three stages:
//!
//! 1. **Generation.** The question (and, for follow-ups, the conversation so
//!    far) is rendered into a prompt together with the schema context, and the
//!    model's answer is reduced to one SQL statement with [`extract_sql`].
//! 2. **Execution and correction.** The SQL runs against the [`Database`]. When
//!    it fails, the faulty SQL and the database message are sent back through
//!    the `sql_corrector` prompt, for at most [`MAX_SQL_ATTEMPTS`] executions in
//!    total. Running out of attempts yields [`AnalystError::QueryFailed`].
//! 3. **Report.** The result set is rendered as a markdown table and summarised
//!    by the `final_analyst` prompt. Chunks reach the caller as they arrive; a
//!    failure here is final.
//!
//! [`Analyst`] bundles the model, the database, the prompts and the schema
//! context cache, so callers only pass the question.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    api::{LanguageModel, OpenAiModel, collect_text},
    config::AnalystConfig,
    context::SchemaContextCache,
    database::{Database, QueryOutput, SqliteDatabase},
    error::{AnalystError, Result},
    models::Message,
    template::PromptSet,
};

/// Executions allowed per question: the first attempt plus one correction.
pub const MAX_SQL_ATTEMPTS: usize = 2;

static SQL_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```sql\n(.*?)\n```").expect("sql block pattern is valid"));

/// Outcome of a successful analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisReport {
    /// Report text as produced by the model.
    pub report: String,
    /// The SQL statement that finally executed.
    pub sql: String,
    /// Executions used, `1..=MAX_SQL_ATTEMPTS`.
    pub attempts: usize,
}

/// Pull the SQL out of a model answer.
///
/// The body of the first ```` ```sql ```` fenced block, trimmed; without one,
/// the whole answer trimmed.
pub fn extract_sql(response: &str) -> String {
    match SQL_BLOCK.captures(response).and_then(|cap| cap.get(1)) {
        Some(body) => body.as_str().trim().to_string(),
        None => response.trim().to_string(),
    }
}

/// Render messages as `User:\n...` / `Assistant:\n...` blocks separated by a blank line.
pub fn format_history(history: &[Message]) -> String {
    history
        .iter()
        .map(|message| format!("{}:\n{}", message.role.label(), message.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Answer `question` end to end.
///
/// `history` switches to the follow-up prompt when it holds at least one
/// message. Report chunks are passed to `on_chunk` as they arrive.
pub async fn run_analysis(
    llm: &dyn LanguageModel,
    db: &dyn Database,
    prompts: &PromptSet,
    question: &str,
    history: Option<&[Message]>,
    schema_context: &str,
    on_chunk: impl FnMut(&str),
) -> Result<AnalysisReport> {
    let prompt = generation_prompt(prompts, question, history, schema_context)?;
    let (sql, output, attempts) =
        execute_with_correction(llm, db, prompts, question, schema_context, &prompt).await?;
    info!("Query succeeded after {attempts} attempt(s)");

    let report = synthesize_report(llm, prompts, question, &output, on_chunk).await?;
    Ok(AnalysisReport {
        report,
        sql,
        attempts,
    })
}

/// Summarise `output` for `question`. Not retried.
pub async fn synthesize_report(
    llm: &dyn LanguageModel,
    prompts: &PromptSet,
    question: &str,
    output: &QueryOutput,
    on_chunk: impl FnMut(&str),
) -> Result<String> {
    let data_frame = output.to_markdown();
    let prompt = prompts
        .final_analyst
        .render(&[("user_question", question), ("data_frame", &data_frame)])?;
    debug!("Report prompt:\n{prompt}");

    let stream = llm.generate(&prompt).await?;
    collect_text(stream, on_chunk).await
}

fn generation_prompt(
    prompts: &PromptSet,
    question: &str,
    history: Option<&[Message]>,
    schema_context: &str,
) -> Result<String> {
    match history {
        Some(history) if !history.is_empty() => {
            let conversation = format_history(history);
            prompts.follow_up.render(&[
                ("db_context", schema_context),
                ("conversation_history", &conversation),
                ("follow_up_question", question),
            ])
        }
        _ => prompts
            .db_analyst
            .render(&[("db_context", schema_context), ("user_question", question)]),
    }
}

async fn execute_with_correction(
    llm: &dyn LanguageModel,
    db: &dyn Database,
    prompts: &PromptSet,
    question: &str,
    schema_context: &str,
    prompt: &str,
) -> Result<(String, QueryOutput, usize)> {
    let mut sql = request_sql(llm, prompt).await?;
    let mut attempts = 1;

    loop {
        debug!("Executing SQL (attempt {attempts}):\n{sql}");
        let message = match db.execute(&sql) {
            Ok(output) => return Ok((sql, output, attempts)),
            Err(err) => database_message(err),
        };
        warn!("Attempt {attempts}/{MAX_SQL_ATTEMPTS} failed: {message}");

        if attempts >= MAX_SQL_ATTEMPTS {
            return Err(AnalystError::QueryFailed {
                attempts,
                sql,
                message,
            });
        }

        let correction = prompts.sql_corrector.render(&[
            ("user_question", question),
            ("db_context", schema_context),
            ("faulty_sql", &sql),
            ("error_message", &message),
        ])?;
        sql = request_sql(llm, &correction).await?;
        attempts += 1;
    }
}

async fn request_sql(llm: &dyn LanguageModel, prompt: &str) -> Result<String> {
    debug!("SQL prompt:\n{prompt}");
    let stream = llm.generate(prompt).await?;
    let response = collect_text(stream, |_| {}).await?;
    Ok(extract_sql(&response))
}

/// The database's own wording, without the crate's prefix.
pub(crate) fn database_message(err: AnalystError) -> String {
    match err {
        AnalystError::Database(err) => err.to_string(),
        other => other.to_string(),
    }
}

/// The model, database and prompts an analysis runs against.
pub struct Analyst {
    llm: Box<dyn LanguageModel>,
    db: Box<dyn Database>,
    prompts: PromptSet,
    query_library: Option<PathBuf>,
    schema_cache: SchemaContextCache,
}

impl Analyst {
    pub fn new(
        llm: Box<dyn LanguageModel>,
        db: Box<dyn Database>,
        prompts: PromptSet,
        query_library: Option<PathBuf>,
        schema_cache: SchemaContextCache,
    ) -> Self {
        Self {
            llm,
            db,
            prompts,
            query_library,
            schema_cache,
        }
    }

    /// Wire up the OpenAI-compatible model, the SQLite database and the prompts
    /// named by `config`.
    ///
    /// Prompts come from the prompts directory when it exists, otherwise the
    /// bundled defaults are used.
    pub fn from_config(config: &AnalystConfig, config_dir: &Path) -> Result<Self> {
        let db = SqliteDatabase::open(&config.database_path)?;

        let prompts_dir = config.prompts_dir(config_dir);
        let prompts = if prompts_dir.is_dir() {
            PromptSet::load_dir(&prompts_dir)?
        } else {
            info!(
                "No prompts at {}, using bundled prompts",
                prompts_dir.display()
            );
            PromptSet::bundled()?
        };

        Ok(Self::new(
            Box::new(OpenAiModel::new(config)),
            Box::new(db),
            prompts,
            config.query_library_dir.clone(),
            SchemaContextCache::new(config.schema_cache_ttl()),
        ))
    }

    /// The schema context, served from cache while fresh.
    pub fn schema_context(&mut self) -> Arc<str> {
        self.schema_cache
            .get_or_build(self.db.as_ref(), self.query_library.as_deref())
    }

    /// Drop the cached schema context so the next question rebuilds it.
    pub fn refresh_schema(&mut self) {
        self.schema_cache.invalidate();
    }

    /// [`run_analysis`] with this analyst's resources.
    pub async fn analyze(
        &mut self,
        question: &str,
        history: Option<&[Message]>,
        on_chunk: impl FnMut(&str),
    ) -> Result<AnalysisReport> {
        let schema_context = self.schema_context();
        run_analysis(
            self.llm.as_ref(),
            self.db.as_ref(),
            &self.prompts,
            question,
            history,
            &schema_context,
            on_chunk,
        )
        .await
    }
}
