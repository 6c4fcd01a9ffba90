//! Main module for the DB Analyst CLI application (`analyst`).
//!
//! This module provides the main function and auxiliary functionalities for
//! the CLI application. It handles command parsing, configuration loading, and
//! initialization, as well as invoking the appropriate functionalities based on
//! the provided command-line arguments.
//!
//! # Examples
//!
//! Initializing the configuration and prompt templates:
//!
//! ```sh
//! analyst init
//! ```
//!
//! Asking a question, then following up on it:
//!
//! ```sh
//! analyst ask "Which cohort had the best week-4 retention?"
//! analyst threads
//! analyst follow-up 3f2a "How does that compare to last term?"
//! ```
//!
//! Printing the weekly retention table with the model's comments:
//!
//! ```sh
//! analyst retention --analyze
//! ```

use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use chrono::Utc;
use clap::Parser;
use crossterm::style::Stylize;
use db_analyst::{
    api::OpenAiModel,
    commands::{Cli, Commands, RetentionSort},
    config::{self, AnalystConfig},
    config_dir,
    database::SqliteDatabase,
    error::{AnalystError, Result},
    models::{Role, Thread},
    pipeline::{AnalysisReport, Analyst},
    pretty::{PrettyPrinter, print_pretty, print_sql},
    retention::{self, AnalysisCache},
    session::{Session, View},
    template,
    thread_store::{Persisted, ThreadStore},
};
use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::OnceCell;
use tracing::{Level, debug, error, info, warn};

static TRACING: OnceCell<()> = OnceCell::new();

const SHORT_ID: usize = 8;

fn main() -> ExitCode {
    let cli = Cli::parse();
    TRACING.get_or_init(|| init_tracing(cli.verbose));

    let outcome = tokio::runtime::Runtime::new()
        .map_err(AnalystError::from)
        .and_then(|runtime| runtime.block_on(run(cli)));

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}

/// Main asynchronous function of the analyst CLI.
///
/// Loads configuration (except for `init`) and executes the requested command.
async fn run(cli: Cli) -> Result<()> {
    let config_dir = config_dir()?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.yaml"));

    if let Commands::Init = cli.command {
        debug!("Initializing configuration");
        return init(&config_dir, &config_path);
    }

    let config = config::load_config(&config_path)?;
    debug!("Config loaded: {:?}", config);
    let store_path = config.thread_store_path(&config_dir);

    match cli.command {
        Commands::Ask { question } => {
            let mut session = open_session(&config, &config_dir)?;
            ask(&mut session, &question).await?;
        }
        Commands::FollowUp { thread, question } => {
            let mut session = open_session(&config, &config_dir)?;
            let id = session.store().resolve(&thread)?.id.clone();
            session.select_thread(&id)?;
            follow_up(&mut session, &question).await?;
        }
        Commands::Threads => list_threads(&ThreadStore::load(store_path)),
        Commands::Show { thread } => {
            let store = ThreadStore::load(store_path);
            show_thread(store.resolve(&thread)?)?;
        }
        Commands::Delete { thread } => {
            let mut store = ThreadStore::load(store_path);
            let id = store.resolve(&thread)?.id.clone();
            store.delete_thread(&id).into_result()?;
            println!("Deleted thread {}", short_id(&id));
        }
        Commands::Clear => {
            ThreadStore::load(store_path).clear_all().into_result()?;
            println!("All threads deleted");
        }
        Commands::Interactive => {
            let session = open_session(&config, &config_dir)?;
            interactive(session).await?;
        }
        Commands::Retention {
            query,
            sort,
            ascending,
            analyze,
            refresh,
        } => {
            let request = RetentionRequest {
                query,
                sort,
                ascending,
                analyze,
                refresh,
            };
            show_retention(&config, &config_dir, request).await?;
        }
        Commands::Schema => {
            let mut analyst = Analyst::from_config(&config, &config_dir)?;
            println!("{}", analyst.schema_context());
        }
        Commands::Init => {}
    }

    Ok(())
}

fn open_session(config: &AnalystConfig, config_dir: &Path) -> Result<Session> {
    let analyst = Analyst::from_config(config, config_dir)?;
    let store = ThreadStore::load(config.thread_store_path(config_dir));
    Ok(Session::new(analyst, store))
}

/// Initializes the application's configuration and prompt templates.
///
/// An existing configuration file or template is left untouched.
fn init(config_dir: &Path, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        info!("Config already exists: {}", config_path.display());
        println!("Keeping existing config {}", config_path.display());
    } else {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        info!("Creating config file: {}", config_path.display());
        let config_yaml = serde_yaml::to_string(&AnalystConfig::default())?;
        fs::write(config_path, config_yaml)?;
        println!("Wrote {}", config_path.display());
    }

    let prompts_dir = AnalystConfig::default().prompts_dir(config_dir);
    info!("Creating template directory: {}", prompts_dir.display());
    for path in template::write_bundled(&prompts_dir)? {
        println!("Wrote {}", path.display());
    }
    Ok(())
}

/// Spinner while the pipeline works, then the report streamed as it arrives.
struct ReportView {
    spinner: ProgressBar,
    printer: PrettyPrinter,
    render_error: Option<AnalystError>,
}

impl ReportView {
    fn start(message: &'static str) -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(style);
        }
        spinner.set_message(message);
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self {
            spinner,
            printer: PrettyPrinter::stdout(),
            render_error: None,
        }
    }

    fn on_chunk(&mut self, chunk: &str) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
        if self.render_error.is_none() {
            if let Err(err) = self.printer.add_chunk(chunk) {
                self.render_error = Some(err);
            }
        }
    }

    /// Stops the spinner, warns about a failed write and hands back the value.
    fn finish<T>(mut self, outcome: Result<Persisted<T>>) -> Result<T> {
        self.spinner.finish_and_clear();
        self.printer.flush()?;
        let answered = outcome?;
        if let Some(err) = answered.write_error {
            warn!("{err}");
            eprintln!("{} {err}", "warning:".yellow());
        }
        match self.render_error {
            Some(err) => Err(err),
            None => Ok(answered.value),
        }
    }
}

fn log_report(report: AnalysisReport) {
    info!("Answered in {} attempt(s) with:\n{}", report.attempts, report.sql);
}

async fn ask(session: &mut Session, question: &str) -> Result<()> {
    let mut view = ReportView::start("Analysing...");
    let outcome = session
        .submit_question(question, |chunk| view.on_chunk(chunk))
        .await;
    view.finish(outcome).map(log_report)
}

async fn follow_up(session: &mut Session, question: &str) -> Result<()> {
    let mut view = ReportView::start("Following up...");
    let outcome = session
        .follow_up(question, |chunk| view.on_chunk(chunk))
        .await;
    view.finish(outcome).map(log_report)
}

async fn retry_pending(session: &mut Session) -> Result<()> {
    let mut view = ReportView::start("Answering...");
    let outcome = session.answer_pending(|chunk| view.on_chunk(chunk)).await;
    match outcome {
        Ok(Some(answered)) => view.finish(Ok(answered)).map(log_report),
        Ok(None) => {
            view.spinner.finish_and_clear();
            println!("Nothing to answer in this thread");
            Ok(())
        }
        Err(err) => view.finish::<AnalysisReport>(Err(err)).map(log_report),
    }
}

/// Options of the `retention` subcommand.
struct RetentionRequest {
    query: Option<PathBuf>,
    sort: RetentionSort,
    ascending: bool,
    analyze: bool,
    refresh: bool,
}

/// Print the retention table, then the model's analysis of it when asked.
async fn show_retention(
    config: &AnalystConfig,
    config_dir: &Path,
    request: RetentionRequest,
) -> Result<()> {
    let query_path = request
        .query
        .or_else(|| config.retention_query.clone())
        .ok_or_else(|| AnalystError::Config("set `retention_query` or pass --query".to_string()))?;
    let db = SqliteDatabase::open(&config.database_path)?;
    let mut table = retention::load_retention_table(&db, &query_path)?;
    let column = request.sort.column();
    if !retention::sort_cohorts(&mut table, column, request.ascending) {
        warn!("Retention table has no `{column}` column, keeping the query order");
    }

    if table.rows.is_empty() {
        println!("No retention data to show");
        return Ok(());
    }
    print_pretty(&table.to_markdown())?;
    if !request.analyze {
        return Ok(());
    }

    let prompt = template::load_or_bundled(
        &config.prompts_dir(config_dir),
        template::RETENTION_ANALYSIS,
    )?;
    let cache = AnalysisCache::new(config.retention_cache_path(config_dir));
    let llm = OpenAiModel::new(config);
    let now = Utc::now();

    println!();
    let mut view = ReportView::start("Analysing retention...");
    let outcome = retention::analyze_retention(
        &llm,
        &prompt,
        &table,
        &cache,
        request.refresh,
        now,
        |chunk| view.on_chunk(chunk),
    )
    .await;
    let analysed = view.finish(outcome)?;

    if analysed.from_cache {
        let remaining = analysed.analysis.remaining(now);
        println!(
            "{}",
            format!(
                "Analysis from {}, a new one is possible in {}h {}m (--refresh to force)",
                analysed.analysis.created_at.format("%Y-%m-%d %H:%M"),
                remaining.num_hours(),
                remaining.num_minutes() % 60
            )
            .dark_grey()
        );
        print_pretty(&analysed.analysis.analysis)?;
    }
    Ok(())
}

const HELP: &str = "\
Type a question to analyse it. Inside a thread, questions are follow-ups.
  /new            start a new analysis
  /threads        list saved threads
  /open <id>      open a thread (id or unique prefix)
  /retry          answer the unanswered question of the open thread
  /delete <id>    delete a thread
  /clear          delete every thread
  /schema         print the schema context (rebuilt)
  /exit           quit";

/// Read questions and commands from stdin until `/exit` or end of input.
async fn interactive(mut session: Session) -> Result<()> {
    println!("{HELP}\n");
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        let prompt = match session.view() {
            View::NewAnalysis => "new".to_string(),
            View::ViewingThread(id) => short_id(id).to_string(),
        };
        print!("{} ", format!("{prompt}>").cyan());
        io::stdout().flush()?;

        let Some(line) = lines.next() else { break };
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let result = match line.strip_prefix('/') {
            Some(command) => {
                let (name, arg) = command.split_once(' ').unwrap_or((command, ""));
                match (name, arg.trim()) {
                    ("exit" | "quit", _) => break,
                    (name, arg) => repl_command(&mut session, name, arg).await,
                }
            }
            None if *session.view() == View::NewAnalysis => ask(&mut session, line).await,
            None => follow_up(&mut session, line).await,
        };

        if let Err(err) = result {
            report_error(&err);
        }
    }
    Ok(())
}

async fn repl_command(session: &mut Session, name: &str, arg: &str) -> Result<()> {
    match name {
        "new" => session.new_analysis(),
        "threads" => list_threads(session.store()),
        "open" => {
            let id = session.store().resolve(arg)?.id.clone();
            let thread = session.select_thread(&id)?;
            show_thread(thread)?;
            if thread.pending_question().is_some() {
                println!("The last question has no answer yet, /retry to answer it");
            }
        }
        "retry" => retry_pending(session).await?,
        "delete" => {
            let id = session.store().resolve(arg)?.id.clone();
            session.delete_thread(&id).into_result()?;
            println!("Deleted thread {}", short_id(&id));
        }
        "clear" => {
            session.clear_all().into_result()?;
            println!("All threads deleted");
        }
        "schema" => {
            let analyst = session.analyst_mut();
            analyst.refresh_schema();
            println!("{}", analyst.schema_context());
        }
        "help" => println!("{HELP}"),
        other => println!("Unknown command /{other}, /help lists the commands"),
    }
    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID).unwrap_or(id)
}

fn list_threads(store: &ThreadStore) {
    if store.threads().is_empty() {
        println!("No saved threads");
        return;
    }
    for thread in store.threads() {
        let created = thread
            .created_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".repeat(16));
        println!(
            "{}  {}  {} ({} messages)",
            short_id(&thread.id).cyan(),
            created.dark_grey(),
            thread.title,
            thread.messages.len()
        );
    }
}

fn show_thread(thread: &Thread) -> Result<()> {
    println!("{}\n", thread.title.clone().bold());
    for message in &thread.messages {
        let label = match message.role {
            Role::User => message.role.label().cyan(),
            Role::Assistant => message.role.label().green(),
        };
        println!("{}", label.bold());
        print_pretty(&message.content)?;
        println!();
    }
    Ok(())
}

fn report_error(err: &AnalystError) {
    error!("{err}");
    match err {
        AnalystError::QueryFailed {
            attempts,
            sql,
            message,
        } => {
            eprintln!(
                "{} the query still failed after {attempts} attempt(s): {message}",
                "Analysis failed:".red()
            );
            eprintln!("Last SQL:");
            if print_sql(sql).is_err() {
                eprintln!("{sql}");
            }
        }
        other => eprintln!("{} {other}", "error:".red()),
    }
}
