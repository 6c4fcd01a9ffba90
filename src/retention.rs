//! # Weekly cohort retention
//!
//! Runs the configured retention query and asks the model to comment on the
//! resulting table, at most once per [`ANALYSIS_TTL_HOURS`] hours.
//!
//! The query is expected to return one row per cohort:
//!
//! ```text
//! cohort_week | cohort_size | Week 1 | Week 2 | ...
//! 2024-03-04  | 41          | 63.4   | 48.8   | ...
//! ```
//!
//! Only `cohort_week` is interpreted: timestamps in it are shortened to their
//! date. The other columns are shown as the query returns them.
//!
//! The latest analysis is kept in a small JSON file together with the time it
//! was produced:
//!
//! ```json
//! { "created_at": "2024-03-11T09:30:00Z", "analysis": "Retention drops ..." }
//! ```

use std::{
    cmp::Ordering,
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    api::{LanguageModel, collect_text},
    database::{Database, QueryOutput, ResultSet},
    error::{AnalystError, Result},
    pipeline::database_message,
    template::PromptTemplate,
    thread_store::Persisted,
};

pub const COHORT_WEEK: &str = "cohort_week";

/// How long a retention analysis is reused before the model is asked again.
pub const ANALYSIS_TTL_HOURS: i64 = 24;

/// Run the retention query stored at `query_path`.
///
/// ### Errors
/// [`AnalystError::Config`] when the file cannot be read, and
/// [`AnalystError::QueryFailed`] when the database rejects the statement or it
/// produces no result set.
pub fn load_retention_table(db: &dyn Database, query_path: &Path) -> Result<ResultSet> {
    let sql = fs::read_to_string(query_path).map_err(|err| {
        AnalystError::Config(format!("retention query {}: {err}", query_path.display()))
    })?;
    let sql = sql.trim().to_string();
    debug!("Retention query from {}:\n{sql}", query_path.display());

    match db.execute(&sql) {
        Ok(QueryOutput::Rows(mut table)) => {
            normalize_cohort_weeks(&mut table);
            Ok(table)
        }
        Ok(QueryOutput::Affected(_)) => Err(AnalystError::QueryFailed {
            attempts: 1,
            sql,
            message: "the statement returned no result set".into(),
        }),
        Err(err) => Err(AnalystError::QueryFailed {
            attempts: 1,
            message: database_message(err),
            sql,
        }),
    }
}

/// Order the rows by `column`, numerically when both cells are numbers.
///
/// Returns `false` and leaves the table untouched when there is no such column.
pub fn sort_cohorts(table: &mut ResultSet, column: &str, ascending: bool) -> bool {
    let Some(index) = table.columns.iter().position(|name| name == column) else {
        return false;
    };
    table.rows.sort_by(|a, b| {
        let ordering = compare_cells(cell(a, index), cell(b, index));
        if ascending { ordering } else { ordering.reverse() }
    });
    true
}

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(String::as_str).unwrap_or_default()
}

fn compare_cells(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.total_cmp(&b),
        _ => a.cmp(b),
    }
}

fn normalize_cohort_weeks(table: &mut ResultSet) {
    let Some(index) = table.columns.iter().position(|name| name == COHORT_WEEK) else {
        return;
    };
    for row in &mut table.rows {
        if let Some(value) = row.get_mut(index) {
            if let Some(date) = parse_date(value) {
                *value = date.format("%Y-%m-%d").to_string();
            }
        }
    }
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|at| at.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|at| at.date_naive()))
}

/// One analysis and the moment it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnalysis {
    pub created_at: DateTime<Utc>,
    pub analysis: String,
}

impl CachedAnalysis {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::hours(ANALYSIS_TTL_HOURS)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    /// Time left before a new analysis may be requested; zero once stale.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at() - now).max(Duration::zero())
    }
}

/// The JSON file holding the latest [`CachedAnalysis`].
#[derive(Debug, Clone)]
pub struct AnalysisCache {
    path: PathBuf,
}

impl AnalysisCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored analysis. A missing, unreadable or corrupt file is an empty cache.
    pub fn load(&self) -> Option<CachedAnalysis> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("Could not read {}: {err}", self.path.display());
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(cached) => Some(cached),
            Err(err) => {
                warn!("Ignoring corrupt analysis cache {}: {err}", self.path.display());
                None
            }
        }
    }

    /// The stored analysis while it is younger than [`ANALYSIS_TTL_HOURS`].
    pub fn fresh(&self, now: DateTime<Utc>) -> Option<CachedAnalysis> {
        self.load().filter(|cached| cached.is_fresh(now))
    }

    pub fn store(&self, cached: &CachedAnalysis) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(cached)?)?;
        Ok(())
    }
}

/// Outcome of [`analyze_retention`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionAnalysis {
    pub analysis: CachedAnalysis,
    /// `true` when the analysis came from the cache and no request was made.
    pub from_cache: bool,
}

/// Analyse `table` with the `retention_analysis` prompt.
///
/// A cached analysis younger than [`ANALYSIS_TTL_HOURS`] is returned as is
/// unless `refresh` is set. A new analysis is streamed through `on_chunk` and
/// then cached; a failed cache write is reported in the [`Persisted`] value. A
/// failed generation leaves the cache untouched.
pub async fn analyze_retention(
    llm: &dyn LanguageModel,
    prompt: &PromptTemplate,
    table: &ResultSet,
    cache: &AnalysisCache,
    refresh: bool,
    now: DateTime<Utc>,
    on_chunk: impl FnMut(&str),
) -> Result<Persisted<RetentionAnalysis>> {
    if !refresh {
        if let Some(cached) = cache.fresh(now) {
            info!("Reusing retention analysis from {}", cached.created_at);
            let reused = RetentionAnalysis {
                analysis: cached,
                from_cache: true,
            };
            return Ok(Persisted::new(reused, Ok(())));
        }
    }

    let markdown = table.to_markdown();
    let request = prompt.render(&[("data_frame", markdown.as_str())])?;
    debug!("Retention prompt:\n{request}");
    let analysis = collect_text(llm.generate(&request).await?, on_chunk).await?;

    let fresh = CachedAnalysis {
        created_at: now,
        analysis,
    };
    let written = cache.store(&fresh).map_err(|source| AnalystError::Persist {
        path: cache.path.clone(),
        source: Box::new(source),
    });
    Ok(Persisted::new(
        RetentionAnalysis {
            analysis: fresh,
            from_cache: false,
        },
        written,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{database::SqliteDatabase, pipeline::testing::ScriptedModel};
    use chrono::TimeZone;
    use tempfile::TempDir;

    const RETENTION_SQL: &str = r#"
        WITH cohorts AS (
            SELECT student_id, MIN(day) AS cohort_week
            FROM submissions
            GROUP BY student_id
        )
        SELECT
            c.cohort_week || ' 00:00:00' AS cohort_week,
            COUNT(DISTINCT c.student_id) AS cohort_size,
            ROUND(100.0 * COUNT(DISTINCT CASE
                WHEN julianday(s.day) - julianday(c.cohort_week) = 7 THEN s.student_id
            END) / COUNT(DISTINCT c.student_id), 1) AS "Week 1"
        FROM cohorts c
        JOIN submissions s USING (student_id)
        GROUP BY c.cohort_week
        ORDER BY c.cohort_week
    "#;

    fn submissions() -> SqliteDatabase {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE submissions (student_id INTEGER, day TEXT);
             INSERT INTO submissions VALUES
                 (1, '2024-01-01'), (2, '2024-01-01'), (1, '2024-01-08'), (3, '2024-01-08');",
        )
        .unwrap();
        db
    }

    fn query_file(dir: &TempDir, sql: &str) -> PathBuf {
        let path = dir.path().join("retention.sql");
        fs::write(&path, sql).unwrap();
        path
    }

    fn at(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 11, 9, 0, 0).unwrap() + Duration::hours(hours)
    }

    fn table() -> ResultSet {
        ResultSet {
            columns: vec![COHORT_WEEK.into(), "cohort_size".into(), "Week 1".into()],
            rows: vec![vec!["2024-01-01".into(), "2".into(), "50".into()]],
        }
    }

    #[test]
    fn retention_table_renders_newest_cohort_first() {
        let dir = TempDir::new().unwrap();
        let mut table = load_retention_table(&submissions(), &query_file(&dir, RETENTION_SQL))
            .unwrap();
        assert!(sort_cohorts(&mut table, COHORT_WEEK, false));
        assert_eq!(
            table.to_markdown(),
            "|    | cohort_week | cohort_size | Week 1 |\n\
             |---:|:---|:---|:---|\n\
             | 0 | 2024-01-08 | 1 | 0 |\n\
             | 1 | 2024-01-01 | 2 | 50 |"
        );
    }

    #[test]
    fn cohort_sizes_sort_numerically() {
        let mut table = ResultSet {
            columns: vec![COHORT_WEEK.into(), "cohort_size".into()],
            rows: vec![
                vec!["2024-01-01".into(), "10".into()],
                vec!["2024-01-08".into(), "9".into()],
            ],
        };
        assert!(sort_cohorts(&mut table, "cohort_size", true));
        assert_eq!(table.rows[0][1], "9");
        assert!(!sort_cohorts(&mut table, "missing", true));
        assert_eq!(table.rows[0][1], "9");
    }

    #[test]
    fn unreadable_or_rowless_queries_are_errors() {
        let dir = TempDir::new().unwrap();
        let missing = load_retention_table(&submissions(), &dir.path().join("nope.sql"));
        assert!(matches!(missing, Err(AnalystError::Config(_))));

        let delete = query_file(&dir, "DELETE FROM submissions");
        let err = load_retention_table(&submissions(), &delete).unwrap_err();
        assert!(matches!(err, AnalystError::QueryFailed { attempts: 1, .. }));

        let broken = query_file(&dir, "SELECT cohort FROM submissions");
        match load_retention_table(&submissions(), &broken).unwrap_err() {
            AnalystError::QueryFailed { sql, message, .. } => {
                assert_eq!(sql, "SELECT cohort FROM submissions");
                assert!(message.contains("no such column"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn analysis_stays_fresh_for_a_day() {
        let cached = CachedAnalysis {
            created_at: at(0),
            analysis: "flat".into(),
        };
        assert!(cached.is_fresh(at(23)));
        assert_eq!(cached.remaining(at(23)), Duration::hours(1));
        assert!(!cached.is_fresh(at(24)));
        assert!(!cached.is_fresh(at(25)));
        assert_eq!(cached.remaining(at(25)), Duration::zero());
    }

    #[test]
    fn cache_file_round_trips_and_tolerates_corruption() {
        let dir = TempDir::new().unwrap();
        let cache = AnalysisCache::new(dir.path().join("nested/ai_cache.json"));
        assert!(cache.load().is_none());

        let cached = CachedAnalysis {
            created_at: at(0),
            analysis: "Week 1 retention halves.".into(),
        };
        cache.store(&cached).unwrap();
        assert_eq!(cache.fresh(at(2)), Some(cached));
        assert!(cache.fresh(at(30)).is_none());

        fs::write(cache.path(), "{ not json").unwrap();
        assert!(cache.load().is_none());
    }

    #[tokio::test]
    async fn fresh_analysis_is_reused_without_a_request() {
        let dir = TempDir::new().unwrap();
        let cache = AnalysisCache::new(dir.path().join("ai_cache.json"));
        let earlier = CachedAnalysis {
            created_at: at(0),
            analysis: "earlier".into(),
        };
        cache.store(&earlier).unwrap();
        let prompt = PromptTemplate::new("retention_analysis", "Cohorts:\n{data_frame}");

        let llm = ScriptedModel::default();
        let outcome = analyze_retention(&llm, &prompt, &table(), &cache, false, at(3), |_| {})
            .await
            .unwrap();
        assert!(outcome.write_error.is_none());
        assert!(outcome.value.from_cache);
        assert_eq!(outcome.value.analysis, earlier);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn stale_or_refreshed_analysis_asks_the_model_again() {
        let dir = TempDir::new().unwrap();
        let cache = AnalysisCache::new(dir.path().join("ai_cache.json"));
        cache
            .store(&CachedAnalysis {
                created_at: at(0),
                analysis: "earlier".into(),
            })
            .unwrap();
        let prompt = PromptTemplate::new("retention_analysis", "Cohorts:\n{data_frame}");

        let llm = ScriptedModel::new(["Retention is flat.", "Week 1 halves."]);
        let mut streamed = String::new();
        let stale = analyze_retention(&llm, &prompt, &table(), &cache, false, at(25), |chunk| {
            streamed.push_str(chunk)
        })
        .await
        .unwrap()
        .into_result()
        .unwrap();
        assert!(!stale.from_cache);
        assert_eq!(streamed, "Retention is flat.");
        assert_eq!(llm.prompts()[0], format!("Cohorts:\n{}", table().to_markdown()));
        assert_eq!(cache.load().unwrap().created_at, at(25));

        let refreshed = analyze_retention(&llm, &prompt, &table(), &cache, true, at(26), |_| {})
            .await
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(refreshed.analysis.analysis, "Week 1 halves.");
        assert_eq!(cache.load().unwrap().analysis, "Week 1 halves.");
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn failed_analysis_keeps_the_previous_cache() {
        let dir = TempDir::new().unwrap();
        let cache = AnalysisCache::new(dir.path().join("ai_cache.json"));
        let prompt = PromptTemplate::new("retention_analysis", "{data_frame}");

        let llm = ScriptedModel::default().then_fail("rate limited");
        let err = analyze_retention(&llm, &prompt, &table(), &cache, false, at(0), |_| {})
            .await
            .unwrap_err();
        assert!(err.is_generation_error());
        assert!(cache.load().is_none());
    }
}
