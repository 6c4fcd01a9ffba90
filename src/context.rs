//! # Schema context
//!
//! Builds the text that grounds SQL generation: the DDL of every table followed
//! by the example queries of the query library.
//!
//! ```text
//! ### Database schema (DDL)
//!
//! CREATE TABLE students (...)
//!
//! CREATE TABLE submissions (...)
//!
//!
//! ### Example SQL queries
//!
//! -- From: weekly_retention.sql
//! SELECT ...
//! ```
//!
//! Building is best-effort. A table whose DDL cannot be read is skipped, and a
//! missing or empty query library omits the examples section; both only log a
//! warning. [`SchemaContextCache`] keeps the result for a configurable time so
//! the per-table round-trips are not repeated on every question.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::database::Database;

pub const SCHEMA_HEADER: &str = "### Database schema (DDL)";
pub const EXAMPLES_HEADER: &str = "\n### Example SQL queries";

/// Build the schema context for `db`, adding the `.sql` files found under
/// `query_library` (recursively) when given.
pub fn build_schema_context(db: &dyn Database, query_library: Option<&Path>) -> String {
    let mut parts = Vec::new();

    match db.table_names() {
        Ok(tables) => {
            parts.push(SCHEMA_HEADER.to_string());
            for table in tables {
                match db.table_ddl(&table) {
                    Ok(ddl) => parts.push(ddl),
                    Err(err) => warn!("DDL for table `{table}` could not be retrieved: {err}"),
                }
            }
        }
        Err(err) => warn!("Could not list database tables: {err}"),
    }

    if let Some(dir) = query_library {
        let examples = example_queries(dir);
        if !examples.is_empty() {
            parts.push(EXAMPLES_HEADER.to_string());
            parts.extend(examples);
        }
    }

    parts.join("\n\n")
}

/// `-- From: <name>\n<contents>` for every readable `.sql` file under `dir`,
/// in path order.
fn example_queries(dir: &Path) -> Vec<String> {
    if !dir.is_dir() {
        debug!("Query library {} not found", dir.display());
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("Skipping query library entry: {err}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    files.sort();

    files
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            match fs::read_to_string(&path) {
                Ok(sql) => Some(format!("-- From: {name}\n{sql}")),
                Err(err) => {
                    warn!("Could not read example query {}: {err}", path.display());
                    None
                }
            }
        })
        .collect()
}

/// Time-bounded cache of one schema context.
#[derive(Debug)]
pub struct SchemaContextCache {
    ttl: Duration,
    entry: Option<(Instant, Arc<str>)>,
}

impl SchemaContextCache {
    /// A `ttl` of zero disables caching.
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entry: None }
    }

    /// The cached context while it is younger than the TTL, otherwise a fresh build.
    pub fn get_or_build(&mut self, db: &dyn Database, query_library: Option<&Path>) -> Arc<str> {
        if let Some((built_at, context)) = &self.entry {
            if built_at.elapsed() < self.ttl {
                return Arc::clone(context);
            }
        }

        debug!("Building schema context");
        let context: Arc<str> = build_schema_context(db, query_library).into();
        self.entry = Some((Instant::now(), Arc::clone(&context)));
        context
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::{QueryOutput, SqliteDatabase},
        error::{AnalystError, Result},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Two tables, the second of which cannot describe itself.
    struct FlakyDdl {
        ddl_calls: AtomicUsize,
    }

    impl Database for FlakyDdl {
        fn table_names(&self) -> Result<Vec<String>> {
            Ok(vec!["good".into(), "broken".into()])
        }

        fn table_ddl(&self, table: &str) -> Result<String> {
            self.ddl_calls.fetch_add(1, Ordering::SeqCst);
            match table {
                "good" => Ok("CREATE TABLE good (id INTEGER)".into()),
                _ => Err(AnalystError::Database(rusqlite::Error::QueryReturnedNoRows)),
            }
        }

        fn execute(&self, _sql: &str) -> Result<QueryOutput> {
            Ok(QueryOutput::Affected(0))
        }
    }

    fn flaky() -> FlakyDdl {
        FlakyDdl {
            ddl_calls: AtomicUsize::new(0),
        }
    }

    #[test]
    fn ddl_for_every_table_in_order() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE a_students (id INTEGER PRIMARY KEY);
             CREATE TABLE b_submissions (student_id INTEGER, week INTEGER);",
        )
        .unwrap();

        let context = build_schema_context(&db, None);
        assert_eq!(
            context,
            "### Database schema (DDL)\n\n\
             CREATE TABLE a_students (id INTEGER PRIMARY KEY)\n\n\
             CREATE TABLE b_submissions (student_id INTEGER, week INTEGER)"
        );
    }

    #[test]
    fn failing_table_is_skipped() {
        let context = build_schema_context(&flaky(), None);
        assert!(context.contains("CREATE TABLE good"));
        assert!(!context.contains("broken"));
    }

    #[test]
    fn example_queries_are_read_recursively_with_their_file_name() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("retention")).unwrap();
        fs::write(dir.path().join("a_top.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("retention/weekly.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("notes.txt"), "not sql").unwrap();

        let context = build_schema_context(&flaky(), Some(dir.path()));
        let examples = context.split(EXAMPLES_HEADER).nth(1).unwrap();
        assert_eq!(
            examples,
            "\n\n-- From: a_top.sql\nSELECT 1;\n\n-- From: weekly.sql\nSELECT 2;"
        );
        assert!(!context.contains("not sql"));
    }

    #[test]
    fn missing_or_empty_library_omits_examples() {
        let missing = build_schema_context(&flaky(), Some(Path::new("/definitely/not/here")));
        assert!(!missing.contains("Example SQL"));

        let empty = TempDir::new().unwrap();
        let context = build_schema_context(&flaky(), Some(empty.path()));
        assert!(!context.contains("Example SQL"));
    }

    #[test]
    fn cache_reuses_context_within_ttl() {
        let db = flaky();
        let mut cache = SchemaContextCache::new(Duration::from_secs(3600));
        let first = cache.get_or_build(&db, None);
        let second = cache.get_or_build(&db, None);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(db.ddl_calls.load(Ordering::SeqCst), 2);

        cache.invalidate();
        cache.get_or_build(&db, None);
        assert_eq!(db.ddl_calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn zero_ttl_rebuilds_every_time() {
        let db = flaky();
        let mut cache = SchemaContextCache::new(Duration::ZERO);
        cache.get_or_build(&db, None);
        cache.get_or_build(&db, None);
        assert_eq!(db.ddl_calls.load(Ordering::SeqCst), 4);
    }
}
