//! # Database access
//!
//! The pipeline only needs three things from the analysed database: the table
//! names, a table's DDL, and a way to run arbitrary SQL. [`Database`] is that
//! seam; [`SqliteDatabase`] implements it over `rusqlite`.
//!
//! Result sets come back as [`QueryOutput`], with every cell already rendered to
//! display text so the report prompt can embed them as a markdown table.

use std::{path::Path, sync::Mutex};

use rusqlite::{Connection, OpenFlags, types::ValueRef};
use tracing::debug;

use crate::error::{AnalystError, Result};

/// Read/execute access to the database being analysed.
pub trait Database: Send + Sync {
    /// Table names in enumeration order.
    fn table_names(&self) -> Result<Vec<String>>;

    /// The DDL (`CREATE TABLE …`) of one table.
    fn table_ddl(&self, table: &str) -> Result<String>;

    /// Run one SQL statement.
    fn execute(&self, sql: &str) -> Result<QueryOutput>;
}

/// Rows returned by a query. Cells are display text; `NULL` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ResultSet {
    /// Render as a GitHub-style markdown table with a leading row index.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("|    |");
        for column in &self.columns {
            out.push_str(&format!(" {} |", escape_cell(column)));
        }
        out.push_str("\n|---:|");
        for _ in &self.columns {
            out.push_str(":---|");
        }
        for (index, row) in self.rows.iter().enumerate() {
            out.push_str(&format!("\n| {index} |"));
            for cell in row {
                out.push_str(&format!(" {} |", escape_cell(cell)));
            }
        }
        out
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

/// Outcome of [`Database::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutput {
    /// The statement produced a result set (possibly empty).
    Rows(ResultSet),
    /// The statement produced no result set; holds the affected row count.
    Affected(usize),
}

impl QueryOutput {
    /// Text handed to the report prompt.
    pub fn to_markdown(&self) -> String {
        match self {
            QueryOutput::Rows(rows) => rows.to_markdown(),
            QueryOutput::Affected(count) => {
                format!("_Statement executed without a result set ({count} row(s) affected)._")
            }
        }
    }
}

/// A SQLite database.
pub struct SqliteDatabase {
    connection: Mutex<Connection>,
}

impl SqliteDatabase {
    /// Open an existing database file for reading and writing.
    pub fn open(path: &Path) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI;
        let connection = Connection::open_with_flags(path, flags)?;
        debug!("Opened database {}", path.display());
        Ok(Self::from_connection(connection))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self {
            connection: Mutex::new(connection),
        }
    }

    /// Run a batch of statements (schema setup, fixtures).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|err| AnalystError::DatabaseUnavailable(err.to_string()))
    }
}

impl Database for SqliteDatabase {
    fn table_names(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    fn table_ddl(&self, table: &str) -> Result<String> {
        let conn = self.lock()?;
        let ddl = conn.query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get::<_, String>(0),
        )?;
        Ok(ddl)
    }

    fn execute(&self, sql: &str) -> Result<QueryOutput> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        if stmt.column_count() == 0 {
            let affected = stmt.execute([])?;
            return Ok(QueryOutput::Affected(affected));
        }

        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let width = columns.len();
        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut cells = Vec::with_capacity(width);
            for index in 0..width {
                cells.push(render_value(row.get_ref(index)?));
            }
            rows.push(cells);
        }
        Ok(QueryOutput::Rows(ResultSet { columns, rows }))
    }
}

fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ValueRef::Blob(bytes) => format!("<{} bytes>", bytes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> SqliteDatabase {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE submissions (student_id INTEGER, week INTEGER, note TEXT);
             CREATE TABLE students (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO submissions VALUES (1, 1, 'ok'), (2, 1, NULL), (1, 2, 'a|b');",
        )
        .unwrap();
        db
    }

    #[test]
    fn lists_tables_and_their_ddl() {
        let db = fixture();
        assert_eq!(db.table_names().unwrap(), vec!["students", "submissions"]);
        let ddl = db.table_ddl("students").unwrap();
        assert!(ddl.starts_with("CREATE TABLE students"));
        assert!(db.table_ddl("nope").is_err());
    }

    #[test]
    fn select_returns_rendered_rows() {
        let db = fixture();
        let output = db
            .execute("SELECT week, COUNT(*) AS n FROM submissions GROUP BY week ORDER BY week")
            .unwrap();
        assert_eq!(
            output,
            QueryOutput::Rows(ResultSet {
                columns: vec!["week".into(), "n".into()],
                rows: vec![vec!["1".into(), "2".into()], vec!["2".into(), "1".into()]],
            })
        );
    }

    #[test]
    fn statement_without_result_set_reports_affected_rows() {
        let db = fixture();
        let output = db.execute("DELETE FROM submissions WHERE week = 1").unwrap();
        assert_eq!(output, QueryOutput::Affected(2));
    }

    #[test]
    fn bad_sql_surfaces_database_message() {
        let db = fixture();
        let err = db.execute("SELECT missing_column FROM submissions").unwrap_err();
        assert!(err.to_string().contains("missing_column"));
    }

    #[test]
    fn poisoned_connection_is_reported_as_unavailable() {
        let db = fixture();
        std::thread::scope(|scope| {
            let holder = scope.spawn(|| {
                let _guard = db.connection.lock().unwrap();
                panic!("panicked while holding the connection");
            });
            assert!(holder.join().is_err());
        });

        let err = db.execute("SELECT 1").unwrap_err();
        assert!(matches!(err, AnalystError::DatabaseUnavailable(_)));
        assert!(err.to_string().starts_with("database connection unavailable"));
    }

    #[test]
    fn markdown_table_escapes_pipes_and_shows_nulls_empty() {
        let db = fixture();
        let output = db
            .execute("SELECT student_id, note FROM submissions ORDER BY rowid")
            .unwrap();
        assert_eq!(
            output.to_markdown(),
            "|    | student_id | note |\n\
             |---:|:---|:---|\n\
             | 0 | 1 | ok |\n\
             | 1 | 2 |  |\n\
             | 2 | 1 | a\\|b |"
        );
    }
}
