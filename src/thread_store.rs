//! # Thread Store
//!
//! Owns the collection of analysis [`Thread`]s and is the only reader and writer
//! of its backing JSON file.
//!
//! ## What this module owns
//! - An ordered `Vec<Thread>`, most recently created first.
//! - The file at `path`, rewritten in full after every mutation.
//!
//! ## Failure model
//! - Loading never fails: a missing file is an empty store, and an unreadable or
//!   malformed file is logged and treated as empty.
//! - Writing can fail. The in-memory change has already been applied by then and
//!   stays authoritative for the session; the failure is handed back inside
//!   [`Persisted`] so the caller can surface it.
//!
//! ## Typical flow
//! 1. `ThreadStore::load(path)` once at start-up.
//! 2. `create_thread` after a first report, `append_message` for follow-ups.
//! 3. `delete_thread` / `clear_all` from the history management commands.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    error::{AnalystError, Result},
    models::{Message, Role, Thread},
};

/// Value of a store mutation together with the outcome of persisting it.
///
/// The mutation itself always happened; `write_error` is set when the file
/// could not be rewritten afterwards.
#[must_use = "a failed write should be reported"]
#[derive(Debug)]
pub struct Persisted<T> {
    pub value: T,
    pub write_error: Option<AnalystError>,
}

impl<T> Persisted<T> {
    pub(crate) fn new(value: T, outcome: Result<()>) -> Self {
        Self {
            value,
            write_error: outcome.err(),
        }
    }

    /// Fails with the write error, if any, discarding the value.
    pub fn into_result(self) -> Result<T> {
        match self.write_error {
            Some(err) => Err(err),
            None => Ok(self.value),
        }
    }

    /// Logs a write failure and returns the value regardless.
    pub fn log_failure(self) -> T {
        if let Some(err) = &self.write_error {
            warn!("{err}");
        }
        self.value
    }
}

/// Durable, ordered collection of analysis threads.
#[derive(Debug)]
pub struct ThreadStore {
    path: PathBuf,
    threads: Vec<Thread>,
}

impl ThreadStore {
    /// Open the store backed by `path`.
    ///
    /// A missing, unreadable or malformed file yields an empty collection.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let threads = read_threads(&path);
        debug!("Loaded {} thread(s) from {}", threads.len(), path.display());
        Self { path, threads }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All threads, most recently created first.
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn get_thread(&self, thread_id: &str) -> Option<&Thread> {
        self.threads.iter().find(|t| t.id == thread_id)
    }

    /// Look a thread up by its id or by a prefix matching exactly one id.
    pub fn resolve(&self, key: &str) -> Result<&Thread> {
        if let Some(thread) = self.get_thread(key) {
            return Ok(thread);
        }
        let mut matches = self.threads.iter().filter(|t| t.id.starts_with(key));
        match (matches.next(), matches.next()) {
            (Some(thread), None) if !key.is_empty() => Ok(thread),
            _ => Err(AnalystError::ThreadNotFound(key.to_string())),
        }
    }

    /// Record a first exchange as a new thread at the front of the collection.
    ///
    /// Returns the generated thread id.
    pub fn create_thread(&mut self, question: &str, report: &str) -> Persisted<String> {
        let thread = Thread::new(question, report);
        let id = thread.id.clone();
        self.threads.insert(0, thread);
        Persisted::new(id, self.save())
    }

    /// Append a message to an existing thread.
    ///
    /// Unknown ids are a silent no-op (`value == false`) and nothing is written.
    pub fn append_message(
        &mut self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> Persisted<bool> {
        let Some(thread) = self.threads.iter_mut().find(|t| t.id == thread_id) else {
            debug!("append_message: no thread {thread_id}");
            return Persisted::new(false, Ok(()));
        };
        thread.messages.push(Message {
            role,
            content: content.to_string(),
        });
        Persisted::new(true, self.save())
    }

    /// Remove a thread. `value` tells whether one was removed.
    pub fn delete_thread(&mut self, thread_id: &str) -> Persisted<bool> {
        let before = self.threads.len();
        self.threads.retain(|t| t.id != thread_id);
        let removed = self.threads.len() != before;
        Persisted::new(removed, self.save())
    }

    /// Remove every thread.
    pub fn clear_all(&mut self) -> Persisted<()> {
        self.threads.clear();
        Persisted::new((), self.save())
    }

    /// Rewrite the backing file with the whole collection.
    ///
    /// Goes through a sibling `.json.tmp` file renamed over the target.
    fn save(&self) -> Result<()> {
        write_threads(&self.path, &self.threads).map_err(|source| AnalystError::Persist {
            path: self.path.clone(),
            source: Box::new(source),
        })
    }
}

fn read_threads(path: &Path) -> Vec<Thread> {
    if !path.exists() {
        return Vec::new();
    }
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!("Could not read thread store {}: {err}", path.display());
            return Vec::new();
        }
    };
    match serde_json::from_str(&content) {
        Ok(threads) => threads,
        Err(err) => {
            warn!(
                "Thread store {} is corrupt, starting empty: {err}",
                path.display()
            );
            Vec::new()
        }
    }
}

fn write_threads(path: &Path, threads: &[Thread]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(threads)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    if let Err(err) = fs::rename(&tmp, path) {
        if let Err(cleanup) = fs::remove_file(&tmp) {
            warn!("Could not remove {}: {cleanup}", tmp.display());
        }
        return Err(err.into());
    }
    Ok(())
}
