//! # Session
//!
//! Drives the pipeline and the thread store from discrete user actions.
//!
//! The session is always in one of two views:
//!
//! ```text
//!               submit_question (ok)
//!   NewAnalysis ─────────────────────▶ ViewingThread(id)
//!        ▲       select_thread(id)            │
//!        │                                    │ follow_up (stays)
//!        └────────────────────────────────────┘
//!   new_analysis · clear_all · delete_thread(active) · thread vanished
//! ```
//!
//! Follow-ups are recorded in two steps: the question is appended first, then
//! [`Session::answer_pending`] answers whatever user message ends the thread.
//! A thread left with an unanswered question (failed analysis, crash) is
//! answered the next time `answer_pending` runs for it.

use tracing::{info, warn};

use crate::{
    error::{AnalystError, Result},
    models::{Role, Thread},
    pipeline::{AnalysisReport, Analyst},
    thread_store::{Persisted, ThreadStore},
};

/// What the user is looking at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    NewAnalysis,
    ViewingThread(String),
}

/// One operator's analysis session.
pub struct Session {
    analyst: Analyst,
    store: ThreadStore,
    view: View,
}

impl Session {
    pub fn new(analyst: Analyst, store: ThreadStore) -> Self {
        Self {
            analyst,
            store,
            view: View::NewAnalysis,
        }
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    pub fn analyst_mut(&mut self) -> &mut Analyst {
        &mut self.analyst
    }

    /// The thread being viewed.
    ///
    /// A viewed thread that no longer exists drops the session back to
    /// [`View::NewAnalysis`].
    pub fn current_thread(&mut self) -> Option<&Thread> {
        let View::ViewingThread(id) = &self.view else {
            return None;
        };
        if self.store.get_thread(id).is_none() {
            warn!("Thread {id} no longer exists");
            self.view = View::NewAnalysis;
            return None;
        }
        self.store.get_thread(id)
    }

    /// Analyse a fresh question and record it as a new thread.
    ///
    /// On success the new thread becomes the viewed one. On failure nothing is
    /// recorded and the view is unchanged.
    pub async fn submit_question(
        &mut self,
        question: &str,
        on_chunk: impl FnMut(&str),
    ) -> Result<Persisted<AnalysisReport>> {
        let analysis = self.analyst.analyze(question, None, on_chunk).await?;
        let created = self.store.create_thread(question, &analysis.report);
        info!("Created thread {}", created.value);
        self.view = View::ViewingThread(created.value);
        Ok(Persisted {
            value: analysis,
            write_error: created.write_error,
        })
    }

    /// Ask a follow-up in the viewed thread.
    ///
    /// The question is stored before the analysis runs, so a failed analysis
    /// leaves it pending.
    pub async fn follow_up(
        &mut self,
        question: &str,
        on_chunk: impl FnMut(&str),
    ) -> Result<Persisted<AnalysisReport>> {
        let id = match self.current_thread() {
            Some(thread) => thread.id.clone(),
            None => return Err(AnalystError::NoActiveThread),
        };
        let appended = self.store.append_message(&id, Role::User, question);

        match self.answer_pending(on_chunk).await {
            Ok(Some(mut answered)) => {
                if answered.write_error.is_none() {
                    answered.write_error = appended.write_error;
                }
                Ok(answered)
            }
            Ok(None) => Err(AnalystError::NoActiveThread),
            Err(err) => {
                appended.log_failure();
                Err(err)
            }
        }
    }

    /// Answer the user message that ends the viewed thread, if there is one.
    ///
    /// Every earlier message is sent as conversation history.
    pub async fn answer_pending(
        &mut self,
        on_chunk: impl FnMut(&str),
    ) -> Result<Option<Persisted<AnalysisReport>>> {
        let (id, question, history) = {
            let Some(thread) = self.current_thread() else {
                return Err(AnalystError::NoActiveThread);
            };
            let Some(pending) = thread.pending_question() else {
                return Ok(None);
            };
            let earlier = thread.messages.len() - 1;
            (
                thread.id.clone(),
                pending.content.clone(),
                thread.messages[..earlier].to_vec(),
            )
        };

        let analysis = self
            .analyst
            .analyze(&question, Some(&history), on_chunk)
            .await?;
        let appended = self
            .store
            .append_message(&id, Role::Assistant, &analysis.report);
        Ok(Some(Persisted {
            value: analysis,
            write_error: appended.write_error,
        }))
    }

    /// View an existing thread.
    pub fn select_thread(&mut self, thread_id: &str) -> Result<&Thread> {
        if self.store.get_thread(thread_id).is_none() {
            return Err(AnalystError::ThreadNotFound(thread_id.to_string()));
        }
        self.view = View::ViewingThread(thread_id.to_string());
        self.store
            .get_thread(thread_id)
            .ok_or_else(|| AnalystError::ThreadNotFound(thread_id.to_string()))
    }

    /// Delete a thread; deleting the viewed one returns to a new analysis.
    pub fn delete_thread(&mut self, thread_id: &str) -> Persisted<bool> {
        let deleted = self.store.delete_thread(thread_id);
        if self.view == View::ViewingThread(thread_id.to_string()) {
            self.view = View::NewAnalysis;
        }
        deleted
    }

    /// Delete every thread and return to a new analysis.
    pub fn clear_all(&mut self) -> Persisted<()> {
        self.view = View::NewAnalysis;
        self.store.clear_all()
    }

    pub fn new_analysis(&mut self) {
        self.view = View::NewAnalysis;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::SchemaContextCache,
        models::Message,
        pipeline::testing::{ScriptedModel, echo_prompts, submissions_db},
    };
    use std::time::Duration;
    use tempfile::TempDir;

    const COUNT_SQL: &str = "```sql\nSELECT COUNT(*) FROM submissions\n```";

    fn session(dir: &TempDir, llm: &ScriptedModel) -> Session {
        let analyst = Analyst::new(
            Box::new(llm.clone()),
            Box::new(submissions_db()),
            echo_prompts(),
            None,
            SchemaContextCache::new(Duration::from_secs(60)),
        );
        Session::new(analyst, ThreadStore::load(dir.path().join("threads.json")))
    }

    /// Answers `question` as a new thread and checks that it was saved.
    async fn submit(session: &mut Session, question: &str) {
        let answered = session.submit_question(question, |_| {}).await.unwrap();
        assert!(answered.write_error.is_none());
    }

    fn viewed_id(session: &Session) -> String {
        match session.view() {
            View::ViewingThread(id) => id.clone(),
            View::NewAnalysis => panic!("no thread is viewed"),
        }
    }

    #[tokio::test]
    async fn submitting_a_question_opens_its_thread() {
        let dir = TempDir::new().unwrap();
        let llm = ScriptedModel::new([COUNT_SQL, "Three."]);
        let mut session = session(&dir, &llm);

        let answered = session.submit_question("How many?", |_| {}).await.unwrap();
        assert!(answered.write_error.is_none());

        let thread = session.current_thread().unwrap();
        assert_eq!(thread.title, "How many?");
        assert_eq!(
            thread.messages,
            vec![Message::user("How many?"), Message::assistant("Three.")]
        );
    }

    #[tokio::test]
    async fn failed_question_records_nothing() {
        let dir = TempDir::new().unwrap();
        let llm = ScriptedModel::new(["SELECT nope", "SELECT nope"]);
        let mut session = session(&dir, &llm);

        let err = session.submit_question("How many?", |_| {}).await.unwrap_err();
        assert!(matches!(err, AnalystError::QueryFailed { .. }));
        assert!(session.store().threads().is_empty());
        assert_eq!(session.view(), &View::NewAnalysis);
    }

    #[tokio::test]
    async fn follow_up_sends_the_thread_as_history() {
        let dir = TempDir::new().unwrap();
        let llm = ScriptedModel::new([COUNT_SQL, "R1", COUNT_SQL, "R2"]);
        let mut session = session(&dir, &llm);

        submit(&mut session, "Q1").await;
        let answered = session.follow_up("Q2", |_| {}).await.unwrap();
        assert_eq!(answered.value.report, "R2");

        let follow_up_prompt = &llm.prompts()[2];
        assert!(follow_up_prompt.contains("User:\nQ1\n\nAssistant:\nR1"));
        assert!(follow_up_prompt.ends_with("Q: Q2"));

        let id = viewed_id(&session);
        let reloaded = ThreadStore::load(dir.path().join("threads.json"));
        let roles: Vec<Role> = reloaded
            .get_thread(&id)
            .unwrap()
            .messages
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
    }

    #[tokio::test]
    async fn failed_follow_up_leaves_the_question_pending() {
        let dir = TempDir::new().unwrap();
        let llm = ScriptedModel::new([COUNT_SQL, "R1"]).then_fail("timeout");
        let mut session = session(&dir, &llm);

        submit(&mut session, "Q1").await;
        assert!(session.follow_up("Q2", |_| {}).await.is_err());

        let thread = session.current_thread().unwrap();
        assert_eq!(thread.pending_question(), Some(&Message::user("Q2")));
    }

    #[tokio::test]
    async fn pending_question_is_answered_later() {
        let dir = TempDir::new().unwrap();
        let llm = ScriptedModel::new([COUNT_SQL, "R1"]).then_fail("timeout");
        let mut session = session(&dir, &llm);
        submit(&mut session, "Q1").await;
        assert!(session.follow_up("Q2", |_| {}).await.is_err());

        let retry = ScriptedModel::new([COUNT_SQL, "R2"]);
        let id = viewed_id(&session);
        let mut session = Session::new(
            Analyst::new(
                Box::new(retry.clone()),
                Box::new(submissions_db()),
                echo_prompts(),
                None,
                SchemaContextCache::new(Duration::ZERO),
            ),
            ThreadStore::load(dir.path().join("threads.json")),
        );
        session.select_thread(&id).unwrap();

        let answered = session.answer_pending(|_| {}).await.unwrap().unwrap();
        assert_eq!(answered.value.report, "R2");
        assert!(session.answer_pending(|_| {}).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn follow_up_needs_a_viewed_thread() {
        let dir = TempDir::new().unwrap();
        let llm = ScriptedModel::default();
        let mut session = session(&dir, &llm);

        let err = session.follow_up("Q2", |_| {}).await.unwrap_err();
        assert!(matches!(err, AnalystError::NoActiveThread));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn deleting_the_viewed_thread_returns_to_new_analysis() {
        let dir = TempDir::new().unwrap();
        let llm = ScriptedModel::new([COUNT_SQL, "R1", COUNT_SQL, "R2"]);
        let mut session = session(&dir, &llm);

        submit(&mut session, "first").await;
        let first = viewed_id(&session);
        submit(&mut session, "second").await;
        let second = viewed_id(&session);

        assert!(session.delete_thread(&first).into_result().unwrap());
        assert_eq!(session.view(), &View::ViewingThread(second.clone()));

        assert!(session.delete_thread(&second).into_result().unwrap());
        assert_eq!(session.view(), &View::NewAnalysis);
        assert!(session.store().threads().is_empty());
    }

    #[tokio::test]
    async fn clear_all_empties_history() {
        let dir = TempDir::new().unwrap();
        let llm = ScriptedModel::new([COUNT_SQL, "R1"]);
        let mut session = session(&dir, &llm);
        submit(&mut session, "first").await;

        session.clear_all().into_result().unwrap();
        assert_eq!(session.view(), &View::NewAnalysis);
        assert!(ThreadStore::load(dir.path().join("threads.json"))
            .threads()
            .is_empty());
    }

    #[test]
    fn selecting_an_unknown_thread_fails() {
        let dir = TempDir::new().unwrap();
        let mut session = session(&dir, &ScriptedModel::default());
        let err = session.select_thread("missing").unwrap_err();
        assert!(matches!(err, AnalystError::ThreadNotFound(id) if id == "missing"));
        assert_eq!(session.view(), &View::NewAnalysis);
    }

    #[test]
    fn vanished_thread_falls_back_to_new_analysis() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("threads.json");
        let mut seeded = ThreadStore::load(&path);
        let id = seeded.create_thread("Q", "R").into_result().unwrap();

        let mut session = session(&dir, &ScriptedModel::default());
        session.select_thread(&id).unwrap();
        seeded.clear_all().into_result().unwrap();

        session.store = ThreadStore::load(&path);
        assert!(session.current_thread().is_none());
        assert_eq!(session.view(), &View::NewAnalysis);
    }
}
