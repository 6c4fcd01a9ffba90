//! # Conversation models
//!
//! Data structures persisted by the [`crate::thread_store`]:
//!
//! - [`Thread`]: one analysis conversation, rooted in the operator's first question.
//! - [`Message`]: one turn (user question or assistant report) within a thread.
//! - [`Role`]: who authored a message.
//!
//! ## Wire shape
//!
//! Threads serialize to the JSON layout below. `created_at` is optional so that
//! files written without it still load.
//!
//! ```json
//! {
//!   "id": "6f1c…",
//!   "title": "Which cohort kept submitting after…",
//!   "messages": [
//!     { "role": "user", "content": "Which cohort kept submitting after week 4?" },
//!     { "role": "assistant", "content": "## Summary\n…" }
//!   ],
//!   "created_at": "2026-10-14T09:12:44Z"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of characters of the first question kept in a thread title.
pub const TITLE_MAX_CHARS: usize = 35;

/// Appended to a title that was shortened.
pub const TITLE_ELLIPSIS: &str = "...";

/// Author of a [`Message`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Label used when a message is rendered into a prompt's conversation history.
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// One turn in a [`Thread`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A persisted analysis conversation.
///
/// `messages` is chronological; its order is the conversational context handed
/// to the model on every follow-up turn.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    /// Opaque unique identifier (UUID v4), immutable after creation.
    pub id: String,
    /// Display label derived from the first question, see [`truncate_title`].
    pub title: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Thread {
    /// Start a thread from a first question and its report.
    pub fn new(question: &str, report: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: truncate_title(question),
            messages: vec![Message::user(question), Message::assistant(report)],
            created_at: Some(Utc::now()),
        }
    }

    /// The last message, when it is a user question still waiting for a report.
    pub fn pending_question(&self) -> Option<&Message> {
        self.messages.last().filter(|m| m.role == Role::User)
    }
}

/// Shorten `text` to [`TITLE_MAX_CHARS`] characters, adding [`TITLE_ELLIPSIS`]
/// when anything was cut. Counts characters, not bytes.
pub fn truncate_title(text: &str) -> String {
    if text.chars().count() > TITLE_MAX_CHARS {
        let mut title: String = text.chars().take(TITLE_MAX_CHARS).collect();
        title.push_str(TITLE_ELLIPSIS);
        title
    } else {
        text.to_string()
    }
}
