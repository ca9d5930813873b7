//! Operator prompts raised by running plugins.
//!
//! A plugin raises a [`Notice`] and gets back a [`PendingNotice`] it can
//! await; an operator lists open notices over the manager API and answers
//! one with `handleNotice`, which resolves the waiting plugin.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Notice {
    pub id: String,
    pub source: String,          // plugin or component that raised it
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,             // free-form hints for the operator, e.g. choices
    pub time: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NoticeError {
    #[error("no open notice with id `{0}`")]
    Unknown(String),
    #[error("notice `{0}` was withdrawn")]
    Withdrawn(String),
}

struct Open {
    notice: Notice,
    answer: oneshot::Sender<Value>,
    seq: u64,
}

#[derive(Default)]
pub struct NoticeBoard {
    next: AtomicU64,
    open: DashMap<String, Open>,
}

impl std::fmt::Debug for NoticeBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoticeBoard").field("open", &self.open.len()).finish()
    }
}

/// The raising side of an open notice.
#[derive(Debug)]
pub struct PendingNotice {
    notice: Notice,
    answer: oneshot::Receiver<Value>,
}

impl PendingNotice {
    pub fn notice(&self) -> &Notice {
        &self.notice
    }

    pub fn id(&self) -> &str {
        &self.notice.id
    }

    /// Waits for the operator's answer.
    pub async fn answer(self) -> Result<Value, NoticeError> {
        self.answer
            .await
            .map_err(|_| NoticeError::Withdrawn(self.notice.id))
    }
}

impl NoticeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(
        &self,
        source: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        data: Value,
    ) -> PendingNotice {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        let notice = Notice {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            title: title.into(),
            message: message.into(),
            data,
            time: Utc::now(),
        };
        let (tx, rx) = oneshot::channel();
        self.open.insert(
            notice.id.clone(),
            Open { notice: notice.clone(), answer: tx, seq },
        );
        info!(notice = %notice.id, source = %notice.source, title = %notice.title, "notice raised");
        PendingNotice { notice, answer: rx }
    }

    /// Open notices, oldest first.
    pub fn list(&self) -> Vec<Notice> {
        let mut open: Vec<(u64, Notice)> = self
            .open
            .iter()
            .map(|entry| (entry.seq, entry.notice.clone()))
            .collect();
        open.sort_by_key(|(seq, _)| *seq);
        open.into_iter().map(|(_, notice)| notice).collect()
    }

    /// Answers and closes notice `id`. An answer nobody waits for any more
    /// still closes the notice.
    pub fn handle(&self, id: &str, data: Value) -> Result<(), NoticeError> {
        let (_, open) = self
            .open
            .remove(id)
            .ok_or_else(|| NoticeError::Unknown(id.to_string()))?;
        if open.answer.send(data).is_err() {
            debug!(notice = %id, "notice answered after its raiser went away");
        }
        info!(notice = %id, "notice handled");
        Ok(())
    }

    /// Closes notice `id` without an answer; its waiter gets `Withdrawn`.
    pub fn withdraw(&self, id: &str) -> bool {
        self.open.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
