use crate::models::Mock;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Reserved entry at session-root level. Storage collaborators place run
/// reports under it; it is never a valid session name.
pub const TEST_REPORTS_DIR: &str = "testReports";

/// Narrow seam between codecs and whatever persists mocks. Codecs append to
/// the current session and never learn the storage format.
#[async_trait]
pub trait MockWriter: Send + Sync {
    async fn write(&self, mock: Mock) -> Result<()>;
}

/// Counterpart used when preloading a replay run. `load` must return the
/// exact sequence the session's writer produced.
#[async_trait]
pub trait MockReader: Send + Sync {
    async fn load(&self, session: &str) -> Result<Vec<Mock>>;
}

/// Session-scoped writer that assigns unique `mock-<n>` names and hands the
/// finished mock to a channel, mirroring how codecs emit mocks as exchanges
/// complete rather than at connection end.
pub struct SessionWriter {
    session: String,
    seq: AtomicU64,
    tx: mpsc::Sender<Mock>,
}

impl SessionWriter {
    pub fn new(session: impl Into<String>, tx: mpsc::Sender<Mock>) -> Self {
        Self {
            session: session.into(),
            seq: AtomicU64::new(0),
            tx,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }
}

#[async_trait]
impl MockWriter for SessionWriter {
    async fn write(&self, mut mock: Mock) -> Result<()> {
        if mock.name.is_empty() {
            let n = self.seq.fetch_add(1, Ordering::Relaxed);
            mock.name = format!("mock-{}", n);
        }
        self.tx
            .send(mock)
            .await
            .context("mock sink closed before the session finished")
    }
}

/// In-process store keyed by session name. Stands in for the external
/// storage collaborator in tests and in single-process record-then-replay
/// runs; insertion order is preserved per session.
#[derive(Debug, Default)]
pub struct InMemoryMockStore {
    sessions: Mutex<HashMap<String, Vec<Mock>>>,
}

impl InMemoryMockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, session: &str, mock: Mock) {
        let mut sessions = self.sessions.lock().expect("mock store lock");
        sessions.entry(session.to_string()).or_default().push(mock);
    }

    pub fn session_names(&self) -> Vec<String> {
        let sessions = self.sessions.lock().expect("mock store lock");
        let mut names: Vec<String> = sessions
            .keys()
            .filter(|name| name.as_str() != TEST_REPORTS_DIR)
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl MockReader for InMemoryMockStore {
    async fn load(&self, session: &str) -> Result<Vec<Mock>> {
        let sessions = self.sessions.lock().expect("mock store lock");
        Ok(sessions.get(session).cloned().unwrap_or_default())
    }
}
