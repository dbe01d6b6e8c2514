use crate::models::{Mock, MockKind};
use std::sync::Mutex;
use tracing::warn;

/// Session-scoped in-memory mock store used in replay mode.
///
/// `filtered` mocks are match-eligible and served in session insertion order;
/// `unfiltered` mocks are diagnostic carry-overs reachable only by exact name.
/// A single mutex serializes all access: the hot path is a linear scan over a
/// per-session set, and the consumed flag must be flipped under the same lock
/// that found the entry so each mock has at most one consumer.
#[derive(Debug, Default)]
pub struct MockMemDb {
    inner: Mutex<DbState>,
}

#[derive(Debug, Default)]
struct DbState {
    filtered: Vec<Entry>,
    unfiltered: Vec<Mock>,
}

#[derive(Debug)]
struct Entry {
    mock: Mock,
    consumed: bool,
}

impl MockMemDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current mock set atomically. Consumption state is reset.
    pub fn set_mocks(&self, filtered: Vec<Mock>, unfiltered: Vec<Mock>) {
        let mut seen = std::collections::HashSet::new();
        for mock in &filtered {
            if !seen.insert(mock.name.clone()) {
                warn!(name = %mock.name, "duplicate mock name in session; later entry shadowed for name lookup");
            }
        }
        let mut state = self.inner.lock().expect("mock db lock");
        state.filtered = filtered
            .into_iter()
            .map(|mock| Entry {
                mock,
                consumed: false,
            })
            .collect();
        state.unfiltered = unfiltered;
    }

    /// Return the first non-consumed filtered mock of `kind` whose fingerprint
    /// equals `fingerprint`, marking it consumed. FIFO within equal
    /// fingerprints; the consumed flag never reverts within a run.
    pub fn find_next(&self, kind: MockKind, fingerprint: &str) -> Option<Mock> {
        let mut state = self.inner.lock().expect("mock db lock");
        for entry in state.filtered.iter_mut() {
            if entry.consumed || entry.mock.kind != kind {
                continue;
            }
            if entry.mock.fingerprint() != fingerprint {
                continue;
            }
            entry.consumed = true;
            return Some(entry.mock.clone());
        }
        None
    }

    /// Exact-name lookup over the diagnostic carry-overs. Never consumes.
    pub fn find_by_name(&self, name: &str) -> Option<Mock> {
        let state = self.inner.lock().expect("mock db lock");
        state
            .unfiltered
            .iter()
            .find(|mock| mock.name == name)
            .cloned()
    }

    /// Names of all consumed mocks, in session insertion order.
    pub fn consumed_names(&self) -> Vec<String> {
        let state = self.inner.lock().expect("mock db lock");
        state
            .filtered
            .iter()
            .filter(|entry| entry.consumed)
            .map(|entry| entry.mock.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("mock db lock").filtered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
