//! Connection records and the concurrent connection table.
//!
//! The table is the only state mutated by several tasks at once: the accept
//! loop inserts, connection supervisors remove their own entry, and `stop`
//! removes whatever is left. Removal hands the entry to exactly one caller,
//! so teardown is idempotent.
//!
//! A table can be sealed while a server reaps it. Supervisors that insert
//! after the seal see `false` from [`ConnectionTable::insert`] and clean up
//! after themselves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::proxy::spawn::{ProcessOutcome, Subprocess};

/// Opaque unique token identifying one proxied connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one active proxied connection. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionRecord {
    /// Unique id generated at accept time.
    pub connection_id: ConnectionId,
    /// Human-readable peer identity (socket address, pipe peer, ...).
    pub remote_description: String,
    /// OS process id of the shell subprocess.
    pub subprocess_id: u32,
}

/// A table entry: the public record plus what teardown needs.
pub(crate) struct ConnectionEntry {
    pub(crate) record: ConnectionRecord,
    subprocess: Option<Arc<Subprocess>>,
    cancel: CancellationToken,
}

impl ConnectionEntry {
    /// Kill the subprocess (if still alive) and release the connection's
    /// channel by cancelling its supervisor.
    pub(crate) async fn terminate(self, kill_wait: Duration) -> Option<ProcessOutcome> {
        self.cancel.cancel();
        match self.subprocess {
            Some(subprocess) => Some(subprocess.kill(kill_wait).await),
            None => None,
        }
    }
}

/// Concurrent map of live connections keyed by [`ConnectionId`].
#[derive(Default)]
pub struct ConnectionTable {
    entries: DashMap<ConnectionId, ConnectionEntry>,
    sealed: AtomicBool,
}

impl ConnectionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a live connection. Returns false if the table was sealed, in
    /// which case the caller must remove and terminate the entry itself.
    pub(crate) fn insert(
        &self,
        record: ConnectionRecord,
        subprocess: Arc<Subprocess>,
        cancel: CancellationToken,
    ) -> bool {
        self.entries.insert(
            record.connection_id.clone(),
            ConnectionEntry {
                record,
                subprocess: Some(subprocess),
                cancel,
            },
        );
        // Checked after inserting: an entry that misses the seal is
        // guaranteed to be seen by the `take_all` that follows it.
        !self.sealed.load(Ordering::SeqCst)
    }

    /// Refuse further inserts until [`ConnectionTable::unseal`].
    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn unseal(&self) {
        self.sealed.store(false, Ordering::SeqCst);
    }

    /// Returns true while the owning server is reaping the table.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn insert_record(&self, record: ConnectionRecord) {
        self.entries.insert(
            record.connection_id.clone(),
            ConnectionEntry {
                record,
                subprocess: None,
                cancel: CancellationToken::new(),
            },
        );
    }

    /// Remove an entry. Only the first caller for a given id gets `Some`.
    pub(crate) fn remove(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.entries.remove(id).map(|(_, entry)| entry)
    }

    /// Remove and return every entry currently in the table.
    pub(crate) fn take_all(&self) -> Vec<ConnectionEntry> {
        let ids: Vec<ConnectionId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no connection is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all live records.
    #[must_use]
    pub fn records(&self) -> Vec<ConnectionRecord> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }
}
