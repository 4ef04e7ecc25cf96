//! External collaborators this engine fans out through: the durable
//! transaction log, the snapshot/bundle store, and the client socket. All
//! three are modeled as async traits so the engine can be driven against
//! in-memory fakes in tests and against real backends in production.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::model::Transaction;

pub type StoreError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type SocketError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The append-only, per-database transaction log. Implementations must
/// return records ordered by ascending `sequence_no` and must make
/// `put_if_absent` a genuine conditional insert: it is the only
/// cross-process coordination primitive this engine relies on for rollback
/// records racing a late-arriving real write.
#[async_trait]
pub trait TransactionStore: std::fmt::Debug + Send + Sync {
    async fn query_since(
        &self,
        database_id: &str,
        after_seq_no: u64,
        page_size: usize,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Inserts `transaction` iff no record already occupies its
    /// `(database_id, sequence_no)` slot. Returns whether the insert won.
    async fn put_if_absent(&self, transaction: Transaction) -> Result<bool, StoreError>;
}

/// The snapshot/bundle store a connection consults when opening a database
/// from a prior snapshot instead of replaying the log from the beginning.
#[async_trait]
pub trait SnapshotStore: std::fmt::Debug + Send + Sync {
    async fn get_bundle(&self, database_id: &str, bundle_seq_no: u64) -> Result<Vec<u8>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Normal,
    ClientAlreadyConnected,
}

/// The client-facing socket a connection pushes payloads over. Write errors
/// are not retried by this crate; they propagate to the caller, which owns
/// the decision to tear the connection down.
#[async_trait]
pub trait ClientSocket: std::fmt::Debug + Send + Sync {
    async fn send_json(&self, payload: &serde_json::Value) -> Result<(), SocketError>;
    async fn close(&self, status: CloseStatus);
}

/// In-memory reference [`TransactionStore`], keyed by database then sequence
/// number. Suitable for tests and for the bundled demo binary.
#[derive(Debug, Default)]
pub struct InMemoryTransactionStore {
    logs: Mutex<HashMap<String, BTreeMap<u64, Transaction>>>,
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn query_since(
        &self,
        database_id: &str,
        after_seq_no: u64,
        page_size: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        let logs = self.logs.lock();
        let page = match logs.get(database_id) {
            Some(log) => log
                .range((after_seq_no + 1)..)
                .take(page_size)
                .map(|(_, record)| record.clone())
                .collect(),
            None => Vec::new(),
        };
        Ok(page)
    }

    async fn put_if_absent(&self, transaction: Transaction) -> Result<bool, StoreError> {
        let mut logs = self.logs.lock();
        let log = logs.entry(transaction.database_id.clone()).or_default();
        match log.entry(transaction.sequence_no) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(transaction);
                Ok(true)
            }
            std::collections::btree_map::Entry::Occupied(_) => Ok(false),
        }
    }
}

/// In-memory reference [`SnapshotStore`]. Bundles must be seeded with
/// [`InMemorySnapshotStore::put_bundle`] before a connection can open from
/// them.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    bundles: Mutex<HashMap<(String, u64), Vec<u8>>>,
}

impl InMemorySnapshotStore {
    pub fn put_bundle(&self, database_id: impl Into<String>, bundle_seq_no: u64, bytes: Vec<u8>) {
        self.bundles
            .lock()
            .insert((database_id.into(), bundle_seq_no), bytes);
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get_bundle(&self, database_id: &str, bundle_seq_no: u64) -> Result<Vec<u8>, StoreError> {
        self.bundles
            .lock()
            .get(&(database_id.to_string(), bundle_seq_no))
            .cloned()
            .ok_or_else(|| format!("no bundle {bundle_seq_no} for database {database_id}").into())
    }
}

/// A [`ClientSocket`] that records every payload it is asked to send, for
/// test assertions and for the demo binary's console output.
#[derive(Debug, Default)]
pub struct RecordingSocket {
    pub sent: Mutex<Vec<serde_json::Value>>,
    pub closed_with: Mutex<Option<CloseStatus>>,
}

#[async_trait]
impl ClientSocket for RecordingSocket {
    async fn send_json(&self, payload: &serde_json::Value) -> Result<(), SocketError> {
        self.sent.lock().push(payload.clone());
        Ok(())
    }

    async fn close(&self, status: CloseStatus) {
        *self.closed_with.lock() = Some(status);
    }
}
