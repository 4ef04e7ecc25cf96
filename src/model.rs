//! Wire and durable-record types for the fan-out engine.
//!
//! [`Transaction`] mirrors a row of the durable transaction log exactly as
//! this crate needs it; [`WireTransaction`] and [`ApplyTransactionsPayload`]
//! are what actually goes out over a client socket.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Sentinel command value used for synthetic rollback records. Any other
/// string is an application-defined command opaque to this crate.
pub const ROLLBACK_COMMAND: &str = "Rollback";

/// A single row of the durable transaction log, as returned by
/// [`crate::store::TransactionStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub database_id: String,
    pub sequence_no: u64,
    pub command: String,
    pub creation_date: DateTime<Utc>,
    pub key: Option<String>,
    pub record: Option<serde_json::Value>,
    pub file_metadata: Option<serde_json::Value>,
    pub file_id: Option<String>,
    pub file_encryption_key: Option<String>,
    pub operations: Option<serde_json::Value>,
}

impl Transaction {
    pub fn is_rollback(&self) -> bool {
        self.command == ROLLBACK_COMMAND
    }
}

/// Rough estimate of the durable record's serialized byte size, used to
/// decide when the per-database transaction log has grown large enough to
/// warrant a fresh bundle.
pub fn estimate_size(record: &Transaction) -> u64 {
    let mut size = record.database_id.len() + record.command.len() + 16;
    if let Some(key) = &record.key {
        size += key.len();
    }
    if let Some(value) = &record.record {
        size += value.to_string().len();
    }
    if let Some(value) = &record.file_metadata {
        size += value.to_string().len();
    }
    if let Some(file_id) = &record.file_id {
        size += file_id.len();
    }
    if let Some(key) = &record.file_encryption_key {
        size += key.len();
    }
    if let Some(value) = &record.operations {
        size += value.to_string().len();
    }
    size as u64
}

/// A single log entry as it appears in the `transactionLog` array of an
/// `ApplyTransactions` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTransaction {
    pub seq_no: u64,
    pub command: String,
    pub db_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_encryption_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<serde_json::Value>,
}

pub fn to_wire(record: &Transaction, database_id: &str) -> WireTransaction {
    WireTransaction {
        seq_no: record.sequence_no,
        command: record.command.clone(),
        db_id: database_id.to_string(),
        key: record.key.clone(),
        record: record.record.clone(),
        file_metadata: record.file_metadata.clone(),
        file_id: record.file_id.clone(),
        file_encryption_key: record.file_encryption_key.clone(),
        operations: record.operations.clone(),
    }
}

/// The `ApplyTransactions` payload sent to a subscribed socket. `bundle` is
/// the base64 encoding of the snapshot bytes returned by
/// [`crate::store::SnapshotStore::get_bundle`]; `build_bundle` instructs the
/// client to assemble and upload a fresh bundle once it has applied this
/// batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyTransactionsPayload {
    pub route: &'static str,
    pub db_id: String,
    pub db_name_hash: String,
    pub is_owner: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_seq_no: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<String>,
    pub transaction_log: Vec<WireTransaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_bundle: Option<bool>,
}

#[allow(clippy::too_many_arguments)]
pub fn build_envelope(
    database_id: &str,
    db_name_hash: &str,
    is_owner: bool,
    db_key: Option<String>,
    bundle_seq_no: Option<i64>,
    bundle: Option<Vec<u8>>,
    transaction_log: Vec<WireTransaction>,
    build_bundle: Option<bool>,
) -> ApplyTransactionsPayload {
    ApplyTransactionsPayload {
        route: "ApplyTransactions",
        db_id: database_id.to_string(),
        db_name_hash: db_name_hash.to_string(),
        is_owner,
        db_key,
        bundle_seq_no,
        bundle: bundle.map(base64::encode),
        transaction_log,
        build_bundle,
    }
}

/// Per-connection, per-database bookkeeping. Lives behind the connection's
/// push mutex; never shared or mutated except while that mutex is held.
#[derive(Debug, Clone)]
pub struct OpenDatabaseState {
    /// `-1` when the connection did not open from a snapshot bundle.
    pub bundle_seq_no: i64,
    pub last_seq_no: u64,
    pub transaction_log_size: u64,
    /// Becomes `true` once the client has received the name hash and key,
    /// either from a reopen or from the first successful push.
    pub init: bool,
    pub db_name_hash: String,
    pub is_owner: bool,
}
