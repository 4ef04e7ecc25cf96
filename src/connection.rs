//! A single registered socket connection and the push pipeline that keeps
//! every database it has open in lockstep with the durable transaction log.
//!
//! Every operation that can observe or mutate a connection's per-database
//! state (`open_database`, `push`, the broadcast fast path) takes the same
//! `tokio::sync::Mutex` for its full duration. The original cooperative,
//! single-threaded design relied on never yielding mid-update; running on a
//! real multi-task executor, the mutex is what reproduces that guarantee.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::error::Error;
use crate::metrics::EngineMetrics;
use crate::model::{build_envelope, estimate_size, to_wire, OpenDatabaseState, Transaction, ROLLBACK_COMMAND};
use crate::store::{ClientSocket, SnapshotStore, TransactionStore};
use crate::token_bucket::TokenBucket;

/// Shared handles a connection needs to talk to the outside world while
/// pushing. Cloning is cheap; every field is an `Arc`.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub transaction_store: Arc<dyn TransactionStore>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    pub clock: SharedClock,
    pub config: Arc<EngineConfig>,
    pub metrics: Arc<EngineMetrics>,
}

/// How a push was triggered, which determines which guard applies and
/// whether an empty result still sends an (empty) payload.
#[derive(Debug, Clone)]
pub enum PushMode {
    /// First open of a database on this connection; carries the name hash
    /// and decryption key the client needs to interpret what follows.
    Open { db_name_hash: String, db_key: String },
    /// A reconnect that already has the name hash and key cached locally.
    Reopen { reopen_at_seq_no: u64 },
    /// A broadcast-triggered or caught-up incremental push.
    Incremental,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FastPathOutcome {
    Sent,
    NotApplicable,
}

#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub user_id: String,
    pub admin_id: String,
    pub app_id: String,
    pub client_id: String,
    pub key_validated: AtomicBool,
    databases: AsyncMutex<HashMap<String, OpenDatabaseState>>,
    request_bucket: TokenBucket,
    file_bucket: TokenBucket,
    metrics: Arc<EngineMetrics>,
    pub socket: Arc<dyn ClientSocket>,
}

impl Connection {
    pub fn new(
        user_id: String,
        admin_id: String,
        app_id: String,
        client_id: String,
        socket: Arc<dyn ClientSocket>,
        config: &EngineConfig,
        clock: SharedClock,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            admin_id,
            app_id,
            client_id,
            key_validated: AtomicBool::new(false),
            databases: AsyncMutex::new(HashMap::new()),
            request_bucket: TokenBucket::new(config.request_bucket_capacity, config.request_bucket_refill, Arc::clone(&clock)),
            file_bucket: TokenBucket::new(config.file_bucket_capacity, config.file_bucket_refill, clock),
            metrics,
            socket,
        }
    }

    /// Denials are rate-limit errors the caller must surface to the client;
    /// this crate only tracks that they happened.
    pub fn try_acquire_request(&self) -> bool {
        let permitted = self.request_bucket.try_acquire();
        if !permitted {
            self.metrics.record_rate_limited("request");
        }
        permitted
    }

    pub fn try_acquire_file_storage(&self) -> bool {
        let permitted = self.file_bucket.try_acquire();
        if !permitted {
            self.metrics.record_rate_limited("file_storage");
        }
        permitted
    }

    pub fn mark_key_validated(&self) {
        self.key_validated.store(true, Ordering::SeqCst);
    }

    pub fn is_key_validated(&self) -> bool {
        self.key_validated.load(Ordering::SeqCst)
    }

    pub async fn is_database_open(&self, database_id: &str) -> bool {
        self.databases.lock().await.contains_key(database_id)
    }

    pub async fn open_database_ids(&self) -> Vec<String> {
        self.databases.lock().await.keys().cloned().collect()
    }

    /// Idempotent: a database already open on this connection is left
    /// untouched.
    pub async fn open_database(
        &self,
        database_id: &str,
        db_name_hash: String,
        bundle_seq_no: i64,
        reopen_at_seq_no: Option<u64>,
        is_owner: bool,
    ) {
        let mut databases = self.databases.lock().await;
        if databases.contains_key(database_id) {
            return;
        }
        databases.insert(
            database_id.to_string(),
            OpenDatabaseState {
                bundle_seq_no: if bundle_seq_no > 0 { bundle_seq_no } else { -1 },
                last_seq_no: reopen_at_seq_no.unwrap_or(0),
                transaction_log_size: 0,
                init: reopen_at_seq_no.is_some(),
                db_name_hash,
                is_owner,
            },
        );
    }

    /// Catches this connection's view of `database_id` up with the durable
    /// log, in the mode described by `mode`. A failed guard (wrong mode for
    /// the database's current state) is a silent no-op; it indicates a
    /// stale or duplicate client request, not an engine fault.
    pub async fn push(&self, database_id: &str, mode: PushMode, ctx: &EngineContext) -> Result<(), Error> {
        let mut databases = self.databases.lock().await;
        let Some(database) = databases.get_mut(database_id) else {
            return Ok(());
        };

        match &mode {
            PushMode::Open { .. } if database.last_seq_no != 0 => {
                warn!(connection_id = %self.id, database_id, "open push requested but connection has already advanced past seq 0");
                return Ok(());
            }
            PushMode::Reopen { reopen_at_seq_no } if database.last_seq_no != *reopen_at_seq_no => {
                warn!(connection_id = %self.id, database_id, "reopen push seq mismatch, ignoring");
                return Ok(());
            }
            PushMode::Incremental if !database.init => {
                warn!(connection_id = %self.id, database_id, "incremental push requested before first init, ignoring");
                return Ok(());
            }
            _ => {}
        }

        let (db_name_hash, db_key) = match &mode {
            PushMode::Open { db_name_hash, db_key } => (db_name_hash.clone(), Some(db_key.clone())),
            _ => (database.db_name_hash.clone(), None),
        };

        let mut bundle_seq_no_out = None;
        let mut bundle_bytes = None;
        let mut seq_cursor = database.last_seq_no as i64;

        if database.bundle_seq_no > 0 && database.last_seq_no == 0 {
            let bundle = ctx
                .snapshot_store
                .get_bundle(database_id, database.bundle_seq_no as u64)
                .await
                .map_err(|source| Error::Store {
                    database_id: database_id.to_string(),
                    source,
                })?;
            bundle_seq_no_out = Some(database.bundle_seq_no);
            bundle_bytes = Some(bundle);
            seq_cursor = database.bundle_seq_no;
        }

        let mut outbound: Vec<Transaction> = Vec::new();
        let mut halted = false;
        loop {
            let page = ctx
                .transaction_store
                .query_since(database_id, seq_cursor.max(0) as u64, ctx.config.query_page_size)
                .await
                .map_err(|source| Error::Store {
                    database_id: database_id.to_string(),
                    source,
                })?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();

            for record in page {
                if record.sequence_no as i64 > seq_cursor + 1 {
                    let age = ctx.clock.now() - record.creation_date;
                    if age > chrono::Duration::seconds(ctx.config.gap_threshold_secs) {
                        let rolled_back = self
                            .rollback(seq_cursor as u64, record.sequence_no, database_id, ctx)
                            .await?;
                        for rolled in rolled_back {
                            if rolled.sequence_no > database.last_seq_no {
                                outbound.push(rolled);
                            }
                        }
                        if record.sequence_no > database.last_seq_no {
                            outbound.push(record.clone());
                        }
                        seq_cursor = record.sequence_no as i64;
                    } else {
                        halted = true;
                        break;
                    }
                } else {
                    if record.sequence_no > database.last_seq_no {
                        outbound.push(record.clone());
                    }
                    seq_cursor = record.sequence_no as i64;
                }
            }

            if halted || page_len < ctx.config.query_page_size {
                break;
            }
        }

        if halted {
            // An unresolved gap younger than the rollback threshold: the
            // client must not be told it is caught up, so nothing is sent
            // and no state is advanced. A later push will retry.
            return Ok(());
        }

        let is_open_or_reopen = !matches!(mode, PushMode::Incremental);

        if outbound.is_empty() {
            if is_open_or_reopen {
                let payload = build_envelope(
                    database_id,
                    &db_name_hash,
                    database.is_owner,
                    db_key,
                    bundle_seq_no_out,
                    bundle_bytes,
                    Vec::new(),
                    None,
                );
                self.socket
                    .send_json(&serde_json::to_value(&payload).expect("payload is always valid json"))
                    .await
                    .map_err(|source| Error::Socket {
                        connection_id: self.id,
                        source,
                    })?;
                database.init = true;
                database.db_name_hash = db_name_hash;
                if let Some(bundle_seq_no) = bundle_seq_no_out {
                    database.last_seq_no = bundle_seq_no as u64;
                }
            }
            return Ok(());
        }

        let payload = build_envelope(
            database_id,
            &db_name_hash,
            database.is_owner,
            db_key,
            bundle_seq_no_out,
            bundle_bytes,
            Vec::new(),
            None,
        );
        self.send_payload(payload, outbound, database, database_id, ctx).await?;
        database.db_name_hash = db_name_hash;
        Ok(())
    }

    /// The broadcast hot path: if this connection's view of `database_id`
    /// is exactly one behind `transaction`, send it directly instead of
    /// falling back to a full incremental [`push`](Self::push).
    pub async fn try_fast_path(
        &self,
        transaction: &Transaction,
        ctx: &EngineContext,
    ) -> Result<FastPathOutcome, Error> {
        let mut databases = self.databases.lock().await;
        let Some(database) = databases.get_mut(&transaction.database_id) else {
            return Ok(FastPathOutcome::NotApplicable);
        };
        if transaction.sequence_no != database.last_seq_no + 1 {
            return Ok(FastPathOutcome::NotApplicable);
        }

        let payload = build_envelope(
            &transaction.database_id,
            &database.db_name_hash,
            database.is_owner,
            None,
            None,
            None,
            Vec::new(),
            None,
        );
        self.send_payload(
            payload,
            vec![transaction.clone()],
            database,
            &transaction.database_id,
            ctx,
        )
        .await?;
        Ok(FastPathOutcome::Sent)
    }

    /// Synthesizes `Rollback` records for every sequence number strictly
    /// between `last_seq_no` and `this_seq_no`, via a conditional insert.
    /// Losing the race to a late-arriving real record for that slot is the
    /// expected, common case and is not an error.
    async fn rollback(
        &self,
        last_seq_no: u64,
        this_seq_no: u64,
        database_id: &str,
        ctx: &EngineContext,
    ) -> Result<Vec<Transaction>, Error> {
        let mut inserted = Vec::new();
        for seq_no in (last_seq_no + 1)..this_seq_no {
            let candidate = Transaction {
                database_id: database_id.to_string(),
                sequence_no: seq_no,
                command: ROLLBACK_COMMAND.to_string(),
                creation_date: ctx.clock.now(),
                key: None,
                record: None,
                file_metadata: None,
                file_id: None,
                file_encryption_key: None,
                operations: None,
            };
            match ctx.transaction_store.put_if_absent(candidate.clone()).await {
                Ok(true) => {
                    ctx.metrics.record_rollback(database_id, 1);
                    inserted.push(candidate);
                }
                Ok(false) => {
                    // a real write landed in this slot first; nothing to roll back
                }
                Err(source) => {
                    return Err(Error::Store {
                        database_id: database_id.to_string(),
                        source,
                    })
                }
            }
        }
        Ok(inserted)
    }

    async fn send_payload(
        &self,
        mut payload: crate::model::ApplyTransactionsPayload,
        records: Vec<Transaction>,
        database: &mut OpenDatabaseState,
        database_id: &str,
        ctx: &EngineContext,
    ) -> Result<(), Error> {
        let filtered: Vec<&Transaction> = records
            .iter()
            .filter(|record| record.sequence_no > database.last_seq_no)
            .collect();
        if filtered.is_empty() {
            return Ok(());
        }

        let first_seq = filtered[0].sequence_no;
        let contiguous =
            first_seq == database.last_seq_no + 1 || first_seq as i64 == database.bundle_seq_no + 1;
        if !contiguous {
            warn!(
                connection_id = %self.id,
                database_id,
                first_seq,
                last_seq_no = database.last_seq_no,
                "dropping non-contiguous push batch",
            );
            return Ok(());
        }

        let batch_size: u64 = filtered.iter().map(|record| estimate_size(record)).sum();
        if database.transaction_log_size + batch_size >= ctx.config.snapshot_bytes_threshold {
            payload.build_bundle = Some(true);
            database.transaction_log_size = 0;
            ctx.metrics.record_bundle_trigger(database_id);
        } else {
            database.transaction_log_size += batch_size;
        }

        payload.transaction_log = filtered.iter().map(|record| to_wire(record, database_id)).collect();

        self.socket
            .send_json(&serde_json::to_value(&payload).expect("payload is always valid json"))
            .await
            .map_err(|source| Error::Socket {
                connection_id: self.id,
                source,
            })?;

        database.last_seq_no = filtered.last().expect("checked non-empty above").sequence_no;
        database.init = true;
        ctx.metrics.record_push(database_id, filtered.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::store::{InMemorySnapshotStore, InMemoryTransactionStore, RecordingSocket};
    use chrono::Utc;
    use std::sync::Arc;

    fn ctx_with(clock: Arc<MockClock>, config: EngineConfig) -> (EngineContext, Arc<InMemoryTransactionStore>) {
        let store = Arc::new(InMemoryTransactionStore::default());
        let ctx = EngineContext {
            transaction_store: store.clone(),
            snapshot_store: Arc::new(InMemorySnapshotStore::default()),
            clock,
            config: Arc::new(config),
            metrics: Arc::new(EngineMetrics::default()),
        };
        (ctx, store)
    }

    fn tx(database_id: &str, seq_no: u64, created: chrono::DateTime<Utc>) -> Transaction {
        Transaction {
            database_id: database_id.to_string(),
            sequence_no: seq_no,
            command: "Insert".to_string(),
            creation_date: created,
            key: None,
            record: Some(serde_json::json!({"v": seq_no})),
            file_metadata: None,
            file_id: None,
            file_encryption_key: None,
            operations: None,
        }
    }

    fn connection(clock: SharedClock, config: &EngineConfig, socket: Arc<RecordingSocket>) -> Connection {
        Connection::new(
            "user-1".into(),
            "admin-1".into(),
            "app-1".into(),
            "client-1".into(),
            socket,
            config,
            clock,
            Arc::new(EngineMetrics::default()),
        )
    }

    #[tokio::test]
    async fn request_bucket_denies_once_drained() {
        let clock: Arc<MockClock> = Arc::new(MockClock::new(Utc::now()));
        let mut config = EngineConfig::default();
        config.request_bucket_capacity = 2;
        config.request_bucket_refill = 1;
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(clock, &config, socket);

        assert!(connection.try_acquire_request());
        assert!(connection.try_acquire_request());
        assert!(!connection.try_acquire_request());
    }

    #[tokio::test]
    async fn fresh_open_with_empty_log_sends_empty_payload() {
        let clock: Arc<MockClock> = Arc::new(MockClock::new(Utc::now()));
        let config = EngineConfig::default();
        let (ctx, _store) = ctx_with(clock.clone(), config.clone());
        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(clock, &config, socket.clone());

        connection
            .open_database("db-1", "hash".into(), -1, None, true)
            .await;
        connection
            .push(
                "db-1",
                PushMode::Open {
                    db_name_hash: "hash".into(),
                    db_key: "key".into(),
                },
                &ctx,
            )
            .await
            .unwrap();

        let sent = socket.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["transactionLog"].as_array().unwrap().len(), 0);
        assert_eq!(sent[0]["dbKey"], "key");
    }

    #[tokio::test]
    async fn fresh_open_with_snapshot_and_log_sends_bundle_and_remaining_records() {
        let clock: Arc<MockClock> = Arc::new(MockClock::new(Utc::now()));
        let config = EngineConfig::default();
        let (ctx, store) = ctx_with(clock.clone(), config.clone());
        let snapshot_store = InMemorySnapshotStore::default();
        snapshot_store.put_bundle("db-1", 5, b"snapshot-bytes".to_vec());
        let ctx = EngineContext {
            snapshot_store: Arc::new(snapshot_store),
            ..ctx
        };
        for seq in 6..=8u64 {
            store.put_if_absent(tx("db-1", seq, clock.now())).await.unwrap();
        }

        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(clock.clone(), &config, socket.clone());
        connection
            .open_database("db-1", "hash".into(), 5, None, true)
            .await;
        connection
            .push(
                "db-1",
                PushMode::Open {
                    db_name_hash: "hash".into(),
                    db_key: "key".into(),
                },
                &ctx,
            )
            .await
            .unwrap();

        let sent = socket.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0]["bundle"].is_string());
        assert_eq!(sent[0]["transactionLog"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn gap_within_threshold_halts_without_sending() {
        let clock: Arc<MockClock> = Arc::new(MockClock::new(Utc::now()));
        let config = EngineConfig::default();
        let (ctx, store) = ctx_with(clock.clone(), config.clone());
        store.put_if_absent(tx("db-1", 12, clock.now())).await.unwrap();

        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(clock, &config, socket.clone());
        connection
            .open_database("db-1", "hash".into(), -1, Some(10), true)
            .await;
        connection
            .push("db-1", PushMode::Reopen { reopen_at_seq_no: 10 }, &ctx)
            .await
            .unwrap();

        assert!(socket.sent.lock().is_empty());
        assert!(store.query_since("db-1", 10, 10).await.unwrap()[0].sequence_no == 12);
    }

    #[tokio::test]
    async fn gap_past_threshold_rolls_back_then_delivers() {
        let clock: Arc<MockClock> = Arc::new(MockClock::new(Utc::now()));
        let config = EngineConfig::default();
        let (ctx, store) = ctx_with(clock.clone(), config.clone());
        let created_at = clock.now();
        store.put_if_absent(tx("db-1", 12, created_at)).await.unwrap();
        clock.advance(chrono::Duration::seconds(11));

        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(clock, &config, socket.clone());
        connection
            .open_database("db-1", "hash".into(), -1, Some(9), true)
            .await;
        connection
            .push("db-1", PushMode::Reopen { reopen_at_seq_no: 9 }, &ctx)
            .await
            .unwrap();

        let sent = socket.sent.lock();
        assert_eq!(sent.len(), 1);
        let log = sent[0]["transactionLog"].as_array().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0]["seqNo"], 10);
        assert_eq!(log[0]["command"], "Rollback");
        assert_eq!(log[1]["seqNo"], 11);
        assert_eq!(log[1]["command"], "Rollback");
        assert_eq!(log[2]["seqNo"], 12);
    }

    #[tokio::test]
    async fn large_batch_triggers_bundle_build_and_resets_log_size() {
        let clock: Arc<MockClock> = Arc::new(MockClock::new(Utc::now()));
        let mut config = EngineConfig::default();
        config.snapshot_bytes_threshold = 10;
        let (ctx, store) = ctx_with(clock.clone(), config.clone());
        let mut big = tx("db-1", 1, clock.now());
        big.record = Some(serde_json::json!({"payload": "x".repeat(100)}));
        store.put_if_absent(big).await.unwrap();

        let socket = Arc::new(RecordingSocket::default());
        let connection = connection(clock, &config, socket.clone());
        connection
            .open_database("db-1", "hash".into(), -1, None, true)
            .await;
        connection
            .push(
                "db-1",
                PushMode::Open {
                    db_name_hash: "hash".into(),
                    db_key: "key".into(),
                },
                &ctx,
            )
            .await
            .unwrap();

        let sent = socket.sent.lock();
        assert_eq!(sent[0]["buildBundle"], true);
    }
}
