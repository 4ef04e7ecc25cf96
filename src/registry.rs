//! Process-local connection registry.
//!
//! A single owning map from `connectionId` to [`Connection`] is the only
//! place a connection is actually owned; the four index maps (`by_user`,
//! `by_admin`, `by_app`, `by_database`) store connection IDs only, so none of
//! them can hold the registry's state hostage against the others on close.
//!
//! The file-ID cache's sliding TTL is driven by a dedicated background task
//! that owns a [`DelayQueue`] and is fed through an unbounded channel; this
//! keeps `cache_file_id`/`is_file_id_cached` lock-free and non-blocking on
//! the hot broadcast path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::time::DelayQueue;
use tracing::warn;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::connection::{Connection, EngineContext, FastPathOutcome, PushMode};
use crate::error::Error;
use crate::metrics::EngineMetrics;
use crate::model::Transaction;
use crate::store::{ClientSocket, CloseStatus, SnapshotStore, TransactionStore};

#[derive(Debug, Default)]
struct IndexBucket {
    ids: HashSet<Uuid>,
}

impl IndexBucket {
    fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn remove_from_index(map: &mut HashMap<String, IndexBucket>, key: &str, connection_id: Uuid) {
    if let Some(bucket) = map.get_mut(key) {
        bucket.ids.remove(&connection_id);
        if bucket.is_empty() {
            map.remove(key);
        }
    }
}

#[derive(Debug, Default)]
struct State {
    connections: HashMap<Uuid, Arc<Connection>>,
    by_user: HashMap<String, IndexBucket>,
    by_admin: HashMap<String, IndexBucket>,
    by_app: HashMap<String, IndexBucket>,
    by_database: HashMap<String, IndexBucket>,
    user_file_ids: HashMap<String, HashSet<String>>,
    unique_clients: HashMap<String, Uuid>,
}

#[derive(Debug)]
enum EvictCommand {
    Track { user_id: String, file_id: String },
}

struct Shared {
    state: RwLock<State>,
    register_lock: AsyncMutex<()>,
    evict_tx: mpsc::UnboundedSender<EvictCommand>,
    config: Arc<EngineConfig>,
    clock: SharedClock,
    transaction_store: Arc<dyn TransactionStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    metrics: Arc<EngineMetrics>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

/// The process-local registry of every connection this node currently
/// serves: registration, per-database open bookkeeping, broadcast fan-out
/// and the cross-connection file-ID cache.
#[derive(Debug, Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    /// Spawns the file-ID eviction task onto the current Tokio runtime, so
    /// this must be called from within one (e.g. inside `#[tokio::main]` or
    /// a `#[tokio::test]`).
    pub fn new(
        config: EngineConfig,
        clock: SharedClock,
        transaction_store: Arc<dyn TransactionStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: RwLock::new(State::default()),
            register_lock: AsyncMutex::new(()),
            evict_tx,
            config: Arc::new(config),
            clock,
            transaction_store,
            snapshot_store,
            metrics,
        });

        let ttl = std::time::Duration::from_secs(shared.config.file_id_ttl_secs);
        tokio::spawn(run_eviction_task(Arc::clone(&shared), evict_rx, ttl));

        Self { shared }
    }

    fn engine_context(&self) -> EngineContext {
        EngineContext {
            transaction_store: Arc::clone(&self.shared.transaction_store),
            snapshot_store: Arc::clone(&self.shared.snapshot_store),
            clock: Arc::clone(&self.shared.clock),
            config: Arc::clone(&self.shared.config),
            metrics: Arc::clone(&self.shared.metrics),
        }
    }

    fn connection(&self, connection_id: Uuid) -> Option<Arc<Connection>> {
        self.shared.state.read().connections.get(&connection_id).cloned()
    }

    /// Registers a new connection. Rejects with [`Error::DuplicateClient`]
    /// (after asking the socket to close) when `client_id` is already
    /// registered; this is the engine's only per-client uniqueness check.
    pub async fn register(
        &self,
        user_id: impl Into<String>,
        admin_id: impl Into<String>,
        app_id: impl Into<String>,
        client_id: impl Into<String>,
        socket: Arc<dyn ClientSocket>,
    ) -> Result<Arc<Connection>, Error> {
        let user_id = user_id.into();
        let admin_id = admin_id.into();
        let app_id = app_id.into();
        let client_id = client_id.into();

        let _guard = self.shared.register_lock.lock().await;

        let duplicate = self.shared.state.read().unique_clients.contains_key(&client_id);
        if duplicate {
            socket.close(CloseStatus::ClientAlreadyConnected).await;
            return Err(Error::DuplicateClient { client_id });
        }

        let connection = Arc::new(Connection::new(
            user_id.clone(),
            admin_id.clone(),
            app_id.clone(),
            client_id.clone(),
            socket,
            &self.shared.config,
            Arc::clone(&self.shared.clock),
            Arc::clone(&self.shared.metrics),
        ));
        let connection_id = connection.id;

        {
            let mut state = self.shared.state.write();
            state.connections.insert(connection_id, Arc::clone(&connection));
            state.by_user.entry(user_id).or_default().ids.insert(connection_id);
            state.by_admin.entry(admin_id).or_default().ids.insert(connection_id);
            state.by_app.entry(app_id).or_default().ids.insert(connection_id);
            state
                .user_file_ids
                .entry(connection.user_id.clone())
                .or_default();
            state.unique_clients.insert(connection.client_id.clone(), connection_id);
        }
        self.shared
            .metrics
            .set_open_connections(self.shared.state.read().connections.len() as u64);

        Ok(connection)
    }

    pub async fn is_database_open(&self, connection_id: Uuid, database_id: &str) -> bool {
        match self.connection(connection_id) {
            Some(connection) => connection.is_database_open(database_id).await,
            None => false,
        }
    }

    /// Opens `database_id` on `connection_id` if not already open, then
    /// drives whichever push mode the caller determined (open/reopen),
    /// and finally records the connection under the database's broadcast
    /// index.
    #[allow(clippy::too_many_arguments)]
    pub async fn open_database(
        &self,
        connection_id: Uuid,
        database_id: &str,
        db_name_hash: String,
        bundle_seq_no: i64,
        is_owner: bool,
        mode: PushMode,
    ) -> Result<(), Error> {
        let Some(connection) = self.connection(connection_id) else {
            return Ok(());
        };

        let reopen_at_seq_no = match &mode {
            PushMode::Reopen { reopen_at_seq_no } => Some(*reopen_at_seq_no),
            _ => None,
        };
        if !connection.is_database_open(database_id).await {
            connection
                .open_database(database_id, db_name_hash, bundle_seq_no, reopen_at_seq_no, is_owner)
                .await;
        }

        let ctx = self.engine_context();
        connection.push(database_id, mode, &ctx).await?;

        {
            let mut state = self.shared.state.write();
            state
                .by_database
                .entry(database_id.to_string())
                .or_default()
                .ids
                .insert(connection_id);
        }
        Ok(())
    }

    /// Fans a freshly-committed transaction out to every connection
    /// watching `transaction.database_id`. Each connection takes the
    /// broadcast fast path when it applies and falls back to a full
    /// incremental push otherwise; a failure on one connection is logged
    /// and does not interrupt the others.
    pub async fn broadcast(&self, transaction: Transaction) {
        let connection_ids: Vec<Uuid> = {
            let state = self.shared.state.read();
            state
                .by_database
                .get(&transaction.database_id)
                .map(|bucket| bucket.ids.iter().copied().collect())
                .unwrap_or_default()
        };

        let ctx = self.engine_context();
        for connection_id in connection_ids {
            let Some(connection) = self.connection(connection_id) else {
                continue;
            };
            match connection.try_fast_path(&transaction, &ctx).await {
                Ok(FastPathOutcome::Sent) => {}
                Ok(FastPathOutcome::NotApplicable) => {
                    if let Err(error) = connection
                        .push(&transaction.database_id, PushMode::Incremental, &ctx)
                        .await
                    {
                        warn!(%connection_id, database_id = %transaction.database_id, %error, "incremental push failed during broadcast");
                    }
                }
                Err(error) => {
                    warn!(%connection_id, database_id = %transaction.database_id, %error, "fast-path push failed during broadcast");
                }
            }
        }
    }

    /// Tears down every index entry for `connection_id`. Database buckets
    /// are cleared before the identity buckets, matching the order a
    /// concurrent broadcast would observe them disappear in.
    pub async fn close(&self, connection_id: Uuid) {
        let Some(connection) = self.connection(connection_id) else {
            return;
        };
        let database_ids = connection.open_database_ids().await;

        let mut state = self.shared.state.write();
        for database_id in &database_ids {
            remove_from_index(&mut state.by_database, database_id, connection_id);
        }
        remove_from_index(&mut state.by_user, &connection.user_id, connection_id);
        remove_from_index(&mut state.by_admin, &connection.admin_id, connection_id);
        remove_from_index(&mut state.by_app, &connection.app_id, connection_id);
        state.unique_clients.remove(&connection.client_id);
        state.connections.remove(&connection_id);
        let open_connections = state.connections.len() as u64;
        drop(state);
        self.shared.metrics.set_open_connections(open_connections);
    }

    async fn close_bucket(&self, map: impl Fn(&State) -> Option<Vec<Uuid>>) {
        let ids = { map(&self.shared.state.read()) }.unwrap_or_default();
        for connection_id in ids {
            if let Some(connection) = self.connection(connection_id) {
                connection.socket.close(CloseStatus::Normal).await;
            }
        }
    }

    pub async fn close_users_connected_clients(&self, user_id: &str) {
        let user_id = user_id.to_string();
        self.close_bucket(|state| state.by_user.get(&user_id).map(|b| b.ids.iter().copied().collect()))
            .await;
    }

    pub async fn close_admins_connected_clients(&self, admin_id: &str) {
        let admin_id = admin_id.to_string();
        self.close_bucket(|state| state.by_admin.get(&admin_id).map(|b| b.ids.iter().copied().collect()))
            .await;
    }

    pub async fn close_apps_connected_clients(&self, app_id: &str) {
        let app_id = app_id.to_string();
        self.close_bucket(|state| state.by_app.get(&app_id).map(|b| b.ids.iter().copied().collect()))
            .await;
    }

    /// Marks `file_id` as cached for `user_id` and (re)starts its sliding
    /// TTL. Safe to call repeatedly; each call slides the deadline forward.
    pub fn cache_file_id(&self, user_id: &str, file_id: &str) {
        {
            let mut state = self.shared.state.write();
            state
                .user_file_ids
                .entry(user_id.to_string())
                .or_default()
                .insert(file_id.to_string());
        }
        let _ = self.shared.evict_tx.send(EvictCommand::Track {
            user_id: user_id.to_string(),
            file_id: file_id.to_string(),
        });
    }

    /// Returns whether `file_id` is cached for `user_id`. A hit slides the
    /// TTL forward, the same way a disk-cache access would.
    pub fn is_file_id_cached(&self, user_id: &str, file_id: &str) -> bool {
        let present = {
            let state = self.shared.state.read();
            state
                .user_file_ids
                .get(user_id)
                .map(|set| set.contains(file_id))
                .unwrap_or(false)
        };
        if present {
            let _ = self.shared.evict_tx.send(EvictCommand::Track {
                user_id: user_id.to_string(),
                file_id: file_id.to_string(),
            });
        }
        present
    }
}

async fn run_eviction_task(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<EvictCommand>,
    ttl: std::time::Duration,
) {
    let mut queue: DelayQueue<(String, String)> = DelayQueue::new();
    let mut keys: HashMap<(String, String), tokio_util::time::delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    None => break,
                    Some(EvictCommand::Track { user_id, file_id }) => {
                        let entry_key = (user_id.clone(), file_id.clone());
                        if let Some(key) = keys.get(&entry_key) {
                            queue.reset(key, ttl);
                        } else {
                            let key = queue.insert(entry_key.clone(), ttl);
                            keys.insert(entry_key, key);
                        }
                    }
                }
            }
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let (user_id, file_id) = expired.into_inner();
                keys.remove(&(user_id.clone(), file_id.clone()));
                let mut state = shared.state.write();
                if let Some(set) = state.user_file_ids.get_mut(&user_id) {
                    set.remove(&file_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::store::{InMemorySnapshotStore, InMemoryTransactionStore, RecordingSocket};
    use chrono::Utc;

    fn registry(clock: Arc<MockClock>, config: EngineConfig) -> Registry {
        Registry::new(
            config,
            clock,
            Arc::new(InMemoryTransactionStore::default()),
            Arc::new(InMemorySnapshotStore::default()),
            Arc::new(EngineMetrics::default()),
        )
    }

    #[tokio::test]
    async fn duplicate_client_id_is_rejected_and_socket_closed() {
        let clock = Arc::new(MockClock::new(Utc::now()));
        let registry = registry(clock, EngineConfig::default());
        let socket_a = Arc::new(RecordingSocket::default());
        let socket_b = Arc::new(RecordingSocket::default());

        registry
            .register("user-1", "admin-1", "app-1", "client-1", socket_a)
            .await
            .unwrap();
        let result = registry
            .register("user-1", "admin-1", "app-1", "client-1", socket_b.clone())
            .await;

        assert!(matches!(result, Err(Error::DuplicateClient { .. })));
        assert_eq!(*socket_b.closed_with.lock(), Some(CloseStatus::ClientAlreadyConnected));
    }

    #[tokio::test]
    async fn close_removes_connection_from_every_index() {
        let clock = Arc::new(MockClock::new(Utc::now()));
        let registry = registry(clock, EngineConfig::default());
        let socket = Arc::new(RecordingSocket::default());
        let connection = registry
            .register("user-1", "admin-1", "app-1", "client-1", socket)
            .await
            .unwrap();

        registry
            .open_database(
                connection.id,
                "db-1",
                "hash".into(),
                -1,
                true,
                PushMode::Open {
                    db_name_hash: "hash".into(),
                    db_key: "key".into(),
                },
            )
            .await
            .unwrap();

        registry.close(connection.id).await;

        let state = registry.shared.state.read();
        assert!(!state.connections.contains_key(&connection.id));
        assert!(!state.by_user.contains_key("user-1"));
        assert!(!state.by_database.contains_key("db-1"));
        assert!(!state.unique_clients.contains_key("client-1"));
    }

    #[tokio::test]
    async fn broadcast_fast_path_delivers_in_order_records() {
        let clock = Arc::new(MockClock::new(Utc::now()));
        let registry = registry(clock.clone(), EngineConfig::default());
        let socket = Arc::new(RecordingSocket::default());
        let connection = registry
            .register("user-1", "admin-1", "app-1", "client-1", socket.clone())
            .await
            .unwrap();
        registry
            .open_database(
                connection.id,
                "db-1",
                "hash".into(),
                -1,
                true,
                PushMode::Open {
                    db_name_hash: "hash".into(),
                    db_key: "key".into(),
                },
            )
            .await
            .unwrap();
        socket.sent.lock().clear();

        registry
            .broadcast(Transaction {
                database_id: "db-1".into(),
                sequence_no: 1,
                command: "Insert".into(),
                creation_date: clock.now(),
                key: None,
                record: Some(serde_json::json!({"v": 1})),
                file_metadata: None,
                file_id: None,
                file_encryption_key: None,
                operations: None,
            })
            .await;

        let sent = socket.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["transactionLog"][0]["seqNo"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn file_id_cache_evicts_after_ttl_and_hits_slide_it() {
        let clock = Arc::new(MockClock::new(Utc::now()));
        let mut config = EngineConfig::default();
        config.file_id_ttl_secs = 2;
        let registry = registry(clock, config);

        registry.cache_file_id("user-1", "file-1");
        assert!(registry.is_file_id_cached("user-1", "file-1"));

        tokio::time::advance(std::time::Duration::from_millis(1500)).await;
        tokio::task::yield_now().await;
        assert!(registry.is_file_id_cached("user-1", "file-1"));

        tokio::time::advance(std::time::Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(!registry.is_file_id_cached("user-1", "file-1"));
    }
}
