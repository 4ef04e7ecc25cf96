//! Runnable walkthrough of the fan-out engine against in-memory stores:
//! opens a database from a snapshot bundle, then broadcasts a couple of
//! committed transactions to watch the broadcast fast path fire.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use txfanout::clock::SystemClock;
use txfanout::connection::PushMode;
use txfanout::metrics::EngineMetrics;
use txfanout::model::Transaction;
use txfanout::store::{InMemorySnapshotStore, InMemoryTransactionStore, RecordingSocket};
use txfanout::{EngineConfig, Registry};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::parse();

    let transaction_store = Arc::new(InMemoryTransactionStore::default());
    let snapshot_store = Arc::new(InMemorySnapshotStore::default());
    snapshot_store.put_bundle("demo-db", 3, b"pretend-this-is-an-encrypted-snapshot".to_vec());

    transaction_store
        .put_if_absent(Transaction {
            database_id: "demo-db".into(),
            sequence_no: 4,
            command: "Insert".into(),
            creation_date: chrono::Utc::now(),
            key: Some("todos/1".into()),
            record: Some(serde_json::json!({"title": "buy milk"})),
            file_metadata: None,
            file_id: None,
            file_encryption_key: None,
            operations: None,
        })
        .await
        .unwrap();

    let registry = Registry::new(
        config,
        Arc::new(SystemClock),
        transaction_store.clone(),
        snapshot_store,
        Arc::new(EngineMetrics::default()),
    );

    let socket = Arc::new(RecordingSocket::default());
    let connection = registry
        .register("user-1", "admin-1", "app-1", "client-1", socket.clone())
        .await
        .expect("first registration never collides");
    info!(connection_id = %connection.id, "registered demo connection");

    registry
        .open_database(
            connection.id,
            "demo-db",
            "demo-db-hash".into(),
            3,
            true,
            PushMode::Open {
                db_name_hash: "demo-db-hash".into(),
                db_key: "demo-db-key".into(),
            },
        )
        .await
        .expect("open push against in-memory stores never fails");

    for payload in socket.sent.lock().iter() {
        println!("open push  -> {payload}");
    }
    socket.sent.lock().clear();

    registry
        .broadcast(Transaction {
            database_id: "demo-db".into(),
            sequence_no: 5,
            command: "Insert".into(),
            creation_date: chrono::Utc::now(),
            key: Some("todos/2".into()),
            record: Some(serde_json::json!({"title": "walk the dog"})),
            file_metadata: None,
            file_id: None,
            file_encryption_key: None,
            operations: None,
        })
        .await;

    for payload in socket.sent.lock().iter() {
        println!("broadcast  -> {payload}");
    }

    registry.close(connection.id).await;
}
