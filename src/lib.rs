#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::future_not_send
)]

//! A real-time transaction-log fan-out engine.
//!
//! Clients open one or more logical databases over a long-lived socket
//! connection. For each open database this crate keeps exactly one thing
//! true: the client's view of the transaction log never skips a sequence
//! number and never goes backwards.
//!
//! ```text
//!              ┌──────────────┐   register()    ┌────────────┐
//!   client  -->│ ClientSocket │---------------->│  Registry  │
//!              └──────────────┘                 └─────┬──────┘
//!                     ^                                │ owns
//!                     │ send_json()/close()             v
//!              ┌──────┴───────┐   push()/broadcast()  ┌────────────┐
//!              │  Connection  │<-----------------------│ Connection │ ...
//!              └──────┬───────┘                        └────────────┘
//!                     │ query_since()/put_if_absent()/get_bundle()
//!                     v
//!       ┌───────────────────────────┐    ┌─────────────────┐
//!       │     TransactionStore      │    │  SnapshotStore   │
//!       └───────────────────────────┘    └─────────────────┘
//! ```
//!
//! [`Registry`] is the process-local entry point: it registers connections,
//! opens databases on them, and fans committed transactions out via
//! [`Registry::broadcast`]. Everything that talks to durable storage or to
//! the client socket is behind the [`store`] module's async traits, so the
//! engine itself can be exercised against in-memory fakes.

pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod store;
pub mod token_bucket;

pub use clock::{Clock, MockClock, SharedClock, SystemClock};
pub use config::EngineConfig;
pub use connection::{Connection, EngineContext, FastPathOutcome, PushMode};
pub use error::{Error, Result};
pub use metrics::EngineMetrics;
pub use model::{ApplyTransactionsPayload, OpenDatabaseState, Transaction, WireTransaction};
pub use registry::Registry;
pub use store::{ClientSocket, CloseStatus, SnapshotStore, TransactionStore};
