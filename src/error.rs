use snafu::Snafu;
use uuid::Uuid;

/// Errors surfaced to the operator embedding this crate. Per-connection push
/// failures against the durable store are logged and isolated rather than
/// returned here; see [`crate::connection::Connection::push`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("client {client_id} is already connected"))]
    DuplicateClient { client_id: String },

    #[snafu(display("durable store error while serving database {database_id}: {source}"))]
    Store {
        database_id: String,
        source: crate::store::StoreError,
    },

    #[snafu(display("socket write error on connection {connection_id}: {source}"))]
    Socket {
        connection_id: Uuid,
        source: crate::store::SocketError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
