//! Error taxonomy shared by every layer of the client.
//!
//! All variants are fatal for the call that produced them. The only anomaly that
//! is not surfaced as an error is a mini-batch row-count mismatch, which the
//! batch engine logs and moves past.
use std::io;

use thiserror::Error;

use crate::protocol::Status;

/// Part of a frame covered by a checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Header,
    Body,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to '{addr}': {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("transmission failure: {0}")]
    Transmission(#[source] io::Error),

    #[error("received 0 bytes from server, connection closed")]
    ConnectionClosed,

    #[error("{section:?} checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        section: Section,
        expected: u32,
        computed: u32,
    },

    #[error("appliance error: {status}")]
    Remote { status: Status },

    #[error("invalid argument, {0}")]
    InvalidArgument(String),

    #[error("malformed payload, {0}")]
    MalformedPayload(String),

    #[error("failed to encode JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode frame: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Error returned for round trips attempted on a session that is no longer open.
    pub(crate) fn not_connected(addr: &str) -> Self {
        ClientError::Connection {
            addr: addr.to_string(),
            source: io::Error::new(io::ErrorKind::NotConnected, "session is closed"),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
