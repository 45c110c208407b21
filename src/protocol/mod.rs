//! Client-appliance communication protocol.
//!
//! This module defines the wire protocol spoken between the client and the k-NN search
//! appliance: frame layouts, command and status codes, request and response values,
//! and the session that performs round trips over a TCP stream.
//!
//! # Overview
//!
//! Every exchange is one request followed by exactly one response. There are no
//! request identifiers, so responses are matched to requests by order alone and a
//! connection never carries more than one request in flight.
//!
//! # Binary Format
//!
//! - Each message begins with a fixed-size 28 byte header ending in a CRC-32 of the
//!   header bytes before it.
//! - A non-empty body follows the header and is itself followed by a CRC-32 trailer.
//! - Bodies are either a JSON parameter object or raw little-endian vectors.
//! - All integers and floats are little-endian.
//!
//! A checksum mismatch is never repaired; it fails the round trip and poisons the
//! session.
//!
//! # Key Components
//!
//! - [`Request`] / [`Response`]: typed messages and their body encodings.
//! - [`Session`]: one socket, sequential round trips, explicit failure state.
//! - [`MockAppliance`]: a local server speaking the same protocol.
//!
//! # See Also
//!
//! - [`client`](crate::client): batched query engine built on [`Session`].
pub mod codec;
mod request;
mod response;
mod server;
mod status;
mod thread;
mod transport;

pub use request::{LoadDatasetParams, QueryFromFileParams, Request};
pub use response::Response;
pub use server::{ApplianceHandle, MockAppliance, brute_force_knn};
pub use status::{Command, Metric, Status};
pub use thread::ThreadPool;
pub use transport::{CancelHandle, Session, SessionState, Stream, Timings};
