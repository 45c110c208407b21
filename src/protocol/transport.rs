//! One connection to the appliance and its request/response round trip.
//!
//! The protocol has no request identifiers, so a response is matched to its request
//! purely by order. A [`Session`] therefore performs strictly sequential round trips
//! and is never shared between threads; concurrency means more sessions.
//!
//! Any failure during a round trip moves the session to [`SessionState::Failed`] and
//! tears the socket down. After a checksum failure or a non-success status the
//! channel state is not trusted, so a failed session is never reused: every later
//! round trip fails with [`ClientError::Connection`] without touching the network.
use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Instant,
};

use log::{debug, info, trace, warn};

use crate::error::{ClientError, Result};

use super::{
    Command, Request, Response,
    codec::{self, API_KEY_SIZE, CHECKSUM_SIZE, RESPONSE_HEADER_SIZE},
};

const READ_CHUNK: usize = 64 * 1024;

/// Bidirectional byte stream a session can own.
pub trait Stream: Read + Write {
    /// Shut the connection down in both directions.
    fn shutdown(&self) -> io::Result<()>;
}

impl Stream for TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// A round trip failed; the socket has been released. Terminal.
    Failed,
    /// Closed by the caller. Terminal.
    Closed,
}

/// Server-side and client-side elapsed time of an operation, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timings {
    pub server_elapsed: f64,
    pub client_elapsed: f64,
}

impl Timings {
    pub fn new(server_elapsed: f64, client_elapsed: f64) -> Self {
        Self {
            server_elapsed,
            client_elapsed,
        }
    }

    /// Time spent outside the appliance, mostly network transfer.
    pub fn overhead(&self) -> f64 {
        self.client_elapsed - self.server_elapsed
    }
}

impl fmt::Display for Timings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (scale, unit, precision) = if self.server_elapsed < 1.0 {
            (1000.0, "ms", 0)
        } else if self.server_elapsed < 120.0 {
            (1.0, "sec", 1)
        } else {
            (1.0 / 60.0, "min", 1)
        };

        writeln!(f, "Timing breakdown:")?;
        writeln!(
            f,
            "  Server Time: {:.*} {unit}",
            precision,
            self.server_elapsed * scale
        )?;
        writeln!(f, "     Overhead: {:.*} {unit}", precision, self.overhead() * scale)?;
        write!(
            f,
            "        Total: {:.*} {unit}",
            precision,
            self.client_elapsed * scale
        )
    }
}

pub struct Session<T: Stream> {
    stream: Option<T>,
    peer: String,
    api_key: [u8; API_KEY_SIZE],
    state: SessionState,
    timings: Timings,
}

impl Session<TcpStream> {
    /// Resolve `host`, connect to the first address that accepts, and keep the
    /// normalized API key for every request built by this session.
    pub fn open(host: &str, port: u16, api_key: &str) -> Result<Self> {
        let peer = format!("{host}:{port}");
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|source| ClientError::Connection {
                addr: peer.clone(),
                source,
            })?;

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    info!("connected to {peer} ({addr})");
                    return Ok(Self::with_peer(stream, peer, api_key));
                }
                Err(e) => {
                    debug!("connect to {addr} failed: {e}");
                    last_err = e;
                }
            }
        }

        Err(ClientError::Connection {
            addr: peer,
            source: last_err,
        })
    }

    /// Handle that can abort a blocked round trip from another thread.
    pub fn cancel_handle(&self) -> Result<CancelHandle> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| ClientError::not_connected(&self.peer))?;
        Ok(CancelHandle {
            stream: stream.try_clone()?,
        })
    }
}

impl<T: Stream> Session<T> {
    /// Wrap an already connected stream.
    pub fn from_stream(stream: T, api_key: &str) -> Self {
        Self::with_peer(stream, "stream".to_string(), api_key)
    }

    fn with_peer(stream: T, peer: String, api_key: &str) -> Self {
        Self {
            stream: Some(stream),
            peer,
            api_key: codec::normalize_api_key(api_key),
            state: SessionState::Open,
            timings: Timings::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Timings of the most recent successful round trip.
    pub fn timings(&self) -> Timings {
        self.timings
    }

    /// Request carrying this session's API key and an empty body.
    pub fn request(&self, command: Command, k: u32) -> Request {
        Request {
            command,
            k,
            api_key: self.api_key,
            body: Vec::new(),
        }
    }

    /// Send `request` and wait for its complete response.
    pub fn round_trip(&mut self, request: &Request) -> Result<Response> {
        if self.state != SessionState::Open {
            return Err(ClientError::not_connected(&self.peer));
        }

        let started = Instant::now();
        match self.exchange(request) {
            Ok(response) => {
                self.timings = Timings::new(
                    f64::from(response.elapsed),
                    started.elapsed().as_secs_f64(),
                );
                debug!(
                    "{:?} round trip to {}: {} body bytes out, {} in, {:.3}s on server",
                    request.command,
                    self.peer,
                    request.body_length(),
                    response.body_length(),
                    response.elapsed
                );
                Ok(response)
            }
            Err(e) => {
                warn!("{:?} round trip to {} failed: {e}", request.command, self.peer);
                self.fail();
                Err(e)
            }
        }
    }

    fn exchange(&mut self, request: &Request) -> Result<Response> {
        let packet = request.pack()?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ClientError::not_connected(&self.peer))?;

        trace!("sending {} bytes", packet.len());
        stream
            .write_all(&packet)
            .and_then(|_| stream.flush())
            .map_err(ClientError::Transmission)?;

        // Blocks until the appliance has processed the request.
        let header = recv_exact(stream, RESPONSE_HEADER_SIZE)?;
        let (mut response, body_length) = Response::unpack_header(&header)?;

        if !response.status.is_success() {
            return Err(ClientError::Remote {
                status: response.status,
            });
        }

        if body_length > 0 {
            let body_length = usize::try_from(body_length).map_err(|_| {
                ClientError::MalformedPayload(format!(
                    "body length {body_length} exceeds addressable memory"
                ))
            })?;
            let body = recv_exact(stream, body_length)?;
            let trailer = recv_exact(stream, CHECKSUM_SIZE)?;
            codec::verify_body(&body, &trailer)?;
            response.body = body;
        }

        Ok(response)
    }

    fn fail(&mut self) {
        self.release();
        if self.state == SessionState::Open {
            self.state = SessionState::Failed;
        }
    }

    fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown() {
                trace!("shutdown of {} reported: {e}", self.peer);
            }
        }
    }

    /// Release the socket. Safe to call any number of times, including after a
    /// failed round trip.
    pub fn close(&mut self) {
        self.release();
        if self.state == SessionState::Open {
            debug!("closing session to {}", self.peer);
            self.state = SessionState::Closed;
        }
    }
}

impl<T: Stream> Drop for Session<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read exactly `length` bytes, accumulating partial reads.
///
/// A zero-byte read before `length` bytes arrived means the peer closed the
/// connection.
pub(crate) fn recv_exact<R: Read>(reader: &mut R, length: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(length.min(READ_CHUNK));
    let mut chunk = [0u8; 4096];

    while data.len() < length {
        let want = (length - data.len()).min(chunk.len());
        match reader.read(&mut chunk[..want]) {
            Ok(0) => return Err(ClientError::ConnectionClosed),
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::UnexpectedEof
                ) =>
            {
                return Err(ClientError::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(data)
}

/// Aborts a blocked round trip by shutting the shared socket down.
#[derive(Debug)]
pub struct CancelHandle {
    stream: TcpStream,
}

impl CancelHandle {
    /// Second handle to the same socket.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
        })
    }

    pub fn cancel(&self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
