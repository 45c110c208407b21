//! Fixed-layout binary framing.
//!
//! ```text
//! request header (28 bytes)
//! ┌─────────┬─────┬─────────┬─────────────┬──────────┐
//! │ command │ k   │ api key │ body length │ checksum │
//! │ u32     │ u32 │ 8 bytes │ u64         │ u32      │
//! └─────────┴─────┴─────────┴─────────────┴──────────┘
//!
//! response header (28 bytes)
//! ┌─────────┬────────┬───────┬─────────┬─────────────┬──────────┐
//! │ command │ status │ count │ elapsed │ body length │ checksum │
//! │ u32     │ u32    │ u32   │ f32     │ u64         │ u32      │
//! └─────────┴────────┴───────┴─────────┴─────────────┴──────────┘
//! ```
//!
//! The header checksum is the CRC-32 of every header byte before it. A non-empty
//! body follows the header and carries its own trailing CRC-32. All values are
//! little-endian.
use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
};

use crate::{
    error::{ClientError, Result, Section},
    matrix::Matrix,
};

pub const REQUEST_HEADER_SIZE: usize = 28;
pub const RESPONSE_HEADER_SIZE: usize = 28;
pub const CHECKSUM_SIZE: usize = 4;
pub const API_KEY_SIZE: usize = 8;

const RESULTS_SHAPE_SIZE: usize = 8;
const ELEMENT_SIZE: usize = 4;

fn config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Request header fields covered by the header checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct RequestHeader {
    pub command: u32,
    pub k: u32,
    pub api_key: [u8; API_KEY_SIZE],
    pub body_length: u64,
}

/// Response header fields covered by the header checksum.
#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct ResponseHeader {
    pub command: u32,
    pub status: u32,
    pub count: u32,
    pub elapsed: f32,
    pub body_length: u64,
}

pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

fn encode_header<H: Encode>(header: H, size: usize) -> Result<Vec<u8>> {
    let mut buf = bincode::encode_to_vec(header, config())?;
    debug_assert_eq!(buf.len() + CHECKSUM_SIZE, size);

    let sum = checksum(&buf);
    buf.extend_from_slice(&sum.to_le_bytes());
    Ok(buf)
}

fn decode_header<H: Decode<()>>(buf: &[u8], size: usize) -> Result<H> {
    if buf.len() != size {
        return Err(ClientError::MalformedPayload(format!(
            "header is {size} bytes, got {}",
            buf.len()
        )));
    }

    let (fields, trailer) = buf.split_at(size - CHECKSUM_SIZE);
    verify(Section::Header, fields, trailer)?;

    let (header, _) = bincode::decode_from_slice(fields, config())?;
    Ok(header)
}

fn verify(section: Section, bytes: &[u8], trailer: &[u8]) -> Result<()> {
    let expected = u32::from_le_bytes(trailer.try_into().map_err(|_| {
        ClientError::MalformedPayload(format!(
            "checksum trailer is {CHECKSUM_SIZE} bytes, got {}",
            trailer.len()
        ))
    })?);
    let computed = checksum(bytes);

    if expected != computed {
        return Err(ClientError::ChecksumMismatch {
            section,
            expected,
            computed,
        });
    }
    Ok(())
}

/// Append `body` and its checksum trailer to an encoded header.
fn append_body(buf: &mut Vec<u8>, body: &[u8]) {
    if body.is_empty() {
        return;
    }
    buf.extend_from_slice(body);
    buf.extend_from_slice(&checksum(body).to_le_bytes());
}

pub fn encode_request(header: RequestHeader, body: &[u8]) -> Result<Vec<u8>> {
    let mut buf = encode_header(header, REQUEST_HEADER_SIZE)?;
    append_body(&mut buf, body);
    Ok(buf)
}

pub fn encode_response(header: ResponseHeader, body: &[u8]) -> Result<Vec<u8>> {
    let mut buf = encode_header(header, RESPONSE_HEADER_SIZE)?;
    append_body(&mut buf, body);
    Ok(buf)
}

pub fn decode_request_header(buf: &[u8]) -> Result<RequestHeader> {
    decode_header(buf, REQUEST_HEADER_SIZE)
}

pub fn decode_response_header(buf: &[u8]) -> Result<ResponseHeader> {
    decode_header(buf, RESPONSE_HEADER_SIZE)
}

/// Check a body against the 4-byte checksum trailer received after it.
pub fn verify_body(body: &[u8], trailer: &[u8]) -> Result<()> {
    verify(Section::Body, body, trailer)
}

/// Right-pad with spaces and truncate to exactly [`API_KEY_SIZE`] bytes.
pub fn normalize_api_key(key: &str) -> [u8; API_KEY_SIZE] {
    let mut out = [b' '; API_KEY_SIZE];
    for (dst, src) in out.iter_mut().zip(key.as_bytes()) {
        *dst = *src;
    }
    out
}

pub fn encode_f32s(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * ELEMENT_SIZE);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn decode_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(ELEMENT_SIZE)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn decode_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(ELEMENT_SIZE)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Encode a result pair as `rows:u32, cols:u32`, the distances, then the indices.
pub fn pack_results(distances: &Matrix<f32>, indices: &Matrix<i32>) -> Result<Vec<u8>> {
    if distances.shape() != indices.shape() {
        return Err(ClientError::InvalidArgument(format!(
            "distances {:?} and indices {:?} must have the same shape",
            distances.shape(),
            indices.shape()
        )));
    }

    let (rows, cols) = distances.shape();
    let to_u32 = |v: usize| {
        u32::try_from(v).map_err(|_| {
            ClientError::InvalidArgument(format!("result dimension {v} does not fit in u32"))
        })
    };

    let mut body = Vec::with_capacity(RESULTS_SHAPE_SIZE + 2 * rows * cols * ELEMENT_SIZE);
    body.extend_from_slice(&bincode::encode_to_vec(
        (to_u32(rows)?, to_u32(cols)?),
        config(),
    )?);
    body.extend_from_slice(&encode_f32s(distances.as_slice()));
    for v in indices.as_slice() {
        body.extend_from_slice(&v.to_le_bytes());
    }
    Ok(body)
}

/// Inverse of [`pack_results`].
pub fn unpack_results(body: &[u8]) -> Result<(Matrix<f32>, Matrix<i32>)> {
    if body.len() < RESULTS_SHAPE_SIZE {
        return Err(ClientError::MalformedPayload(format!(
            "results body is {} bytes, shorter than its shape prefix",
            body.len()
        )));
    }

    let ((rows, cols), _): ((u32, u32), _) =
        bincode::decode_from_slice(&body[..RESULTS_SHAPE_SIZE], config())?;
    let (rows, cols) = (rows as usize, cols as usize);

    let matrix_size = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(ELEMENT_SIZE))
        .ok_or_else(|| {
            ClientError::MalformedPayload(format!("result shape [{rows}x{cols}] overflows"))
        })?;
    let payload = &body[RESULTS_SHAPE_SIZE..];
    if Some(payload.len()) != matrix_size.checked_mul(2) {
        return Err(ClientError::MalformedPayload(format!(
            "result shape [{rows}x{cols}] needs {} bytes, got {}",
            matrix_size.saturating_mul(2),
            payload.len()
        )));
    }

    let (d, i) = payload.split_at(matrix_size);
    Ok((
        Matrix::new(rows, cols, decode_f32s(d))?,
        Matrix::new(rows, cols, decode_i32s(i))?,
    ))
}
