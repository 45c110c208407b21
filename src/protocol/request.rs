use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::{ClientError, Result},
    matrix::Matrix,
};

use super::{
    Command, Metric,
    codec::{self, API_KEY_SIZE, RequestHeader},
};

/// JSON body of a [`Command::LoadDatasetFile`] request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadDatasetParams {
    pub file_name: String,
    pub dataset_name: String,
    pub metric: Metric,
}

/// JSON body of a [`Command::QueryFromFile`] request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFromFileParams {
    pub file_name: String,
    pub dataset_name: String,
    pub k: u32,
    pub batch_size: u32,
}

/// Outbound message to the appliance.
///
/// The body length is always derived from `body`, so a request without a body
/// carries a zero length on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub k: u32,
    pub api_key: [u8; API_KEY_SIZE],
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(api_key: &str, command: Command, k: u32, body: Vec<u8>) -> Self {
        Self {
            command,
            k,
            api_key: codec::normalize_api_key(api_key),
            body,
        }
    }

    pub fn body_length(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn pack_json<S: Serialize>(&mut self, obj: &S) -> Result<()> {
        self.body = serde_json::to_vec(obj)?;
        Ok(())
    }

    pub fn unpack_json<D: DeserializeOwned>(&self) -> Result<D> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Store row-major `f32` vectors as the body.
    pub fn pack_vectors(&mut self, vectors: &[f32]) {
        self.body = codec::encode_f32s(vectors);
    }

    /// Parse the body as vectors of `dim` components, one per row.
    pub fn unpack_vectors(&self, dim: usize) -> Result<Matrix<f32>> {
        let row_bytes = dim.checked_mul(size_of::<f32>()).ok_or_else(|| {
            ClientError::MalformedPayload(format!("vector dimension {dim} is too large"))
        })?;
        if row_bytes == 0 || self.body.len() % row_bytes != 0 {
            return Err(ClientError::MalformedPayload(format!(
                "body of {} bytes is not a whole number of {dim}-dimensional vectors",
                self.body.len()
            )));
        }

        let rows = self.body.len() / row_bytes;
        Matrix::new(rows, dim, codec::decode_f32s(&self.body))
    }

    /// Frame this request for transmission.
    ///
    /// Call only once every field, body included, is final.
    pub fn pack(&self) -> Result<Vec<u8>> {
        let header = RequestHeader {
            command: self.command.into(),
            k: self.k,
            api_key: self.api_key,
            body_length: self.body_length(),
        };
        codec::encode_request(header, &self.body)
    }

    /// Parse a received request header.
    ///
    /// Returns the request with an empty body, and the number of body bytes that
    /// follow the header on the wire.
    pub fn unpack_header(buf: &[u8]) -> Result<(Self, u64)> {
        let header = codec::decode_request_header(buf)?;
        let request = Self {
            command: header.command.try_into()?,
            k: header.k,
            api_key: header.api_key,
            body: Vec::new(),
        };
        Ok((request, header.body_length))
    }

    /// API key with its space padding removed.
    pub fn api_key_str(&self) -> String {
        String::from_utf8_lossy(&self.api_key)
            .trim_end_matches(' ')
            .to_string()
    }
}
