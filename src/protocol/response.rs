use serde::{Serialize, de::DeserializeOwned};

use crate::{error::Result, matrix::Matrix};

use super::{
    Command, Status,
    codec::{self, ResponseHeader},
};

/// Inbound message from the appliance.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub command: Command,
    pub status: Status,
    pub count: u32,
    /// Server-side processing time in seconds.
    pub elapsed: f32,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(command: Command, status: Status) -> Self {
        Self {
            command,
            status,
            count: 0,
            elapsed: 0.0,
            body: Vec::new(),
        }
    }

    pub fn body_length(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn pack(&self) -> Result<Vec<u8>> {
        let header = ResponseHeader {
            command: self.command.into(),
            status: self.status.into(),
            count: self.count,
            elapsed: self.elapsed,
            body_length: self.body_length(),
        };
        codec::encode_response(header, &self.body)
    }

    /// Parse a received response header.
    ///
    /// Returns the response with an empty body, and the number of body bytes that
    /// follow the header on the wire.
    pub fn unpack_header(buf: &[u8]) -> Result<(Self, u64)> {
        let header = codec::decode_response_header(buf)?;
        let response = Self {
            command: header.command.try_into()?,
            status: header.status.into(),
            count: header.count,
            elapsed: header.elapsed,
            body: Vec::new(),
        };
        Ok((response, header.body_length))
    }

    pub fn pack_json<S: Serialize>(&mut self, obj: &S) -> Result<()> {
        self.body = serde_json::to_vec(obj)?;
        Ok(())
    }

    pub fn unpack_json<D: DeserializeOwned>(&self) -> Result<D> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Store a result pair as the body; `count` becomes the number of result rows.
    pub fn pack_results(&mut self, distances: &Matrix<f32>, indices: &Matrix<i32>) -> Result<()> {
        self.body = codec::pack_results(distances, indices)?;
        self.count = distances.rows() as u32;
        Ok(())
    }

    pub fn unpack_results(&self) -> Result<(Matrix<f32>, Matrix<i32>)> {
        codec::unpack_results(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ClientError,
        protocol::codec::{CHECKSUM_SIZE, RESPONSE_HEADER_SIZE},
    };

    #[test]
    fn response_round_trips() {
        let mut resp = Response::new(Command::Query, Status::Success);
        resp.elapsed = 0.25;
        resp.pack_results(
            &Matrix::new(1, 2, vec![0.0, 1.0]).unwrap(),
            &Matrix::new(1, 2, vec![0, 1]).unwrap(),
        )
        .unwrap();

        let buf = resp.pack().unwrap();
        let (mut parsed, len) = Response::unpack_header(&buf[..RESPONSE_HEADER_SIZE]).unwrap();
        let body_end = RESPONSE_HEADER_SIZE + len as usize;
        codec::verify_body(&buf[RESPONSE_HEADER_SIZE..body_end], &buf[body_end..]).unwrap();
        parsed.body = buf[RESPONSE_HEADER_SIZE..body_end].to_vec();

        assert_eq!(buf.len(), body_end + CHECKSUM_SIZE);
        assert_eq!(parsed, resp);
        assert_eq!(parsed.count, 1);

        let (d, i) = parsed.unpack_results().unwrap();
        assert_eq!(d.as_slice(), &[0.0, 1.0]);
        assert_eq!(i.as_slice(), &[0, 1]);
    }

    #[test]
    fn failure_status_survives_header() {
        let resp = Response::new(Command::Query, Status::InvalidApiKey);
        let (parsed, len) = Response::unpack_header(&resp.pack().unwrap()).unwrap();

        assert_eq!(len, 0);
        assert_eq!(parsed.status, Status::InvalidApiKey);
    }

    #[test]
    fn corrupt_elapsed_is_detected() {
        let mut buf = Response::new(Command::Query, Status::Success).pack().unwrap();
        buf[13] ^= 0x01;

        assert!(matches!(
            Response::unpack_header(&buf),
            Err(ClientError::ChecksumMismatch { .. })
        ));
    }
}
