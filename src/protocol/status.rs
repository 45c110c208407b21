use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Operation requested of the appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    LoadDatasetFile,
    Query,
    QueryFromFile,
}

impl From<Command> for u32 {
    fn from(value: Command) -> Self {
        match value {
            Command::LoadDatasetFile => 0x01,
            Command::Query => 0x02,
            Command::QueryFromFile => 0x03,
        }
    }
}

impl TryFrom<u32> for Command {
    type Error = ClientError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0x01 => Ok(Command::LoadDatasetFile),
            0x02 => Ok(Command::Query),
            0x03 => Ok(Command::QueryFromFile),
            code => Err(ClientError::MalformedPayload(format!(
                "unknown command code {code:#04x}"
            ))),
        }
    }
}

/// Outcome code carried by every response.
///
/// Codes follow the appliance firmware table below. A code outside the table is kept
/// as [`Status::Unrecognized`] so the raw value still reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    InvalidSequence,
    InvalidArgument,
    InvalidPacket,
    NotSupported,
    InvalidCommand,
    InvalidData,
    Timeout,
    InvalidChecksum,
    InvalidApiKey,
    /// Query vectors do not match the dataset dimension.
    DifferentVectorLength,
    DatasetFileNotFound,
    DatasetNotFound,
    DatasetSizeNotSupported,
    QuerySizeNotSupported,
    DistanceModeNotSupported,
    QueryModeNotSupported,
    ReadCountNotSupported,
    UnknownError,
    Unrecognized(u32),
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        match value {
            Status::Success => 0x00,
            Status::InvalidSequence => 0x01,
            Status::InvalidArgument => 0x02,
            Status::InvalidPacket => 0x03,
            Status::NotSupported => 0x04,
            Status::InvalidCommand => 0x05,
            Status::InvalidData => 0x06,
            Status::Timeout => 0x07,
            Status::InvalidChecksum => 0x08,
            Status::InvalidApiKey => 0x09,
            Status::DifferentVectorLength => 0x10,
            Status::DatasetFileNotFound => 0x20,
            Status::DatasetNotFound => 0x21,
            Status::DatasetSizeNotSupported => 0x22,
            Status::QuerySizeNotSupported => 0x23,
            Status::DistanceModeNotSupported => 0x24,
            Status::QueryModeNotSupported => 0x25,
            Status::ReadCountNotSupported => 0x26,
            Status::UnknownError => 0xFF,
            Status::Unrecognized(code) => code,
        }
    }
}

impl From<u32> for Status {
    fn from(value: u32) -> Self {
        match value {
            0x00 => Status::Success,
            0x01 => Status::InvalidSequence,
            0x02 => Status::InvalidArgument,
            0x03 => Status::InvalidPacket,
            0x04 => Status::NotSupported,
            0x05 => Status::InvalidCommand,
            0x06 => Status::InvalidData,
            0x07 => Status::Timeout,
            0x08 => Status::InvalidChecksum,
            0x09 => Status::InvalidApiKey,
            0x10 => Status::DifferentVectorLength,
            0x20 => Status::DatasetFileNotFound,
            0x21 => Status::DatasetNotFound,
            0x22 => Status::DatasetSizeNotSupported,
            0x23 => Status::QuerySizeNotSupported,
            0x24 => Status::DistanceModeNotSupported,
            0x25 => Status::QueryModeNotSupported,
            0x26 => Status::ReadCountNotSupported,
            0xFF => Status::UnknownError,
            code => Status::Unrecognized(code),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Unrecognized(code) => write!(f, "Unrecognized({code:#04x})"),
            status => write!(f, "{status:?} ({:#04x})", u32::from(*status)),
        }
    }
}

/// Distance function used by the appliance.
///
/// `L2` is the squared euclidean distance. `IP` is the inner product, which gives
/// cosine similarity when dataset and query vectors are normalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    #[default]
    L2,
    IP,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::L2 => write!(f, "L2"),
            Metric::IP => write!(f, "IP"),
        }
    }
}

impl TryFrom<&str> for Metric {
    type Error = ClientError;

    fn try_from(value: &str) -> Result<Self> {
        match value.trim().to_uppercase().as_str() {
            "L2" => Ok(Metric::L2),
            "IP" => Ok(Metric::IP),
            other => Err(ClientError::InvalidArgument(format!(
                "unsupported metric '{other}', expected 'L2' or 'IP'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for code in (0x00..=0x26).chain([0xFF]) {
            let status = Status::from(code);
            assert_eq!(u32::from(status), code);
        }
    }

    #[test]
    fn unknown_status_keeps_code() {
        assert_eq!(Status::from(0x11), Status::Unrecognized(0x11));
        assert!(!Status::from(0x11).is_success());
    }

    #[test]
    fn command_codes() {
        for command in [Command::LoadDatasetFile, Command::Query, Command::QueryFromFile] {
            assert_eq!(Command::try_from(u32::from(command)).unwrap(), command);
        }
        assert!(Command::try_from(0x04).is_err());
    }

    #[test]
    fn metric_serializes_as_name() {
        assert_eq!(serde_json::to_string(&Metric::IP).unwrap(), "\"IP\"");

        let metric: Metric = "l2".try_into().unwrap();
        assert_eq!(metric, Metric::L2);
    }
}
