pub mod cli;
pub mod client;
pub mod error;
pub mod matrix;
pub mod protocol;

pub use client::{Client, Progress, ProgressObserver, QueryResult, SessionPool};
pub use error::{ClientError, Result};
pub use matrix::{Matrix, QueryVectors};
pub use protocol::{Command, Metric, Session, Status, Timings};
