//! Batched query engine.
//!
//! [`Client`] presents one logical operation, "find the k nearest neighbours of these
//! query vectors", on top of a single [`Session`]. Large workloads are split into
//! mini-batches that each fit one round trip; their results are appended in row
//! order, so row `i` of the output always answers row `i` of the input.
//!
//! A call is all-or-nothing. The first failed round trip aborts the remaining
//! mini-batches and the rows accumulated so far are discarded.
//!
//! # Example
//! ```no_run
//! use knnwire::{Client, Metric, QueryVectors};
//!
//! let mut client = Client::connect("10.0.0.5", 5555, "my-key").unwrap();
//! client.load_dataset_file("/data/lsi.h5", "lsi", Metric::L2).unwrap();
//!
//! let query = QueryVectors::from_shape(&[2, 3], &[0.1f32, 0.2, 0.3, 0.4, 0.5, 0.6]).unwrap();
//! let result = client.query(&query, 10, 128).unwrap();
//! assert_eq!(result.indices.shape(), (2, 10));
//! println!("{}", client.timings());
//! ```
mod pool;
mod progress;

use std::{net::TcpStream, ops::Range, time::Instant};

use log::{debug, info, warn};

use crate::{
    error::{ClientError, Result},
    matrix::{Matrix, QueryVectors},
    protocol::{
        CancelHandle, Command, LoadDatasetParams, Metric, QueryFromFileParams, Session, Stream,
        Timings,
    },
};

pub use pool::SessionPool;
pub use progress::{Progress, ProgressObserver};

pub const DEFAULT_K: u32 = 10;
pub const DEFAULT_BATCH_SIZE: usize = 128;
pub const DEFAULT_FILE_BATCH_SIZE: usize = 1024;

/// Distances and neighbour indices, one row per query vector and one column per
/// neighbour.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub distances: Matrix<f32>,
    pub indices: Matrix<i32>,
    pub timings: Timings,
}

/// Row ranges of consecutive mini-batches over `total` rows.
#[derive(Debug, Clone)]
pub struct MiniBatches {
    start: usize,
    total: usize,
    size: usize,
}

impl MiniBatches {
    pub fn new(total: usize, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(ClientError::InvalidArgument(
                "batch size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            start: 0,
            total,
            size,
        })
    }
}

impl Iterator for MiniBatches {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.start >= self.total {
            return None;
        }
        let end = self.total.min(self.start + self.size);
        let range = self.start..end;
        self.start = end;
        Some(range)
    }
}

/// Results of one round trip.
pub(crate) struct BatchResult {
    pub distances: Matrix<f32>,
    pub indices: Matrix<i32>,
    pub elapsed: f32,
}

/// Send `rows` query vectors in one round trip and unpack the answer.
///
/// A result row count that differs from `rows` is logged and otherwise accepted.
pub(crate) fn dispatch<T: Stream>(
    session: &mut Session<T>,
    vectors: &[f32],
    rows: usize,
    k: u32,
) -> Result<BatchResult> {
    let mut request = session.request(Command::Query, k);
    request.pack_vectors(vectors);

    let response = session.round_trip(&request)?;
    let (distances, indices) = response.unpack_results()?;

    if indices.rows() != rows {
        warn!(
            "mini batch length {rows} does not match results length {}",
            indices.rows()
        );
    }

    Ok(BatchResult {
        distances,
        indices,
        elapsed: response.elapsed,
    })
}

/// Reject empty or zero-width input before any I/O.
pub(crate) fn validate_batch(vectors: &Matrix<f32>, batch_size: usize) -> Result<MiniBatches> {
    if vectors.is_empty() {
        return Err(ClientError::InvalidArgument(
            "number of query vectors cannot be zero".to_string(),
        ));
    }
    if vectors.cols() == 0 {
        return Err(ClientError::InvalidArgument(
            "query vectors cannot have zero components".to_string(),
        ));
    }
    MiniBatches::new(vectors.rows(), batch_size)
}

/// Client for the search appliance, owning one session.
pub struct Client<T: Stream = TcpStream> {
    session: Session<T>,
    timings: Timings,
}

impl Client<TcpStream> {
    pub fn connect(host: &str, port: u16, api_key: &str) -> Result<Self> {
        Ok(Self::new(Session::open(host, port, api_key)?))
    }

    /// Handle that aborts the in-flight round trip from another thread.
    pub fn cancel_handle(&self) -> Result<CancelHandle> {
        self.session.cancel_handle()
    }
}

impl<T: Stream> Client<T> {
    pub fn new(session: Session<T>) -> Self {
        Self {
            session,
            timings: Timings::default(),
        }
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Timings of the previous operation.
    pub fn timings(&self) -> Timings {
        self.timings
    }

    /// Ask the appliance to load a dataset file it already has on disk.
    ///
    /// `dataset_name` only matters for HDF5 files.
    pub fn load_dataset_file(
        &mut self,
        file_name: &str,
        dataset_name: &str,
        metric: Metric,
    ) -> Result<()> {
        let started = Instant::now();

        let mut request = self.session.request(Command::LoadDatasetFile, 0);
        request.pack_json(&LoadDatasetParams {
            file_name: file_name.to_string(),
            dataset_name: dataset_name.to_string(),
            metric,
        })?;
        let response = self.session.round_trip(&request)?;

        self.timings = Timings::new(
            f64::from(response.elapsed),
            started.elapsed().as_secs_f64(),
        );
        info!("loaded '{file_name}' with metric {metric}");
        Ok(())
    }

    /// Find the `k` nearest neighbours of every query vector.
    ///
    /// A single vector is sent in one round trip. A matrix is sent in mini-batches of
    /// at most `batch_size` rows.
    pub fn query(
        &mut self,
        vectors: &QueryVectors,
        k: u32,
        batch_size: usize,
    ) -> Result<QueryResult> {
        self.run_query(vectors, k, batch_size, None)
    }

    /// Like [`Client::query`], reporting to `observer` at every mini-batch boundary
    /// after the first.
    pub fn query_with_progress(
        &mut self,
        vectors: &QueryVectors,
        k: u32,
        batch_size: usize,
        observer: &mut dyn ProgressObserver,
    ) -> Result<QueryResult> {
        self.run_query(vectors, k, batch_size, Some(observer))
    }

    fn run_query(
        &mut self,
        vectors: &QueryVectors,
        k: u32,
        batch_size: usize,
        mut observer: Option<&mut dyn ProgressObserver>,
    ) -> Result<QueryResult> {
        let started = Instant::now();
        self.timings = Timings::default();

        let (distances, indices, server_elapsed) = match vectors {
            QueryVectors::Single(vector) => {
                if vector.is_empty() {
                    return Err(ClientError::InvalidArgument(
                        "query vector cannot be empty".to_string(),
                    ));
                }
                let batch = dispatch(&mut self.session, vector, 1, k)?;
                (batch.distances, batch.indices, f64::from(batch.elapsed))
            }
            QueryVectors::Batch(matrix) => {
                let batches = validate_batch(matrix, batch_size)?;
                let total = matrix.rows();
                let cols = matrix.cols();

                let mut distances = Matrix::empty(k as usize);
                let mut indices = Matrix::empty(k as usize);
                let mut server_elapsed = 0.0;

                for range in batches {
                    if range.start > 0 {
                        if let Some(observer) = observer.as_deref_mut() {
                            observer.on_batch(&Progress {
                                rows_done: range.start,
                                rows_total: total,
                                elapsed: started.elapsed(),
                            });
                        }
                    }

                    let rows = range.end - range.start;
                    debug!("dispatching rows {range:?} of {total}");
                    let values = &matrix.as_slice()[range.start * cols..range.end * cols];
                    let batch = dispatch(&mut self.session, values, rows, k)?;

                    server_elapsed += f64::from(batch.elapsed);
                    append_results(&mut distances, &mut indices, batch)?;
                }

                (distances, indices, server_elapsed)
            }
        };

        self.timings = Timings::new(server_elapsed, started.elapsed().as_secs_f64());
        Ok(QueryResult {
            distances,
            indices,
            timings: self.timings,
        })
    }

    /// Run a query whose vectors live in a file on the appliance.
    ///
    /// The appliance does the batching, `batch_size` rows at a time, and returns all
    /// results in one response.
    pub fn query_from_file(
        &mut self,
        file_name: &str,
        dataset_name: &str,
        k: u32,
        batch_size: usize,
    ) -> Result<QueryResult> {
        let started = Instant::now();
        let batch_size = u32::try_from(batch_size).map_err(|_| {
            ClientError::InvalidArgument(format!("batch size {batch_size} does not fit in u32"))
        })?;

        let mut request = self.session.request(Command::QueryFromFile, 0);
        request.pack_json(&QueryFromFileParams {
            file_name: file_name.to_string(),
            dataset_name: dataset_name.to_string(),
            k,
            batch_size,
        })?;
        let response = self.session.round_trip(&request)?;
        let (distances, indices) = response.unpack_results()?;

        self.timings = Timings::new(
            f64::from(response.elapsed),
            started.elapsed().as_secs_f64(),
        );
        Ok(QueryResult {
            distances,
            indices,
            timings: self.timings,
        })
    }

    pub fn close(&mut self) {
        self.session.close();
    }
}

pub(crate) fn append_results(
    distances: &mut Matrix<f32>,
    indices: &mut Matrix<i32>,
    batch: BatchResult,
) -> Result<()> {
    let columns = |e: ClientError| ClientError::MalformedPayload(e.to_string());
    distances.append(batch.distances).map_err(columns)?;
    indices.append(batch.indices).map_err(columns)
}
