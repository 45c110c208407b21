//! In-process stand-in for the search appliance.
//!
//! [`MockAppliance`] speaks the same wire protocol as the real appliance and answers
//! queries with an exhaustive k-NN scan over an in-memory dataset. It validates
//! frames the way the appliance does (API key, checksums, vector length) and keeps a
//! record of what it served, which makes it the fixture for the client tests and a
//! local target for the command-line client.
use std::{
    io::Write,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use log::{debug, info, warn};

use crate::{
    error::{ClientError, Result},
    matrix::Matrix,
};

use super::{
    Command, LoadDatasetParams, Metric, QueryFromFileParams, Request, Response, Status,
    ThreadPool,
    codec::{self, API_KEY_SIZE, CHECKSUM_SIZE, REQUEST_HEADER_SIZE},
    transport::recv_exact,
};

const DEFAULT_WORKERS: usize = 16;

/// Exhaustive k nearest neighbour search.
///
/// `L2` ranks by squared euclidean distance, ascending. `IP` ranks by inner
/// product, descending, and reports the inner product as the distance. Ties go to
/// the lower dataset index.
pub fn brute_force_knn(
    dataset: &Matrix<f32>,
    queries: &Matrix<f32>,
    k: usize,
    metric: Metric,
) -> Result<(Matrix<f32>, Matrix<i32>)> {
    let k = k.min(dataset.rows());
    let mut distances = Vec::with_capacity(queries.rows() * k);
    let mut indices = Vec::with_capacity(queries.rows() * k);

    for query in queries.iter_rows() {
        let mut scored: Vec<(f32, usize)> = dataset
            .iter_rows()
            .enumerate()
            .map(|(i, row)| {
                let score: f32 = match metric {
                    Metric::L2 => row.iter().zip(query).map(|(a, b)| (a - b) * (a - b)).sum(),
                    Metric::IP => row.iter().zip(query).map(|(a, b)| a * b).sum(),
                };
                (score, i)
            })
            .collect();

        scored.sort_by(|a, b| {
            let order = match metric {
                Metric::L2 => a.0.total_cmp(&b.0),
                Metric::IP => b.0.total_cmp(&a.0),
            };
            order.then(a.1.cmp(&b.1))
        });

        for (score, i) in scored.into_iter().take(k) {
            distances.push(score);
            indices.push(i as i32);
        }
    }

    Ok((
        Matrix::new(queries.rows(), k, distances)?,
        Matrix::new(queries.rows(), k, indices)?,
    ))
}

struct ApplianceState {
    dataset: Matrix<f32>,
    metric: Metric,
    api_key: Option<[u8; API_KEY_SIZE]>,
    forced_status: Option<Status>,
    batches: Mutex<Vec<usize>>,
    loads: Mutex<Vec<LoadDatasetParams>>,
}

pub struct MockAppliance {
    state: ApplianceState,
    workers: usize,
}

impl MockAppliance {
    pub fn new(dataset: Matrix<f32>, metric: Metric) -> Self {
        Self {
            state: ApplianceState {
                dataset,
                metric,
                api_key: None,
                forced_status: None,
                batches: Mutex::new(Vec::new()),
                loads: Mutex::new(Vec::new()),
            },
            workers: DEFAULT_WORKERS,
        }
    }

    /// Reject requests whose API key differs from `key` with `InvalidApiKey`.
    pub fn with_api_key(mut self, key: &str) -> Self {
        self.state.api_key = Some(codec::normalize_api_key(key));
        self
    }

    /// Answer every well-formed request with `status`.
    pub fn with_status(mut self, status: Status) -> Self {
        self.state.forced_status = Some(status);
        self
    }

    /// Maximum number of connections served at once.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Serve connections on `address` until the process exits.
    pub fn listen(self, address: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(address)?;
        info!("mock appliance listening at {}", listener.local_addr()?);
        serve(
            listener,
            Arc::new(self.state),
            self.workers,
            Arc::new(AtomicBool::new(false)),
        );
        Ok(())
    }

    /// Serve connections on `address` from a background thread.
    pub fn spawn(self, address: SocketAddr) -> Result<ApplianceHandle> {
        let listener = TcpListener::bind(address)?;
        let addr = listener.local_addr()?;
        let state = Arc::new(self.state);
        let stopped = Arc::new(AtomicBool::new(false));

        let handle = ApplianceHandle {
            addr,
            state: Arc::clone(&state),
            stopped: Arc::clone(&stopped),
        };
        let workers = self.workers;
        thread::spawn(move || serve(listener, state, workers, stopped));

        debug!("mock appliance spawned at {addr}");
        Ok(handle)
    }
}

/// Running [`MockAppliance`]; stops accepting connections when dropped.
pub struct ApplianceHandle {
    addr: SocketAddr,
    state: Arc<ApplianceState>,
    stopped: Arc<AtomicBool>,
}

impl ApplianceHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Row count of every query batch served, in arrival order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state
            .batches
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    /// Parameters of every dataset load request served.
    pub fn loads(&self) -> Vec<LoadDatasetParams> {
        self.state
            .loads
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }
}

impl Drop for ApplianceHandle {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Wake the accept loop so it sees the flag.
        let _ = TcpStream::connect(self.addr);
    }
}

fn serve(
    listener: TcpListener,
    state: Arc<ApplianceState>,
    workers: usize,
    stopped: Arc<AtomicBool>,
) {
    let pool = ThreadPool::new(workers);

    for stream in listener.incoming() {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&state);
                let queued = pool.execute(move |_| {
                    if let Err(e) = handle_connection(stream, &state) {
                        warn!("connection ended with error: {e}");
                    }
                });
                if let Err(e) = queued {
                    warn!("dropping connection: {e}");
                }
            }
            Err(e) => warn!("broken connection: {e:?}"),
        }
    }
    debug!("mock appliance stopped accepting connections");
}

fn handle_connection(mut stream: TcpStream, state: &ApplianceState) -> Result<()> {
    loop {
        let header = match recv_exact(&mut stream, REQUEST_HEADER_SIZE) {
            Ok(header) => header,
            Err(ClientError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };

        let started = Instant::now();
        let mut resp = match read_request(&mut stream, &header) {
            Ok(req) => {
                debug!("received {:?} request, {} body bytes", req.command, req.body.len());
                respond(&req, state)
            }
            Err(ClientError::ChecksumMismatch { .. }) => {
                Response::new(Command::Query, Status::InvalidChecksum)
            }
            Err(ClientError::ConnectionClosed) => return Ok(()),
            Err(_) => Response::new(Command::Query, Status::InvalidPacket),
        };
        resp.elapsed = started.elapsed().as_secs_f32();

        stream.write_all(&resp.pack()?)?;

        if !resp.status.is_success() {
            // The client tears its side down after any failure status.
            return Ok(());
        }
    }
}

fn read_request(stream: &mut TcpStream, header: &[u8]) -> Result<Request> {
    let (mut req, body_length) = Request::unpack_header(header)?;

    if body_length > 0 {
        let body_length = usize::try_from(body_length).map_err(|_| {
            ClientError::MalformedPayload(format!("body length {body_length} is too large"))
        })?;
        let body = recv_exact(stream, body_length)?;
        let trailer = recv_exact(stream, CHECKSUM_SIZE)?;
        codec::verify_body(&body, &trailer)?;
        req.body = body;
    }

    Ok(req)
}

fn respond(req: &Request, state: &ApplianceState) -> Response {
    let fail = |status| Response::new(req.command, status);

    if state.api_key.is_some_and(|key| key != req.api_key) {
        return fail(Status::InvalidApiKey);
    }
    if let Some(status) = state.forced_status {
        return fail(status);
    }

    let result = match req.command {
        Command::Query => query(req, state),
        Command::LoadDatasetFile => load_dataset(req, state),
        Command::QueryFromFile => query_from_file(req, state),
    };
    result.unwrap_or_else(fail)
}

fn query(req: &Request, state: &ApplianceState) -> std::result::Result<Response, Status> {
    let vectors = req
        .unpack_vectors(state.dataset.cols())
        .map_err(|_| Status::DifferentVectorLength)?;
    let k = req.k as usize;
    if k == 0 || k > state.dataset.rows() {
        return Err(Status::InvalidArgument);
    }

    if let Ok(mut batches) = state.batches.lock() {
        batches.push(vectors.rows());
    }

    let (distances, indices) = brute_force_knn(&state.dataset, &vectors, k, state.metric)
        .map_err(|_| Status::UnknownError)?;
    results(req.command, &distances, &indices)
}

fn load_dataset(req: &Request, state: &ApplianceState) -> std::result::Result<Response, Status> {
    let params: LoadDatasetParams = req.unpack_json().map_err(|_| Status::InvalidData)?;
    if params.file_name.is_empty() {
        return Err(Status::DatasetFileNotFound);
    }
    if params.metric != state.metric {
        return Err(Status::DistanceModeNotSupported);
    }

    info!("load of '{}' requested", params.file_name);
    if let Ok(mut loads) = state.loads.lock() {
        loads.push(params);
    }
    Ok(Response::new(req.command, Status::Success))
}

/// The query file is taken to hold the served dataset itself, so the answer is
/// its k-NN graph.
fn query_from_file(
    req: &Request,
    state: &ApplianceState,
) -> std::result::Result<Response, Status> {
    let params: QueryFromFileParams = req.unpack_json().map_err(|_| Status::InvalidData)?;
    let k = params.k as usize;
    if params.file_name.is_empty() {
        return Err(Status::DatasetFileNotFound);
    }
    if k == 0 || k > state.dataset.rows() || params.batch_size == 0 {
        return Err(Status::InvalidArgument);
    }

    let (distances, indices) = brute_force_knn(&state.dataset, &state.dataset, k, state.metric)
        .map_err(|_| Status::UnknownError)?;
    results(req.command, &distances, &indices)
}

fn results(
    command: Command,
    distances: &Matrix<f32>,
    indices: &Matrix<i32>,
) -> std::result::Result<Response, Status> {
    let mut resp = Response::new(command, Status::Success);
    resp.pack_results(distances, indices)
        .map_err(|_| Status::UnknownError)?;
    Ok(resp)
}
