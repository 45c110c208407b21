use std::{
    net::TcpStream,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    time::Instant,
};

use log::{debug, info};

use crate::{
    error::{ClientError, Result},
    matrix::Matrix,
    protocol::{CancelHandle, Session, Stream, ThreadPool, Timings},
};

use super::{BatchResult, QueryResult, append_results, dispatch, validate_batch};

/// Fans the mini-batches of one query out across several sessions.
///
/// Each worker thread owns one session, so no connection ever carries two requests
/// at once. Results are put back in input row order whatever order the workers
/// finish in. As with [`Client`](super::Client), a query is all-or-nothing.
///
/// A session that fails stays failed, and a query fails as soon as one of its
/// mini-batches lands on a failed session. Once [`SessionPool::is_healthy`] returns
/// false the pool should be dropped and rebuilt. Mini-batches of a failed query
/// that have not started yet are skipped.
pub struct SessionPool<T: Stream + Send + 'static = TcpStream> {
    pool: ThreadPool<Session<T>>,
    failed: Arc<AtomicUsize>,
    cancels: Vec<CancelHandle>,
}

impl SessionPool<TcpStream> {
    /// Open `workers` independent sessions to the same appliance.
    pub fn connect(host: &str, port: u16, api_key: &str, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(ClientError::InvalidArgument(
                "a session pool needs at least one worker".to_string(),
            ));
        }

        let sessions = (0..workers)
            .map(|_| Session::open(host, port, api_key))
            .collect::<Result<Vec<_>>>()?;
        let cancels = sessions
            .iter()
            .map(Session::cancel_handle)
            .collect::<Result<Vec<_>>>()?;
        info!("opened {workers} sessions to {host}:{port}");

        let mut pool = Self::from_sessions(sessions)?;
        pool.cancels = cancels;
        Ok(pool)
    }

    /// One handle per session; cancelling them all aborts a running query.
    pub fn cancel_handles(&self) -> Result<Vec<CancelHandle>> {
        self.cancels.iter().map(CancelHandle::try_clone).collect()
    }
}

impl<T: Stream + Send + 'static> SessionPool<T> {
    pub fn from_sessions(sessions: Vec<Session<T>>) -> Result<Self> {
        if sessions.is_empty() {
            return Err(ClientError::InvalidArgument(
                "a session pool needs at least one session".to_string(),
            ));
        }
        Ok(Self {
            pool: ThreadPool::with_states(sessions),
            failed: Arc::new(AtomicUsize::new(0)),
            cancels: Vec::new(),
        })
    }

    pub fn size(&self) -> usize {
        self.pool.size()
    }

    /// True while no session of the pool has failed.
    pub fn is_healthy(&self) -> bool {
        self.failed.load(Ordering::SeqCst) == 0
    }

    /// Find the `k` nearest neighbours of every row of `vectors`, `batch_size` rows
    /// per round trip.
    pub fn query(&self, vectors: &Matrix<f32>, k: u32, batch_size: usize) -> Result<QueryResult> {
        let started = Instant::now();
        let batches = validate_batch(vectors, batch_size)?;

        let (tx, rx) = mpsc::channel();
        let aborted = Arc::new(AtomicBool::new(false));
        let mut jobs = 0;
        for (index, range) in batches.enumerate() {
            let rows = range.end - range.start;
            let batch = vectors.slice_rows(range);
            let tx = tx.clone();
            let aborted = Arc::clone(&aborted);
            let failed = Arc::clone(&self.failed);

            self.pool.execute(move |session: &mut Session<T>| {
                if aborted.load(Ordering::SeqCst) {
                    debug!("skipping mini-batch {index} of a failed query");
                    return;
                }
                let was_open = session.is_open();
                let result = dispatch(session, batch.as_slice(), rows, k);
                if was_open && !session.is_open() {
                    failed.fetch_add(1, Ordering::SeqCst);
                }
                // The receiver is gone once the query has already failed.
                let _ = tx.send((index, result));
            })?;
            jobs += 1;
        }
        drop(tx);
        debug!("queued {jobs} mini-batches on {} sessions", self.size());

        let mut slots: Vec<Option<BatchResult>> = (0..jobs).map(|_| None).collect();
        for (index, result) in rx.iter().take(jobs) {
            match result {
                Ok(batch) => slots[index] = Some(batch),
                Err(e) => {
                    aborted.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        let mut distances = Matrix::empty(k as usize);
        let mut indices = Matrix::empty(k as usize);
        let mut server_elapsed = 0.0;
        for (index, slot) in slots.into_iter().enumerate() {
            let batch = slot.ok_or_else(|| {
                ClientError::Io(std::io::Error::other(format!(
                    "mini-batch {index} was never answered"
                )))
            })?;
            server_elapsed += f64::from(batch.elapsed);
            append_results(&mut distances, &mut indices, batch)?;
        }

        Ok(QueryResult {
            distances,
            indices,
            timings: Timings::new(server_elapsed, started.elapsed().as_secs_f64()),
        })
    }
}
