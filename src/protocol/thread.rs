use std::{
    io,
    sync::{Arc, Mutex, mpsc},
    thread,
};

use log::{debug, warn};

use crate::error::{ClientError, Result};

/// Unit of work; receives the state owned by the worker that runs it.
pub type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Fixed set of worker threads pulling jobs from one queue.
///
/// Every worker owns one value of `S` for its whole life, which lets a pool of
/// sessions run jobs without sharing any connection between threads.
#[derive(Debug)]
pub struct ThreadPool<S: Send + 'static> {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job<S>>>,
}

impl ThreadPool<()> {
    pub fn new(size: usize) -> Self {
        Self::with_states((0..size).map(|_| ()).collect())
    }
}

impl<S: Send + 'static> ThreadPool<S> {
    /// Start one worker per state.
    pub fn with_states(states: Vec<S>) -> Self {
        assert!(!states.is_empty());

        let mut workers = Vec::with_capacity(states.len());
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for (i, state) in states.into_iter().enumerate() {
            workers.push(Worker::new(i, state, Arc::clone(&receiver)));
        }

        Self { workers, sender }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let job: Job<S> = Box::new(f);
        self.sender
            .as_ref()
            .ok_or_else(shut_down)?
            .send(job)
            .map_err(|_| shut_down())
    }
}

fn shut_down() -> ClientError {
    ClientError::Io(io::Error::other("thread pool has shut down"))
}

impl<S: Send + 'static> Drop for ThreadPool<S> {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);

            if worker.thread.join().is_err() {
                warn!("worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new<S: Send + 'static>(
        id: usize,
        mut state: S,
        receiver: Arc<Mutex<mpsc::Receiver<Job<S>>>>,
    ) -> Self {
        let thread = thread::spawn(move || {
            loop {
                let msg = match receiver.lock() {
                    Ok(rx) => rx.recv(),
                    Err(_) => break,
                };
                match msg {
                    Ok(job) => {
                        debug!("worker {id} running a job");
                        job(&mut state);
                    }
                    Err(_) => {
                        debug!("worker {id} disconnected");
                        break;
                    }
                }
            }
        });

        Self { id, thread }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_worker_keeps_its_state() {
        let pool = ThreadPool::with_states(vec![0usize, 100]);
        let (tx, rx) = mpsc::channel();

        for _ in 0..10 {
            let tx = tx.clone();
            pool.execute(move |count: &mut usize| {
                *count += 1;
                tx.send(*count).unwrap();
            })
            .unwrap();
        }
        drop(tx);
        drop(pool);

        let mut seen: Vec<usize> = rx.iter().collect();
        seen.sort();
        assert_eq!(seen.len(), 10);
        assert!(seen.iter().all(|c| (1..=10).contains(c) || (101..=110).contains(c)));
    }

    #[test]
    fn drop_joins_workers() {
        let pool = ThreadPool::new(3);
        assert_eq!(pool.size(), 3);
        pool.execute(|_| {}).unwrap();
        drop(pool);
    }
}
