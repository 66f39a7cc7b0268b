//! Fixed-size worker pools for dispatch nodes and shadow copies.
//!
//! Each worker drains its own bounded queue one job at a time. Jobs are
//! spread over the workers round-robin.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::GatewayError;
use crate::lifecycle::Shutdown;

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct WorkerPool {
    name: &'static str,
    queues: Vec<mpsc::Sender<Job>>,
    receivers: Mutex<Vec<mpsc::Receiver<Job>>>,
    next: AtomicUsize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.queues.len())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(name: &'static str, workers: usize, queue: usize) -> Arc<Self> {
        let (queues, receivers): (Vec<_>, Vec<_>) = (0..workers.max(1))
            .map(|_| mpsc::channel(queue.max(1)))
            .unzip();
        Arc::new(Self {
            name,
            queues,
            receivers: Mutex::new(receivers),
            next: AtomicUsize::new(0),
        })
    }

    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// Spawn the workers. Each one stops on the shutdown broadcast.
    pub fn start(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let receivers = std::mem::take(&mut *self.receivers.lock());
        let handles: Vec<_> = receivers
            .into_iter()
            .enumerate()
            .map(|(index, rx)| tokio::spawn(worker(self.name, index, rx, shutdown.subscribe())))
            .collect();
        tracing::info!(pool = self.name, workers = handles.len(), "Worker pool started");
        handles
    }

    fn slot(&self) -> &mpsc::Sender<Job> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        &self.queues[index]
    }

    /// Queue a job, waiting for room. Fails once the pool stopped.
    pub async fn submit(&self, job: Job) -> Result<(), GatewayError> {
        self.slot().send(job).await.map_err(|_| GatewayError::Stopped)
    }

    /// Queue a job unless the chosen worker is full.
    pub fn try_submit(&self, job: Job) -> bool {
        match self.slot().try_send(job) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(pool = self.name, error = %e, "Job dropped");
                false
            }
        }
    }
}

async fn worker(
    pool: &'static str,
    index: usize,
    mut rx: mpsc::Receiver<Job>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(job) => job.await,
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }
    tracing::debug!(pool, worker = index, "Worker stopped");
}
