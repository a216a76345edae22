//! Bounded worker pool with non-blocking submission.
//!
//! Submissions land in a bounded queue; a dispatcher pulls them off and runs
//! each on its own tokio task, gated by a semaphore of `max_workers`
//! permits. `try_submit` never blocks: when the queue is full the submission
//! is rejected and the caller decides what to do with it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};

type Runnable = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Outcome of a submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Accepted,
    /// Queue full; nothing was enqueued.
    Rejected,
}

pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<Runnable>>>,
    active: Arc<AtomicUsize>,
    max_workers: usize,
}

impl WorkerPool {
    /// Start the pool's dispatcher. Must be called inside a tokio runtime.
    pub fn new(max_workers: usize, queue_capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Runnable>(queue_capacity);
        let semaphore = Arc::new(Semaphore::new(max_workers));
        let active = Arc::new(AtomicUsize::new(0));

        let dispatcher_active = active.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break, // semaphore closed, pool going away
                };
                let active = dispatcher_active.clone();
                active.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    job.await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                });
            }
            debug!("worker pool dispatcher exited");
        });

        info!(max_workers, queue_capacity, "worker pool started");
        Self {
            tx: Mutex::new(Some(tx)),
            active,
            max_workers,
        }
    }

    /// Enqueue a runnable without blocking.
    pub fn try_submit<F>(&self, job: F) -> Submit
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.tx.lock().unwrap();
        let Some(tx) = tx.as_ref() else {
            return Submit::Rejected;
        };
        match tx.try_send(Box::pin(job)) {
            Ok(()) => Submit::Accepted,
            Err(_) => Submit::Rejected,
        }
    }

    /// Workers currently running a job.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Stop accepting submissions; queued jobs still run.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
        info!("worker pool closed to new submissions");
    }

    /// Wait until every in-flight job finishes, up to `timeout`. Returns
    /// whether the pool fully drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
