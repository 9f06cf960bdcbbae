//! Per-key ordered task execution.
//!
//! Every key owns a queue drained by one worker task. Jobs for the same key
//! run one at a time in submission order; a failed or panicking job does not
//! stop the ones behind it. Jobs for different keys share nothing and may
//! interleave freely.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::TransferError;

type JobResult = Result<(), TransferError>;

struct Job {
    task: BoxFuture<'static, JobResult>,
    done: oneshot::Sender<JobResult>,
}

type Queues = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>>;

/// Runs submitted futures strictly in order per key.
#[derive(Clone, Default)]
pub struct Sequencer {
    queues: Queues,
}

/// Resolves once a submitted job has run.
pub struct Completion {
    rx: oneshot::Receiver<JobResult>,
}

impl Completion {
    /// Waits for the job and returns its outcome.
    pub async fn wait(self) -> JobResult {
        self.rx
            .await
            .unwrap_or_else(|_| Err(TransferError::TaskAborted("sequencer dropped job".into())))
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(queues: &Queues) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Job>>> {
        queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedules `task` after every job previously submitted under `key`.
    pub fn submit<F>(&self, key: &str, task: F) -> Completion
    where
        F: Future<Output = JobResult> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let mut job = Job {
            task: Box::pin(task),
            done,
        };

        let mut queues = Self::lock(&self.queues);
        if let Some(tx) = queues.get(key) {
            match tx.send(job) {
                Ok(()) => return Completion { rx },
                // Worker is gone; start a fresh queue below.
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let (tx, queue) = mpsc::unbounded_channel();
        // Cannot fail: `queue` is alive.
        let _ = tx.send(job);
        queues.insert(key.to_string(), tx);
        drop(queues);

        trace!(key = %key, "sequencer queue started");
        tokio::spawn(run_queue(key.to_string(), queue, Arc::clone(&self.queues)));
        Completion { rx }
    }

    /// Number of keys with queued or running work.
    #[cfg(test)]
    fn active_keys(&self) -> usize {
        Self::lock(&self.queues).len()
    }
}

async fn run_queue(key: String, mut queue: mpsc::UnboundedReceiver<Job>, queues: Queues) {
    loop {
        let job = match queue.try_recv() {
            Ok(job) => job,
            Err(_) => match retire(&key, &mut queue, &queues) {
                Some(job) => job,
                None => break,
            },
        };

        // Spawned so a panic surfaces as a JoinError instead of killing the queue.
        let result = match tokio::spawn(job.task).await {
            Ok(result) => result,
            Err(e) => Err(TransferError::TaskAborted(e.to_string())),
        };
        if let Err(e) = &result {
            warn!(transfer = %key, error = %e, "sequenced task failed");
        }
        let _ = job.done.send(result);
    }
    trace!(key = %key, "sequencer queue drained");
}

/// Removes `key`'s queue once it is empty.
///
/// Submissions happen under the same lock, so a job is either seen here or
/// lands in a fresh queue.
fn retire(key: &str, queue: &mut mpsc::UnboundedReceiver<Job>, queues: &Queues) -> Option<Job> {
    let mut map = Sequencer::lock(queues);
    match queue.try_recv() {
        Ok(job) => Some(job),
        Err(_) => {
            map.remove(key);
            None
        }
    }
}
