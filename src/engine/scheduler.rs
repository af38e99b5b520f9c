//! Dispatch recognition jobs to free workers.

use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, mpsc};

use super::OcrWorker;
use crate::{pages::Page, prelude::*};

/// Routes recognition jobs to whichever registered worker is idle.
///
/// The scheduler only holds weak references to its workers. Whoever created
/// the workers is responsible for terminating them, and once a worker has
/// been dropped, the scheduler simply stops using it.
pub struct Scheduler {
    /// Registered workers, indexed by the numbers in our idle queue.
    workers: Vec<Weak<dyn OcrWorker>>,

    /// Used to put workers back in the idle queue.
    idle_tx: mpsc::UnboundedSender<usize>,

    /// Indices of idle workers. Whoever holds the lock gets the next free
    /// worker.
    idle_rx: Mutex<mpsc::UnboundedReceiver<usize>>,
}

impl Scheduler {
    /// Create a scheduler with no workers.
    pub fn new() -> Self {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        Self {
            workers: vec![],
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
        }
    }

    /// Register a worker. It becomes available for jobs immediately.
    pub fn add_worker(&mut self, worker: &Arc<dyn OcrWorker>) {
        let idx = self.workers.len();
        self.workers.push(Arc::downgrade(worker));
        // We hold `idle_rx`, so the channel can't be closed.
        let _ = self.idle_tx.send(idx);
    }

    /// How many registered workers are still alive?
    pub fn live_worker_count(&self) -> usize {
        self.workers.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Run a recognition job on the next free worker.
    #[instrument(level = "debug", skip_all)]
    pub async fn add_job(&self, page: &Page) -> Result<String> {
        let (worker, _slot) = self.next_idle_worker().await?;
        debug!(language = worker.language(), "Dispatching recognition job");
        worker.recognize(page).await
    }

    /// Wait for an idle worker that's still alive.
    async fn next_idle_worker(&self) -> Result<(Arc<dyn OcrWorker>, IdleSlot<'_>)> {
        let mut idle_rx = self.idle_rx.lock().await;
        loop {
            if self.live_worker_count() == 0 {
                return Err(anyhow!("no OCR workers available"));
            }
            let idx = idle_rx
                .recv()
                .await
                .ok_or_else(|| anyhow!("OCR scheduler closed"))?;
            // Workers which have been released are never returned to the
            // idle queue.
            if let Some(worker) = self.workers[idx].upgrade() {
                return Ok((
                    worker,
                    IdleSlot {
                        idx,
                        idle_tx: &self.idle_tx,
                    },
                ));
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns a worker to the idle queue when dropped, even if the job that was
/// using it was cancelled.
struct IdleSlot<'a> {
    idx: usize,
    idle_tx: &'a mpsc::UnboundedSender<usize>,
}

impl Drop for IdleSlot<'_> {
    fn drop(&mut self) {
        let _ = self.idle_tx.send(self.idx);
    }
}
