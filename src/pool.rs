//! Worker pool lifecycle: one worker per language, always torn down.

use std::sync::Arc;

use crate::{
    engine::{OcrEngine, OcrWorker, Scheduler},
    error::{CleanupError, OcrError},
    log_sink::LogSink,
    prelude::*,
};

/// The workers for a single OCR request, plus the scheduler they're
/// registered with.
///
/// The pool owns its workers. Anything added to the pool will be terminated
/// by [`WorkerPool::release`], so callers should create the pool first and
/// then acquire workers into it. That way, even if acquisition is cancelled
/// part way through, every worker that was started is still reachable.
pub struct WorkerPool {
    scheduler: Scheduler,
    workers: Vec<Arc<dyn OcrWorker>>,
}

impl WorkerPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            scheduler: Scheduler::new(),
            workers: vec![],
        }
    }

    /// The scheduler for this pool's workers.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// How many workers have been started and not yet released?
    #[cfg(test)]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Start one worker per language, in order, registering each with our
    /// scheduler as soon as it exists.
    ///
    /// If any worker fails to start, the workers which did start are released
    /// before the error is returned. Their cleanup errors, if any, are
    /// returned alongside the initialization error.
    #[instrument(level = "debug", skip_all, fields(languages = ?languages))]
    pub async fn acquire(
        &mut self,
        engine: &dyn OcrEngine,
        languages: &[String],
        log: &Arc<dyn LogSink>,
    ) -> Result<(), (OcrError, Vec<CleanupError>)> {
        let total = languages.len();
        for (idx, language) in languages.iter().enumerate() {
            log.log(&format!("Starting OCR worker for {language}"));
            match engine.create_worker(language).await {
                Ok(worker) => {
                    self.scheduler.add_worker(&worker);
                    self.workers.push(worker);
                    log.worker_ready(language, idx + 1, total);
                }
                Err(source) => {
                    log.log(&format!(
                        "Could not start OCR worker for {language}: {source:#}"
                    ));
                    let cleanup_errors = self.release(log).await;
                    return Err((
                        OcrError::Initialization {
                            language: language.clone(),
                            source,
                        },
                        cleanup_errors,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Terminate every worker. Failures are logged and collected, but never
    /// stop us from terminating the remaining workers.
    ///
    /// The pool is empty afterwards, so releasing twice is harmless.
    #[instrument(level = "debug", skip_all, fields(workers = self.workers.len()))]
    pub async fn release(&mut self, log: &Arc<dyn LogSink>) -> Vec<CleanupError> {
        let mut cleanup_errors = vec![];
        // Remove workers one at a time, so that anything we haven't reached
        // yet stays in the pool.
        while !self.workers.is_empty() {
            let worker = self.workers.remove(0);
            let language = worker.language().to_owned();
            match worker.terminate().await {
                Ok(()) => debug!(language = %language, "Terminated OCR worker"),
                Err(err) => {
                    let cleanup_error = CleanupError::new(&language, &err);
                    warn!("{}", cleanup_error);
                    log.log(&cleanup_error.to_string());
                    cleanup_errors.push(cleanup_error);
                }
            }
        }
        cleanup_errors
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            // We can't terminate asynchronously from `drop`. This means a
            // caller forgot to call `release`.
            error!(
                workers = self.workers.len(),
                "OCR worker pool dropped without being released"
            );
        }
    }
}
