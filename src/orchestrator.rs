//! The OCR orchestrator: preprocessing, worker pool lifecycle, and retries.

use std::{borrow::Cow, sync::Arc, time::Duration};

use crate::{
    engine::OcrEngine,
    error::{CleanupError, OcrError},
    log_sink::{LogSink, TracingLogSink},
    pages::Page,
    pool::WorkerPool,
    prelude::*,
    preprocess::{PreprocessOptions, Preprocessor},
    retry::{
        Attempt, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, Delay, RetryPolicy, TokioDelay,
        run_job,
    },
};

/// Separator between pages when page breaks are requested.
const PAGE_BREAK: &str = "\n\x0C\n";

/// Separator between pages otherwise.
const PAGE_SEPARATOR: &str = "\n\n";

/// Per-request configuration.
#[derive(Clone)]
pub struct OcrConfig {
    /// Filters to run before OCR. `None` disables preprocessing.
    pub preprocess: Option<PreprocessOptions>,

    /// Attempts per page, including the first. Must be at least 1.
    pub max_attempts: i64,

    /// Delay between attempts.
    pub retry_delay: Duration,

    /// Give up on acquiring workers and recognizing text after this long.
    /// Workers are still released afterwards.
    pub timeout: Option<Duration>,

    /// Separate pages with a form feed instead of a blank line.
    pub include_page_breaks: bool,

    /// Where to send human-readable progress lines.
    pub log: Arc<dyn LogSink>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            preprocess: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: None,
            include_page_breaks: false,
            log: Arc::new(TracingLogSink),
        }
    }
}

/// A single OCR request.
#[derive(Clone)]
pub struct OcrRequest {
    /// Page images, in order.
    pub pages: Vec<Page>,

    /// Languages to start workers for, in order.
    pub languages: Vec<String>,

    /// How to process this request.
    pub config: OcrConfig,
}

/// What happened to an [`OcrRequest`].
#[derive(Debug)]
pub struct OcrOutcome {
    /// The text of every page, or the error which stopped us.
    pub result: Result<String, OcrError>,

    /// Recognition attempts which failed, including ones we later recovered
    /// from.
    pub failed_attempts: Vec<Attempt>,

    /// Workers which could not be terminated cleanly. These never affect
    /// `result`.
    pub cleanup_errors: Vec<CleanupError>,
}

impl OcrOutcome {
    /// An outcome for a request which failed before acquiring anything.
    fn early_failure(err: OcrError) -> Self {
        Self {
            result: Err(err),
            failed_attempts: vec![],
            cleanup_errors: vec![],
        }
    }
}

/// Runs [`OcrRequest`]s against an engine.
///
/// Each request gets its own worker pool, so one orchestrator may run any
/// number of requests concurrently.
#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<dyn OcrEngine>,
    preprocessor: Arc<dyn Preprocessor>,
    delay: Arc<dyn Delay>,
}

impl Orchestrator {
    /// Create an orchestrator which waits between retries using the Tokio
    /// timer.
    pub fn new(engine: Arc<dyn OcrEngine>, preprocessor: Arc<dyn Preprocessor>) -> Self {
        Self {
            engine,
            preprocessor,
            delay: Arc::new(TokioDelay),
        }
    }

    /// Replace how we wait between retries.
    #[cfg(test)]
    pub fn with_delay(mut self, delay: Arc<dyn Delay>) -> Self {
        self.delay = delay;
        self
    }

    /// OCR every page in `request`.
    ///
    /// Workers are always released before this returns, whether we succeed,
    /// fail, or time out.
    #[instrument(level = "debug", skip_all, fields(
        languages = ?request.languages,
        pages = request.pages.len(),
    ))]
    pub async fn recognize(&self, request: &OcrRequest) -> OcrOutcome {
        let config = &request.config;
        let log = &config.log;

        let policy = match validate(request) {
            Ok(policy) => policy,
            Err(err) => return OcrOutcome::early_failure(err),
        };

        let pages = match self.preprocess(request).await {
            Ok(pages) => pages,
            Err(err) => return OcrOutcome::early_failure(err),
        };

        // Everything from here on may create workers, so the pool must be
        // released no matter how we leave this block.
        let mut pool = WorkerPool::new();
        let mut failed_attempts = vec![];
        let work = self.acquire_and_run(request, &mut pool, &pages, &policy, &mut failed_attempts);
        let (result, mut cleanup_errors) = match config.timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(done) => done,
                Err(_elapsed) => {
                    log.log(&format!("OCR timed out after {limit:?}"));
                    (Err(OcrError::Timeout(limit)), vec![])
                }
            },
            None => work.await,
        };
        cleanup_errors.extend(pool.release(log).await);

        match &result {
            Ok(text) => log.log(&format!(
                "OCR finished: {} characters from {} page(s)",
                text.chars().count(),
                pages.len()
            )),
            Err(err) => log.log(&format!("OCR failed: {err}")),
        }
        OcrOutcome {
            result,
            failed_attempts,
            cleanup_errors,
        }
    }

    /// Run the preprocessor over every page, if requested.
    async fn preprocess<'req>(
        &self,
        request: &'req OcrRequest,
    ) -> Result<Cow<'req, [Page]>, OcrError> {
        let options = match &request.config.preprocess {
            Some(options) if !options.is_empty() => options,
            _ => return Ok(Cow::Borrowed(&request.pages)),
        };
        request.config.log.log("Preprocessing image");
        let mut pages = Vec::with_capacity(request.pages.len());
        for page in &request.pages {
            let page = self
                .preprocessor
                .preprocess(page, options)
                .await
                .map_err(|source| OcrError::Preprocessing { source })?;
            pages.push(page);
        }
        Ok(Cow::Owned(pages))
    }

    /// Start our workers, and recognize each page in turn.
    ///
    /// Returns any cleanup errors from a failed acquisition, which will have
    /// already released the pool.
    async fn acquire_and_run(
        &self,
        request: &OcrRequest,
        pool: &mut WorkerPool,
        pages: &[Page],
        policy: &RetryPolicy,
        failed_attempts: &mut Vec<Attempt>,
    ) -> (Result<String, OcrError>, Vec<CleanupError>) {
        let log = &request.config.log;
        if let Err((err, cleanup_errors)) =
            pool.acquire(&*self.engine, &request.languages, log).await
        {
            return (Err(err), cleanup_errors);
        }

        let mut texts = Vec::with_capacity(pages.len());
        for (idx, page) in pages.iter().enumerate() {
            if pages.len() > 1 {
                log.log(&format!("Recognizing page {}/{}", idx + 1, pages.len()));
            }
            let report = run_job(pool.scheduler(), page, policy, &self.delay, log).await;
            failed_attempts.extend(report.failed_attempts);
            match report.result {
                Ok(text) => texts.push(text),
                Err(err) => return (Err(err), vec![]),
            }
        }

        let separator = if request.config.include_page_breaks {
            PAGE_BREAK
        } else {
            PAGE_SEPARATOR
        };
        (Ok(texts.join(separator)), vec![])
    }
}

/// Check a request before we acquire anything.
fn validate(request: &OcrRequest) -> Result<RetryPolicy, OcrError> {
    if request.languages.is_empty() {
        return Err(OcrError::Configuration(
            "at least one language is required".to_owned(),
        ));
    }
    if let Some(blank) = request.languages.iter().position(|l| l.trim().is_empty()) {
        return Err(OcrError::Configuration(format!(
            "language #{} is blank",
            blank + 1
        )));
    }
    if request.pages.is_empty() {
        return Err(OcrError::Configuration("there are no pages to OCR".to_owned()));
    }
    RetryPolicy::new(request.config.max_attempts, request.config.retry_delay)
}
