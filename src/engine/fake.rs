//! A scriptable in-memory OCR engine, for tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use super::{OcrEngine, OcrWorker};
use crate::{pages::Page, prelude::*};

/// Counters describing everything a [`FakeEngine`] has done.
#[derive(Clone, Debug, Default)]
pub struct FakeStats {
    pub created: usize,
    pub terminated: usize,
    pub submissions: usize,
    pub created_languages: Vec<String>,
    pub submissions_by_language: Vec<String>,
}

impl FakeStats {
    /// Workers created but not yet terminated.
    pub fn live(&self) -> usize {
        self.created - self.terminated
    }
}

#[derive(Default)]
struct FakeState {
    stats: FakeStats,
    results: VecDeque<Result<String, String>>,
}

/// An engine whose workers return scripted results.
#[derive(Clone)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
    default_result: Result<String, String>,
    fail_init_for: Option<String>,
    fail_terminate_for: Option<String>,
    recognize_delay: Option<Duration>,
    create_delay: Option<(String, Duration)>,
}

impl FakeEngine {
    /// Create an engine whose workers succeed with an empty string.
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            default_result: Ok(String::new()),
            fail_init_for: None,
            fail_terminate_for: None,
            recognize_delay: None,
            create_delay: None,
        }
    }

    /// Results to return, in order, before falling back to the default.
    pub fn with_results(self, results: Vec<Result<String, String>>) -> Self {
        self.state.lock().unwrap().results = results.into();
        self
    }

    /// Succeed with `text` once scripted results run out.
    pub fn with_default_text(mut self, text: &str) -> Self {
        self.default_result = Ok(text.to_owned());
        self
    }

    /// Fail with `message` once scripted results run out.
    pub fn with_default_error(mut self, message: &str) -> Self {
        self.default_result = Err(message.to_owned());
        self
    }

    /// Refuse to create workers for `language`.
    pub fn failing_init_for(mut self, language: &str) -> Self {
        self.fail_init_for = Some(language.to_owned());
        self
    }

    /// Fail to terminate workers for `language`. They still count as
    /// terminated, because termination was attempted.
    pub fn failing_terminate_for(mut self, language: &str) -> Self {
        self.fail_terminate_for = Some(language.to_owned());
        self
    }

    /// Sleep this long in every `recognize` call.
    pub fn with_recognize_delay(mut self, delay: Duration) -> Self {
        self.recognize_delay = Some(delay);
        self
    }

    /// Sleep this long before creating a worker for `language`.
    pub fn with_create_delay(mut self, language: &str, delay: Duration) -> Self {
        self.create_delay = Some((language.to_owned(), delay));
        self
    }

    /// A snapshot of our counters.
    pub fn stats(&self) -> FakeStats {
        self.state.lock().unwrap().stats.clone()
    }
}

#[async_trait]
impl OcrEngine for FakeEngine {
    async fn create_worker(&self, language: &str) -> Result<Arc<dyn OcrWorker>> {
        if self.fail_init_for.as_deref() == Some(language) {
            return Err(anyhow!("no traineddata for {language}"));
        }
        if let Some((slow_language, delay)) = &self.create_delay {
            if slow_language == language {
                tokio::time::sleep(*delay).await;
            }
        }
        let mut state = self.state.lock().unwrap();
        state.stats.created += 1;
        state.stats.created_languages.push(language.to_owned());
        Ok(Arc::new(FakeWorker {
            language: language.to_owned(),
            engine: self.clone(),
            terminated: Mutex::new(false),
        }))
    }
}

struct FakeWorker {
    language: String,
    engine: FakeEngine,
    terminated: Mutex<bool>,
}

#[async_trait]
impl OcrWorker for FakeWorker {
    fn language(&self) -> &str {
        &self.language
    }

    async fn recognize(&self, _page: &Page) -> Result<String> {
        if *self.terminated.lock().unwrap() {
            return Err(anyhow!("worker has been terminated"));
        }
        let result = {
            let mut state = self.engine.state.lock().unwrap();
            state.stats.submissions += 1;
            state
                .stats
                .submissions_by_language
                .push(self.language.clone());
            state
                .results
                .pop_front()
                .unwrap_or_else(|| self.engine.default_result.clone())
        };
        if let Some(delay) = self.engine.recognize_delay {
            tokio::time::sleep(delay).await;
        }
        result.map_err(|msg| anyhow!(msg))
    }

    async fn terminate(&self) -> Result<()> {
        let mut terminated = self.terminated.lock().unwrap();
        if *terminated {
            return Ok(());
        }
        *terminated = true;
        self.engine.state.lock().unwrap().stats.terminated += 1;
        if self.engine.fail_terminate_for.as_deref() == Some(self.language.as_str()) {
            return Err(anyhow!("engine refused to shut down"));
        }
        Ok(())
    }
}
