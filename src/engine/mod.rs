//! OCR engine interface.
//!
//! An [`OcrEngine`] creates [`OcrWorker`]s, each bound to a single language.
//! Workers are stateful and must be explicitly terminated. A [`Scheduler`]
//! hands recognition jobs to whichever registered worker is free.

use std::sync::Arc;

use crate::{pages::Page, prelude::*};

pub use self::scheduler::Scheduler;

#[cfg(test)]
pub mod fake;
pub mod scheduler;
pub mod tesseract;

/// A language-bound unit of recognition capability.
#[async_trait]
pub trait OcrWorker: Send + Sync + 'static {
    /// The language this worker recognizes.
    fn language(&self) -> &str;

    /// Recognize the text in a single page image.
    async fn recognize(&self, page: &Page) -> Result<String>;

    /// Release any resources held by this worker. Calling `recognize` after
    /// this will fail. Terminating twice is harmless.
    async fn terminate(&self) -> Result<()>;
}

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Start a new worker for `language`.
    async fn create_worker(&self, language: &str) -> Result<Arc<dyn OcrWorker>>;
}
