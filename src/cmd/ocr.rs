//! The `ocr` subcommand.

use std::{sync::Arc, time::Duration};

use clap::Args;

use super::create_writer;
use crate::{
    engine::tesseract::{TesseractOcrEngine, TesseractOpts},
    input::{FileInputProvider, InputProvider, JsonInputProvider},
    log_sink::ProgressLogSink,
    orchestrator::{OcrConfig, OcrRequest, Orchestrator},
    output::OcrOutput,
    pages::{Page, PageOptions, split_into_pages},
    prelude::*,
    preprocess::{ImagePreprocessor, PreprocessOptions, Threshold},
    retry::DEFAULT_MAX_ATTEMPTS,
    ui::{ProgressConfig, Ui},
};

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Input file. Files ending in `.json` hold a JSON binary item (see
    /// `schema OcrInput`). Anything else is read as a raw image or PDF. If
    /// omitted, a JSON binary item is read from standard input.
    pub input_path: Option<PathBuf>,

    /// Treat the input as a raw image or PDF, even when it's JSON or
    /// standard input.
    #[clap(long)]
    pub raw: bool,

    /// Language to recognize. May be repeated, or joined with `+`. Each
    /// language gets its own OCR worker.
    #[clap(
        short = 'l',
        long = "lang",
        value_name = "LANG",
        default_value = "eng",
        value_delimiter = '+'
    )]
    pub languages: Vec<String>,

    /// Preprocessing options.
    #[clap(flatten)]
    pub preprocess: PreprocessArgs,

    /// Attempts per page, including the first.
    #[clap(long, default_value_t = DEFAULT_MAX_ATTEMPTS, allow_negative_numbers = true)]
    pub max_attempts: i64,

    /// Milliseconds to wait between attempts.
    #[clap(long, value_name = "MS", default_value = "1000")]
    pub retry_delay_ms: u64,

    /// Give up after this many seconds. Workers are still shut down.
    #[clap(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Separate pages with a form feed instead of a blank line.
    #[clap(long)]
    pub include_page_breaks: bool,

    /// PDF options.
    #[clap(flatten)]
    pub page_opts: PageOptions,

    /// Tesseract options.
    #[clap(flatten)]
    pub tesseract_opts: TesseractOpts,

    /// Output location, if not stdout.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

impl OcrOpts {
    /// Pick an input provider based on our options.
    fn input_provider(&self) -> Box<dyn InputProvider> {
        let is_json = match &self.input_path {
            Some(path) => path.extension().is_some_and(|ext| ext == "json"),
            None => true,
        };
        if is_json && !self.raw {
            Box::new(JsonInputProvider::new(self.input_path.clone()))
        } else {
            Box::new(FileInputProvider::new(self.input_path.clone()))
        }
    }

    /// Our languages, with surrounding whitespace removed.
    fn languages(&self) -> Vec<String> {
        self.languages.iter().map(|l| l.trim().to_owned()).collect()
    }
}

/// Image preprocessing arguments.
#[derive(Args, Clone, Debug, Default)]
pub struct PreprocessArgs {
    /// Preprocess images before OCR. On its own, this applies grayscale,
    /// normalize, sharpen and denoise. Any other preprocessing flag also
    /// enables preprocessing, using only the filters given.
    #[clap(long)]
    pub preprocess: bool,

    /// Convert to grayscale.
    #[clap(long)]
    pub grayscale: bool,

    /// Equalize the image histogram.
    #[clap(long)]
    pub normalize: bool,

    /// Binarize the image. Give a level as `--threshold=LEVEL`, or omit it
    /// to pick one automatically.
    #[clap(long, value_name = "LEVEL", require_equals = true)]
    pub threshold: Option<Option<u8>>,

    /// Scale to this width, keeping the aspect ratio.
    #[clap(long, value_name = "WIDTH")]
    pub resize_width: Option<u32>,

    /// Apply an unsharp mask.
    #[clap(long)]
    pub sharpen: bool,

    /// Adjust contrast. Negative values reduce contrast.
    #[clap(long, allow_negative_numbers = true)]
    pub contrast: Option<f32>,

    /// Adjust brightness. Negative values darken.
    #[clap(long, allow_negative_numbers = true)]
    pub brightness: Option<i32>,

    /// Remove speckle noise with a median filter.
    #[clap(long)]
    pub denoise: bool,
}

impl PreprocessArgs {
    /// Convert to [`PreprocessOptions`]. Returns `None` if preprocessing is
    /// off.
    pub fn to_options(&self) -> Option<PreprocessOptions> {
        let options = PreprocessOptions {
            resize_width: self.resize_width,
            grayscale: self.grayscale,
            contrast: self.contrast,
            brightness: self.brightness,
            normalize: self.normalize,
            denoise: self.denoise,
            sharpen: self.sharpen,
            threshold: self
                .threshold
                .map(|level| level.map_or(Threshold::Otsu, Threshold::Fixed)),
        };
        if !options.is_empty() {
            Some(options)
        } else if self.preprocess {
            Some(PreprocessOptions::recommended())
        } else {
            None
        }
    }
}

/// Fetch our input and split it into pages.
async fn load_pages(provider: &dyn InputProvider, page_opts: &PageOptions) -> Result<Vec<Page>> {
    let document = provider.fetch().await?;
    split_into_pages(document, page_opts).await
}

/// The `ocr` subcommand.
///
/// OCR failures are reported in the output record, not as an error. We only
/// fail if we can't write that record.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let languages = opts.languages();

    let output = match load_pages(opts.input_provider().as_ref(), &opts.page_opts).await {
        Ok(pages) => {
            let pb = ui.new_progress_bar(
                &ProgressConfig {
                    emoji: "🔠",
                    msg: "Starting OCR workers",
                    done_msg: "Started OCR workers",
                },
                languages.len() as u64,
            );
            let page_count = pages.len();
            let request = OcrRequest {
                pages,
                languages: languages.clone(),
                config: OcrConfig {
                    preprocess: opts.preprocess.to_options(),
                    max_attempts: opts.max_attempts,
                    retry_delay: Duration::from_millis(opts.retry_delay_ms),
                    timeout: opts.timeout.map(Duration::from_secs),
                    include_page_breaks: opts.include_page_breaks,
                    log: Arc::new(ProgressLogSink::new(pb.clone())),
                },
            };
            let orchestrator = Orchestrator::new(
                Arc::new(TesseractOcrEngine::new(opts.tesseract_opts.clone())),
                Arc::new(ImagePreprocessor),
            );
            let outcome = orchestrator.recognize(&request).await;
            if !pb.is_finished() {
                pb.abandon_with_message("Could not start OCR workers");
            }
            OcrOutput::from_outcome(outcome, &languages, page_count)
        }
        Err(err) => {
            error!("Could not read input: {:#}", err);
            OcrOutput::from_anyhow(&err, &languages)
        }
    };

    if let Some(err) = &output.error {
        warn!("OCR failed: {}", err);
    }
    let wtr = create_writer(opts.output_path.as_deref()).await?;
    output.write(wtr).await
}
