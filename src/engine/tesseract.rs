//! Tesseract OCR engine.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use clap::Args;
use tempfile::TempDir;
use tokio::{process::Command, sync::OnceCell};

use super::{OcrEngine, OcrWorker};
use crate::{
    async_utils::check_for_command_failure,
    cpu_limit::with_cpu_semaphore,
    pages::Page,
    prelude::*,
};

/// Options for the `tesseract` CLI.
#[derive(Args, Clone, Debug)]
pub struct TesseractOpts {
    /// The `tesseract` executable to run.
    #[clap(long, value_name = "PATH", default_value = "tesseract")]
    pub tesseract_path: PathBuf,

    /// Tesseract page segmentation mode (0-13). Defaults to Tesseract's own
    /// default.
    #[clap(long, value_parser = clap::value_parser!(u8).range(0..=13))]
    pub psm: Option<u8>,

    /// Tesseract OCR engine mode (0-3). Defaults to Tesseract's own default.
    #[clap(long, value_parser = clap::value_parser!(u8).range(0..=3))]
    pub oem: Option<u8>,
}

impl Default for TesseractOpts {
    fn default() -> Self {
        Self {
            tesseract_path: PathBuf::from("tesseract"),
            psm: None,
            oem: None,
        }
    }
}

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractOcrEngine {
    opts: TesseractOpts,

    /// Languages reported by `tesseract --list-langs`, looked up on first use.
    installed_languages: OnceCell<Vec<String>>,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine.
    pub fn new(opts: TesseractOpts) -> Self {
        Self {
            opts,
            installed_languages: OnceCell::new(),
        }
    }

    /// Get the list of languages `tesseract` has traineddata for.
    async fn installed_languages(&self) -> Result<&[String]> {
        let langs = self
            .installed_languages
            .get_or_try_init(|| async {
                let output = Command::new(&self.opts.tesseract_path)
                    .arg("--list-langs")
                    .output()
                    .await
                    .context("cannot run tesseract (is it installed?)")?;
                check_for_command_failure("tesseract", &output, None)?;
                Ok::<_, anyhow::Error>(parse_list_langs(&String::from_utf8_lossy(
                    &output.stdout,
                )))
            })
            .await?;
        Ok(langs)
    }
}

/// Parse the output of `tesseract --list-langs`, which has a header line
/// followed by one language per line.
fn parse_list_langs(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.starts_with("List of available languages"))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Tesseract ends each page with a form feed. We add our own page breaks.
fn strip_page_end(text: &str) -> &str {
    text.trim_end_matches(|c: char| c == '\x0C' || c.is_whitespace())
}

/// Check that `language` looks like a Tesseract language code, possibly
/// combined with `+`.
fn validate_language(language: &str) -> Result<()> {
    let valid = !language.is_empty()
        && language.split('+').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(anyhow!("invalid Tesseract language code {:?}", language))
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip(self))]
    async fn create_worker(&self, language: &str) -> Result<Arc<dyn OcrWorker>> {
        validate_language(language)?;
        let installed = self.installed_languages().await?;
        for part in language.split('+') {
            if !installed.iter().any(|l| l == part) {
                return Err(anyhow!(
                    "tesseract has no traineddata for {:?} (installed: {})",
                    part,
                    installed.join(", ")
                ));
            }
        }

        // Each worker gets its own scratch directory, which lives until the
        // worker is terminated.
        let tmpdir = TempDir::with_prefix(format!("tesseract-{}-", language))
            .context("cannot create tesseract scratch directory")?;
        debug!(path = %tmpdir.path().display(), "Created tesseract worker");
        Ok(Arc::new(TesseractOcrWorker {
            language: language.to_owned(),
            opts: self.opts.clone(),
            tmpdir: Mutex::new(Some(tmpdir)),
            next_job_id: AtomicU64::new(0),
        }))
    }
}

/// A `tesseract` worker for a single language.
struct TesseractOcrWorker {
    language: String,
    opts: TesseractOpts,

    /// Our scratch directory. `None` once we've been terminated.
    tmpdir: Mutex<Option<TempDir>>,

    /// Used to give each job unique file names.
    next_job_id: AtomicU64,
}

impl TesseractOcrWorker {
    /// Path to our scratch directory, if we're still running.
    fn scratch_dir(&self) -> Result<PathBuf> {
        let tmpdir = self
            .tmpdir
            .lock()
            .map_err(|_| anyhow!("tesseract worker lock poisoned"))?;
        tmpdir
            .as_ref()
            .map(|dir| dir.path().to_owned())
            .ok_or_else(|| anyhow!("{} worker has been terminated", self.language))
    }
}

#[async_trait]
impl OcrWorker for TesseractOcrWorker {
    fn language(&self) -> &str {
        &self.language
    }

    #[instrument(level = "debug", skip_all, fields(language = %self.language))]
    async fn recognize(&self, page: &Page) -> Result<String> {
        let scratch_dir = self.scratch_dir()?;
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let input_path = scratch_dir.join(format!("job-{}.{}", job_id, page.extension()?));
        let output_base = scratch_dir.join(format!("job-{}", job_id));
        let output_path = output_base.with_extension("txt");

        tokio::fs::write(&input_path, &page.data)
            .await
            .context("cannot write tesseract input file")?;

        // If our caller times out, the child must not outlive this future.
        let mut cmd = Command::new(&self.opts.tesseract_path);
        cmd.kill_on_drop(true)
            .arg(&input_path)
            .arg(&output_base)
            .arg("-l")
            .arg(&self.language);
        if let Some(psm) = self.opts.psm {
            cmd.arg("--psm").arg(psm.to_string());
        }
        if let Some(oem) = self.opts.oem {
            cmd.arg("--oem").arg(oem.to_string());
        }
        let output = with_cpu_semaphore(move || async move {
            cmd.output().await.context("cannot run tesseract")
        })
        .await;

        // Read the result before cleaning up, but clean up either way.
        let text = match output {
            // Leptonica prints harmless "Error in ..." lines, so we only
            // trust the exit code.
            Ok(output) => match check_for_command_failure("tesseract", &output, None) {
                Ok(()) => tokio::fs::read_to_string(&output_path)
                    .await
                    .context("cannot read tesseract output file")
                    .map(|text| strip_page_end(&text).to_owned()),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };
        for path in [&input_path, &output_path] {
            if let Err(err) = tokio::fs::remove_file(path).await {
                trace!(path = %path.display(), "could not remove job file: {}", err);
            }
        }
        text
    }

    #[instrument(level = "debug", skip_all, fields(language = %self.language))]
    async fn terminate(&self) -> Result<()> {
        let tmpdir = self
            .tmpdir
            .lock()
            .map_err(|_| anyhow!("tesseract worker lock poisoned"))?
            .take();
        match tmpdir {
            Some(tmpdir) => tmpdir
                .close()
                .context("cannot remove tesseract scratch directory"),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_list_langs_output() {
        let output = "List of available languages in \"/usr/share/tesseract-ocr/5/tessdata/\" (3):\neng\nfra\nosd\n";
        assert_eq!(parse_list_langs(output), vec!["eng", "fra", "osd"]);
    }

    #[test]
    fn strips_trailing_form_feed() {
        assert_eq!(strip_page_end("Hello\nworld\n\x0C"), "Hello\nworld");
        assert_eq!(strip_page_end("  indented\n"), "  indented");
    }

    #[test]
    fn validates_language_codes() {
        assert!(validate_language("eng").is_ok());
        assert!(validate_language("chi_sim").is_ok());
        assert!(validate_language("eng+fra").is_ok());
        assert!(validate_language("").is_err());
        assert!(validate_language("eng+").is_err());
        assert!(validate_language("eng; rm -rf").is_err());
    }

    #[tokio::test]
    async fn terminated_worker_refuses_jobs() -> Result<()> {
        let worker = TesseractOcrWorker {
            language: "eng".to_owned(),
            opts: TesseractOpts::default(),
            tmpdir: Mutex::new(Some(TempDir::with_prefix("tesseract-test-")?)),
            next_job_id: AtomicU64::new(0),
        };
        let path = worker.scratch_dir()?;
        assert!(path.exists());

        worker.terminate().await?;
        assert!(!path.exists());
        // Terminating twice is harmless.
        worker.terminate().await?;

        let page = Page::new("image/png", vec![]);
        let err = worker.recognize(&page).await.unwrap_err();
        assert!(err.to_string().contains("terminated"));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_recognition_kills_tesseract() -> Result<()> {
        use std::{os::unix::fs::PermissionsExt as _, time::Duration};

        // A stand-in `tesseract` which records whether it ran to completion.
        let stub_dir = TempDir::with_prefix("tesseract-stub-")?;
        let log_path = stub_dir.path().join("stub.log");
        let stub_path = stub_dir.path().join("tesseract");
        std::fs::write(
            &stub_path,
            format!(
                "#!/bin/sh\necho started >> '{log}'\nsleep 2\necho finished >> '{log}'\n",
                log = log_path.display()
            ),
        )?;
        std::fs::set_permissions(&stub_path, std::fs::Permissions::from_mode(0o755))?;

        let worker = TesseractOcrWorker {
            language: "eng".to_owned(),
            opts: TesseractOpts {
                tesseract_path: stub_path,
                ..TesseractOpts::default()
            },
            tmpdir: Mutex::new(Some(TempDir::with_prefix("tesseract-test-")?)),
            next_job_id: AtomicU64::new(0),
        };
        let page = Page::new("image/png", vec![0]);
        let result =
            tokio::time::timeout(Duration::from_millis(500), worker.recognize(&page)).await;
        assert!(result.is_err(), "recognition should have timed out");
        worker.terminate().await?;

        tokio::time::sleep(Duration::from_secs(3)).await;
        let log = std::fs::read_to_string(&log_path).unwrap_or_default();
        assert!(log.contains("started"), "stub never ran: {log:?}");
        assert!(!log.contains("finished"), "tesseract outlived its job");
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Needs tesseract installed"]
    async fn unknown_language_fails_to_start() {
        let engine = TesseractOcrEngine::new(TesseractOpts::default());
        assert!(engine.create_worker("zzz_not_a_language").await.is_err());
    }
}
