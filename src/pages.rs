//! Split input documents into page images.
//!
//! Images are passed through as a single page. PDFs are rasterized to one PNG
//! per page using Poppler's `pdftocairo` CLI tool, because OCR engines only
//! understand images.

use clap::Args;
use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore, prelude::*,
};

/// Image types we can OCR as-is.
pub const SUPPORTED_IMAGE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/gif",
    "image/tiff",
    "image/bmp",
];

/// PDF MIME type, which we rasterize.
pub const PDF_MIME_TYPE: &str = "application/pdf";

/// Is this a MIME type we know how to handle?
pub fn is_supported_mime_type(mime_type: &str) -> bool {
    mime_type == PDF_MIME_TYPE || SUPPORTED_IMAGE_TYPES.contains(&mime_type)
}

/// Does this `pdftocairo` output line contain an error?
///
/// Poppler complains loudly about minor xref damage that it repairs on its
/// own, so we downgrade those to warnings.
fn is_error_line(line: &str) -> bool {
    let line = line.to_ascii_lowercase();
    line.contains("error") && !line.contains("error: xref num")
}

/// An image (or, before splitting, a whole document) plus its MIME type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    /// The MIME type of our data.
    pub mime_type: String,
    /// The raw bytes.
    pub data: Vec<u8>,
}

impl Page {
    /// Create a new page.
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Is this a PDF?
    pub fn is_pdf(&self) -> bool {
        self.mime_type == PDF_MIME_TYPE
    }

    /// A file extension suitable for our MIME type.
    pub fn extension(&self) -> Result<&'static str> {
        mime_guess::get_mime_extensions_str(&self.mime_type)
            .and_then(|exts| {
                // Prefer the common extensions where `mime_guess` lists
                // several.
                ["png", "jpg", "tiff", "pdf"]
                    .into_iter()
                    .find(|ext| exts.contains(ext))
                    .or_else(|| exts.first().copied())
            })
            .ok_or_else(|| anyhow!("cannot determine extension for {}", self.mime_type))
    }
}

/// Options for splitting documents into pages.
#[derive(Args, Clone, Debug)]
pub struct PageOptions {
    /// The DPI to use when rasterizing PDFs.
    #[clap(long, default_value = "300")]
    pub rasterize_dpi: u32,

    /// Only OCR the first N pages of a PDF.
    #[clap(long)]
    pub max_pages: Option<usize>,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            rasterize_dpi: 300,
            max_pages: None,
        }
    }
}

/// Split a document into pages.
#[instrument(level = "debug", skip_all, fields(mime_type = %document.mime_type))]
pub async fn split_into_pages(document: Page, options: &PageOptions) -> Result<Vec<Page>> {
    if document.is_pdf() {
        rasterize_pdf(&document.data, options).await
    } else if SUPPORTED_IMAGE_TYPES.contains(&document.mime_type.as_str()) {
        Ok(vec![document])
    } else {
        Err(anyhow!("unsupported MIME type {:?}", document.mime_type))
    }
}

/// Rasterize a PDF to one PNG per page.
#[instrument(level = "debug", skip_all, fields(dpi = options.rasterize_dpi))]
async fn rasterize_pdf(data: &[u8], options: &PageOptions) -> Result<Vec<Page>> {
    if options.max_pages == Some(0) {
        return Err(anyhow!("--max-pages must be at least 1"));
    }

    // Write our PDF to a temporary directory, next to the output pages.
    let tmpdir = tempfile::TempDir::with_prefix("pages")?;
    let input_path = tmpdir.path().join("input.pdf");
    tokio::fs::write(&input_path, data)
        .await
        .context("cannot write PDF to temporary file")?;
    let out_dir = tmpdir.path().join("pages");
    tokio::fs::create_dir(&out_dir)
        .await
        .context("cannot create page directory")?;

    // Run pdftocairo to convert the PDF to PNG files. pdftocairo will add
    // digits to the output name for each page.
    //
    // We use `with_cpu_semaphore` because `pdftocairo` will use _at least_
    // 100% of a CPU.
    let mut cmd = Command::new("pdftocairo");
    cmd.kill_on_drop(true)
        .arg("-png")
        .arg("-r")
        .arg(options.rasterize_dpi.to_string());
    if let Some(max_pages) = options.max_pages {
        cmd.arg("-l").arg(max_pages.to_string());
    }
    cmd.arg(&input_path).arg(out_dir.join("page"));
    let output = with_cpu_semaphore(move || async move {
        cmd.output().await.context("failed to run pdftocairo")
    })
    .await?;
    check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

    // Page numbers are zero-padded, so sorting by name sorts by page.
    let mut paths = vec![];
    let mut entries = tokio::fs::read_dir(&out_dir)
        .await
        .context("failed to read page directory")?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .context("failed to read page directory entry")?
    {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "png") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut pages = Vec::with_capacity(paths.len());
    for path in paths {
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read page {:?}", path.display()))?;
        pages.push(Page::new("image/png", data));
    }
    if pages.is_empty() {
        return Err(anyhow!("pdftocairo produced no pages"));
    }
    debug!(page_count = pages.len(), "Rasterized PDF");
    Ok(pages)
}
