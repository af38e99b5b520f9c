//! Where OCR input comes from.
//!
//! The host hands us a single binary item. It usually arrives as a small JSON
//! record with Base64 data, but we can also read a raw image or PDF.

use schemars::JsonSchema;
use tokio::io::AsyncReadExt as _;

use crate::{
    data_url::{decode_base64, is_data_url, parse_data_url},
    pages::{Page, is_supported_mime_type},
    prelude::*,
};

/// Generic binary type which tells us nothing.
const OCTET_STREAM: &str = "application/octet-stream";

/// A binary item supplied by the host, as JSON.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct OcrInput {
    /// The document, as Base64 or as a Base64 `data:` URL.
    pub data: String,

    /// The MIME type of the document, if known.
    #[serde(default)]
    pub mime_type: Option<String>,

    /// The original file name, used to guess the MIME type if all else fails.
    #[serde(default)]
    pub file_name: Option<String>,
}

impl OcrInput {
    /// Decode our data and work out what it is.
    pub fn into_document(self) -> Result<Page> {
        let (embedded_mime_type, data) = if is_data_url(&self.data) {
            parse_data_url(&self.data)?
        } else {
            (None, decode_base64(&self.data)?)
        };
        let mime_type = resolve_mime_type(
            &[self.mime_type.as_deref(), embedded_mime_type.as_deref()],
            &data,
            self.file_name.as_deref().map(Path::new),
        )?;
        Ok(Page::new(mime_type, data))
    }
}

/// Interface to an input source.
#[async_trait]
pub trait InputProvider: Send + Sync {
    /// Fetch the document to OCR. This may be an image or a PDF.
    async fn fetch(&self) -> Result<Page>;
}

/// Reads an [`OcrInput`] JSON record from a file or standard input.
pub struct JsonInputProvider {
    path: Option<PathBuf>,
}

impl JsonInputProvider {
    /// Read from `path`, or standard input if `None`.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl InputProvider for JsonInputProvider {
    #[instrument(level = "debug", skip(self), fields(path = ?self.path))]
    async fn fetch(&self) -> Result<Page> {
        let bytes = read_all(self.path.as_deref()).await?;
        let input = serde_json::from_slice::<OcrInput>(&bytes).with_context(|| {
            format!(
                "cannot parse JSON input from {}",
                describe(self.path.as_deref())
            )
        })?;
        input.into_document()
    }
}

/// Reads a raw image or PDF from a file or standard input.
pub struct FileInputProvider {
    path: Option<PathBuf>,
}

impl FileInputProvider {
    /// Read from `path`, or standard input if `None`.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl InputProvider for FileInputProvider {
    #[instrument(level = "debug", skip(self), fields(path = ?self.path))]
    async fn fetch(&self) -> Result<Page> {
        let data = read_all(self.path.as_deref()).await?;
        let mime_type = resolve_mime_type(&[], &data, self.path.as_deref())?;
        Ok(Page::new(mime_type, data))
    }
}

/// Human-readable name of an input.
fn describe(path: Option<&Path>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "standard input".to_owned(),
    }
}

/// Read all of `path`, or all of standard input.
async fn read_all(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display())),
        None => {
            let mut data = vec![];
            tokio::io::stdin()
                .read_to_end(&mut data)
                .await
                .context("cannot read standard input")?;
            Ok(data)
        }
    }
}

/// Clean up a MIME type, discarding parameters and uninformative values.
fn normalize_mime_type(mime_type: &str) -> Option<String> {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "" | OCTET_STREAM => None,
        "image/jpg" => Some("image/jpeg".to_owned()),
        "image/x-ms-bmp" => Some("image/bmp".to_owned()),
        _ => Some(essence),
    }
}

/// Work out the MIME type of `data`.
///
/// We trust declared types first (in order), then the file contents, then the
/// file name. The winner must be a type we support.
pub fn resolve_mime_type(
    declared: &[Option<&str>],
    data: &[u8],
    file_name: Option<&Path>,
) -> Result<String> {
    let mime_type = declared
        .iter()
        .flatten()
        .find_map(|m| normalize_mime_type(m))
        .or_else(|| infer::get(data).and_then(|kind| normalize_mime_type(kind.mime_type())))
        .or_else(|| {
            file_name
                .and_then(|name| mime_guess::from_path(name).first_raw())
                .and_then(normalize_mime_type)
        })
        .ok_or_else(|| anyhow!("cannot determine the MIME type of the input"))?;
    if is_supported_mime_type(&mime_type) {
        debug!(%mime_type, "Resolved input MIME type");
        Ok(mime_type)
    } else {
        Err(anyhow!("unsupported MIME type {:?}", mime_type))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    /// The first bytes of a PNG file, which is all `infer` needs.
    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn declared_type_wins() {
        let mime = resolve_mime_type(&[Some("image/webp")], PNG_MAGIC, None).unwrap();
        assert_eq!(mime, "image/webp");
    }

    #[test]
    fn falls_back_to_content_then_file_name() {
        let mime = resolve_mime_type(&[None, Some(OCTET_STREAM)], PNG_MAGIC, None).unwrap();
        assert_eq!(mime, "image/png");

        let mime =
            resolve_mime_type(&[], b"????", Some(Path::new("scan.JPG"))).unwrap();
        assert_eq!(mime, "image/jpeg");
    }

    #[test]
    fn rejects_unknown_and_unsupported_types() {
        assert!(resolve_mime_type(&[], b"????", None).is_err());
        let err = resolve_mime_type(&[Some("text/plain")], b"hello", None).unwrap_err();
        assert!(err.to_string().contains("unsupported MIME type"));
    }

    #[test]
    fn decodes_json_input_with_data_url() {
        let input = serde_json::from_str::<OcrInput>(
            r#"{"data": "data:image/png;base64,iVBORw0KGgo=", "file_name": "x.bin"}"#,
        )
        .unwrap();
        let page = input.into_document().unwrap();
        assert_eq!(page.mime_type, "image/png");
        assert_eq!(&page.data[..4], b"\x89PNG");
    }

    #[test]
    fn json_input_rejects_unknown_fields() {
        assert!(serde_json::from_str::<OcrInput>(r#"{"data": "", "path": "x"}"#).is_err());
    }

    #[tokio::test]
    async fn reads_json_and_raw_files() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let json_path = dir.path().join("input.json");
        std::fs::write(
            &json_path,
            r#"{"data": "iVBORw0KGgo=", "mime_type": "image/png"}"#,
        )?;
        let page = JsonInputProvider::new(Some(json_path)).fetch().await?;
        assert_eq!(page.mime_type, "image/png");

        let raw_path = dir.path().join("scan.png");
        std::fs::File::create(&raw_path)?.write_all(PNG_MAGIC)?;
        let page = FileInputProvider::new(Some(raw_path)).fetch().await?;
        assert_eq!(page.mime_type, "image/png");
        assert_eq!(page.data, PNG_MAGIC);
        Ok(())
    }
}
