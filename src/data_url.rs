//! Decoding Base64 payloads and `data:` URLs.

use std::sync::LazyLock;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use regex::Regex;

use crate::prelude::*;

/// Regex for parsing a `data:` URL. We only accept Base64-encoded data, and
/// ignore any parameters between the MIME type and `;base64`.
static DATA_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^data:(?P<mime_type>[^;,]*)(?:;[^;,]+)*?;base64,(?P<data>.*)$")
        .expect("failed to compile regex")
});

/// Is this string a `data:` URL?
pub fn is_data_url(s: &str) -> bool {
    s.starts_with("data:")
}

/// Parse a `data:` URL into an optional MIME type and decoded data.
pub fn parse_data_url(data_url: &str) -> Result<(Option<String>, Vec<u8>)> {
    let caps = DATA_URL_RE
        .captures(data_url)
        .ok_or_else(|| anyhow!("expected a Base64 `data:` URL"))?;
    let mime_type = caps
        .name("mime_type")
        .map(|m| m.as_str().trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty());
    let data = decode_base64(caps.name("data").map_or("", |m| m.as_str()))?;
    Ok((mime_type, data))
}

/// Decode standard Base64, ignoring embedded whitespace such as line breaks.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    let compact = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect::<String>();
    BASE64_STANDARD
        .decode(compact.as_bytes())
        .context("invalid Base64 data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_urls() {
        let (mime_type, data) = parse_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(mime_type.as_deref(), Some("image/png"));
        assert_eq!(data, b"hello");
    }

    #[test]
    fn ignores_parameters_and_missing_types() {
        let (mime_type, data) =
            parse_data_url("data:Image/JPEG;name=scan.jpg;base64,aGVs\nbG8=").unwrap();
        assert_eq!(mime_type.as_deref(), Some("image/jpeg"));
        assert_eq!(data, b"hello");

        let (mime_type, _) = parse_data_url("data:;base64,aGVsbG8=").unwrap();
        assert_eq!(mime_type, None);
    }

    #[test]
    fn rejects_non_base64_urls() {
        assert!(parse_data_url("data:text/plain,hello").is_err());
        assert!(parse_data_url("data:image/png;base64,!!!").is_err());
        assert!(is_data_url("data:image/png;base64,"));
        assert!(!is_data_url("aGVsbG8="));
    }
}
