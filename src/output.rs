//! The result record we hand back to the host.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use tokio::io::{AsyncWrite, AsyncWriteExt as _, BufWriter};

use crate::{
    error::{CleanupError, OcrError},
    orchestrator::OcrOutcome,
    prelude::*,
    retry::Attempt,
};

/// Simple statistics about recognized text.
#[derive(Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct TextStatistics {
    /// Number of Unicode scalar values.
    pub characters: usize,
    /// Number of lines containing something other than whitespace.
    pub lines: usize,
    /// Number of whitespace-separated words.
    pub words: usize,
}

impl TextStatistics {
    /// Compute statistics for `text`.
    pub fn for_text(text: &str) -> Self {
        Self {
            characters: text.chars().count(),
            lines: text.lines().filter(|l| !l.trim().is_empty()).count(),
            words: text.split_whitespace().count(),
        }
    }
}

/// An output record describing one OCR request.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct OcrOutput {
    /// Did we recognize the text?
    pub success: bool,

    /// The recognized text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Statistics about `text`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<TextStatistics>,

    /// When this record was created, in RFC 3339 format (UTC).
    pub timestamp: String,

    /// The languages we used.
    pub languages: Vec<String>,

    /// How many pages we found in the input, if we got that far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,

    /// What went wrong.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// What kind of failure this was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    /// The full chain of causes behind `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,

    /// Recognition attempts which failed, even if a later attempt succeeded.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_attempts: Vec<Attempt>,

    /// Workers which could not be shut down cleanly. These do not affect
    /// `success`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup_errors: Vec<CleanupError>,
}

impl OcrOutput {
    /// Build a record from the outcome of a request.
    pub fn from_outcome(outcome: OcrOutcome, languages: &[String], page_count: usize) -> Self {
        let mut output = match outcome.result {
            Ok(text) => Self::empty(true, languages, Some(page_count)).with_text(text),
            Err(err) => Self::from_error(&err, languages, Some(page_count)),
        };
        output.failed_attempts = outcome.failed_attempts;
        output.cleanup_errors = outcome.cleanup_errors;
        output
    }

    /// Build a record for a request which failed outside the orchestrator.
    pub fn from_anyhow(err: &anyhow::Error, languages: &[String]) -> Self {
        let mut output = Self::empty(false, languages, None);
        output.error = Some(format!("{err:#}"));
        output.error_kind = Some("input".to_owned());
        output.trace = Some(format!("{err:?}"));
        output
    }

    /// Build a record for an [`OcrError`].
    pub fn from_error(err: &OcrError, languages: &[String], page_count: Option<usize>) -> Self {
        let mut output = Self::empty(false, languages, page_count);
        output.error = Some(err.to_string());
        output.error_kind = Some(err.kind().to_owned());
        output.trace = Some(err.trace());
        output
    }

    fn empty(success: bool, languages: &[String], page_count: Option<usize>) -> Self {
        Self {
            success,
            text: None,
            statistics: None,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            languages: languages.to_vec(),
            page_count,
            error: None,
            error_kind: None,
            trace: None,
            failed_attempts: vec![],
            cleanup_errors: vec![],
        }
    }

    fn with_text(mut self, text: String) -> Self {
        self.statistics = Some(TextStatistics::for_text(&text));
        self.text = Some(text);
        self
    }

    /// Write this record as a single line of JSON.
    pub async fn write(&self, wtr: impl AsyncWrite + Unpin) -> Result<()> {
        let mut wtr = BufWriter::new(wtr);
        let json = serde_json::to_string(self).context("failed to serialize output")?;
        wtr.write_all(json.as_bytes())
            .await
            .context("failed to write output")?;
        wtr.write_all(b"\n")
            .await
            .context("failed to write output")?;
        wtr.flush().await.context("failed to flush output")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn languages() -> Vec<String> {
        vec!["eng".to_owned(), "fra".to_owned()]
    }

    #[test]
    fn statistics_count_characters_lines_and_words() {
        let stats = TextStatistics::for_text("Héllo wörld\n\n  second line \n");
        assert_eq!(
            stats,
            TextStatistics {
                characters: 28,
                lines: 2,
                words: 4,
            }
        );
        assert_eq!(TextStatistics::for_text(""), TextStatistics::default());
    }

    #[test]
    fn successful_outcome_has_text_and_statistics() {
        let outcome = OcrOutcome {
            result: Ok("HELLO".to_owned()),
            failed_attempts: vec![Attempt {
                number: 1,
                error: "busy".to_owned(),
            }],
            cleanup_errors: vec![],
        };
        let output = OcrOutput::from_outcome(outcome, &languages(), 1);
        let value = serde_json::to_value(&output).unwrap();

        assert_eq!(value["success"], json!(true));
        assert_eq!(value["text"], json!("HELLO"));
        assert_eq!(value["statistics"]["words"], json!(1));
        assert_eq!(value["languages"], json!(["eng", "fra"]));
        assert_eq!(value["page_count"], json!(1));
        assert_eq!(value["failed_attempts"][0]["error"], json!("busy"));
        assert!(value.get("error").is_none());
        assert!(value.get("cleanup_errors").is_none());
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn failed_outcome_has_error_and_no_text() {
        let outcome = OcrOutcome {
            result: Err(OcrError::Timeout(Duration::from_secs(5))),
            failed_attempts: vec![],
            cleanup_errors: vec![CleanupError::new("eng", &anyhow!("stuck"))],
        };
        let output = OcrOutput::from_outcome(outcome, &languages(), 2);
        let value = serde_json::to_value(&output).unwrap();

        assert_eq!(value["success"], json!(false));
        assert!(value.get("text").is_none());
        assert!(value.get("statistics").is_none());
        assert_eq!(value["error"], json!("OCR timed out after 5s"));
        assert_eq!(value["error_kind"], json!("timeout"));
        assert_eq!(value["cleanup_errors"][0]["language"], json!("eng"));
    }

    #[tokio::test]
    async fn writes_one_line_of_json() {
        let output = OcrOutput::from_anyhow(&anyhow!("no such file"), &languages());
        let mut buf = vec![];
        output.write(&mut buf).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains(r#""error_kind":"input""#));
    }
}
