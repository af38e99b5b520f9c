//! CLI test cases.
//!
//! Most of these never reach `tesseract`, because they fail before any
//! workers start. Tests which need a real `tesseract` install are ignored by
//! default.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("ocr-runner").unwrap()
}

/// Run `ocr` with `args`, and return the parsed output record.
fn ocr_record(args: &[&str]) -> serde_json::Value {
    let output = cmd().arg("ocr").args(args).output().unwrap();
    assert!(output.status.success(), "ocr should exit successfully");
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema_to_stdout() {
    cmd()
        .args(["schema", "OcrInput"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"mime_type\""));
}

#[test]
fn test_schema_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schema.json");
    cmd()
        .args(["schema", "OcrOutput", "-o"])
        .arg(&path)
        .assert()
        .success();
    let schema = std::fs::read_to_string(&path).unwrap();
    assert!(schema.contains("statistics"));
    assert!(schema.contains("cleanup_errors"));
}

#[test]
fn test_unsupported_mime_type_is_reported_in_record() {
    let record = ocr_record(&["tests/fixtures/text.json"]);
    assert_eq!(record["success"], false);
    assert_eq!(record["error_kind"], "input");
    assert!(
        record["error"]
            .as_str()
            .unwrap()
            .contains("unsupported MIME type")
    );
    assert_eq!(record["languages"], serde_json::json!(["eng"]));
}

#[test]
fn test_raw_json_file_is_unsupported() {
    let record = ocr_record(&["--raw", "tests/fixtures/text.json"]);
    assert_eq!(record["success"], false);
}

#[test]
fn test_json_on_stdin() {
    let input = std::fs::read("tests/fixtures/text.json").unwrap();
    // Only `assert_cmd::Command` can feed standard input.
    assert_cmd::Command::cargo_bin("ocr-runner")
        .unwrap()
        .arg("ocr")
        .write_stdin(input)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success\":false"));
}

#[test]
fn test_invalid_max_attempts_is_a_configuration_error() {
    for attempts in ["0", "-2"] {
        let record = ocr_record(&[
            "tests/fixtures/blank_png.json",
            "--max-attempts",
            attempts,
            "--lang",
            "eng+fra",
        ]);
        assert_eq!(record["success"], false);
        assert_eq!(record["error_kind"], "configuration");
        assert_eq!(record["page_count"], 1);
        assert_eq!(record["languages"], serde_json::json!(["eng", "fra"]));
        assert!(record.get("text").is_none());
    }
}

#[test]
fn test_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.json");
    cmd()
        .args(["ocr", "tests/fixtures/blank.png", "--max-attempts", "0", "-o"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    let record: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(record["error_kind"], "configuration");
}

#[test]
#[ignore = "Needs tesseract installed"]
fn test_unknown_language_fails_initialization() {
    let record = ocr_record(&[
        "tests/fixtures/blank.png",
        "--lang",
        "zzz_not_a_language",
    ]);
    assert_eq!(record["success"], false);
    assert_eq!(record["error_kind"], "initialization");
}

#[test]
#[ignore = "Needs tesseract installed"]
fn test_blank_page_succeeds_with_preprocessing() {
    let record = ocr_record(&["tests/fixtures/blank_png.json", "--preprocess"]);
    assert_eq!(record["success"], true);
    assert_eq!(record["page_count"], 1);
    assert!(record["statistics"].is_object());
}
