//! CLI integration tests for live-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! exit codes, and an end-to-end run against in-memory stores.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::TempDir;

/// Get a command for the live-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("live-migrate").unwrap()
}

/// Write a config file using in-memory stores and a fast cutover.
fn memory_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("config.yaml");
    let state = dir.path().join("state.json");
    std::fs::write(
        &path,
        format!(
            r#"
source: {{ url: "memory://source" }}
target: {{ url: "memory://target" }}
coordination: {{ url: "memory://" }}
migration:
  sync_interval_ms: 20
  read_only_timeout_ms: 2000
  cutover_grace_ms: 0
  sync_warmup_timeout_ms: 5000
collections:
  - name: users
  - name: orders
    depends_on: [users]
state_file: "{}"
"#,
            state.display()
        ),
    )
    .unwrap();
    path
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("report"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("live-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_exist() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--state-file"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

#[test]
fn test_short_config_flag() {
    cmd()
        .args(["-c", "some_config.yaml", "--help"])
        .assert()
        .success();
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_1() {
    // a missing file is an IO error, not a configuration error
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "start"])
        .assert()
        .code(1);
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "start"])
        .assert()
        .code(2);
}

#[test]
fn test_invalid_config_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source: {{ url: \"memory://a\" }}").unwrap();
    writeln!(file, "target: {{ url: \"memory://b\" }}").unwrap();
    writeln!(file, "coordination: {{ url: \"memory://\" }}").unwrap();
    writeln!(file, "collections: []").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "start"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("collection"));
}

#[test]
fn test_dependency_cycle_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source: {{ url: \"memory://a\" }}").unwrap();
    writeln!(file, "target: {{ url: \"memory://b\" }}").unwrap();
    writeln!(file, "coordination: {{ url: \"memory://\" }}").unwrap();
    writeln!(file, "collections:").unwrap();
    writeln!(file, "  - {{ name: a, depends_on: [b] }}").unwrap();
    writeln!(file, "  - {{ name: b, depends_on: [a] }}").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "start"])
        .assert()
        .code(2);
}

// =============================================================================
// Report Tests
// =============================================================================

#[test]
fn test_report_without_state_exits_zero() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.json");

    cmd()
        .args(["--state-file", missing.to_str().unwrap(), "report"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No migration state found"));
}

#[test]
fn test_report_with_corrupt_state_exits_zero() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{ not json").unwrap();

    cmd()
        .args(["--state-file", path.to_str().unwrap(), "report"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Could not read migration state"));
}

// =============================================================================
// End-to-end
// =============================================================================

#[test]
fn test_start_then_report_with_memory_stores() {
    let dir = TempDir::new().unwrap();
    let config = memory_config(&dir);

    let output = cmd()
        .args(["--config", config.to_str().unwrap(), "--output-json", "start"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["status"], "complete");
    assert_eq!(json["phase"], "COMPLETE");
    assert_eq!(json["collections_total"], 2);

    cmd()
        .args(["--config", config.to_str().unwrap(), "report"])
        .assert()
        .success()
        .stdout(predicate::str::contains("complete (phase COMPLETE)"))
        .stdout(predicate::str::contains("Validation passed"));
}
