//! CLI test cases.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::tempdir;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("idpctl").unwrap()
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
fn test_ingest_then_status_round_trip() {
    let dir = tempdir().unwrap();
    let local_root = dir.path().join("store");
    let upload = dir.path().join("statement.pdf");
    std::fs::write(&upload, b"%PDF-1.4 generic loan statement text").unwrap();

    let output = cmd()
        .arg("ingest")
        .arg(&upload)
        .arg("--local-root")
        .arg(&local_root)
        .output()
        .unwrap();
    assert!(output.status.success());
    let doc_id = String::from_utf8(output.stdout).unwrap().trim().to_string();
    assert!(!doc_id.is_empty());

    cmd()
        .arg("status")
        .arg(&doc_id)
        .arg("--local-root")
        .arg(&local_root)
        .assert()
        .success()
        .stdout(predicate::str::contains(&doc_id));
}

#[test]
fn test_status_unknown_doc_fails() {
    let dir = tempdir().unwrap();
    let local_root = dir.path().join("store");
    std::fs::create_dir_all(&local_root).unwrap();

    cmd()
        .arg("status")
        .arg("no-such-doc")
        .arg("--local-root")
        .arg(&local_root)
        .assert()
        .failure();
}
