//! Integration tests for the `relay` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use relay_cli::protocol::ParentMessage;
use relay_core::{RawOptions, resolve};
use tempfile::TempDir;

fn relay() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("relay"))
}

#[test]
fn test_version_flag() {
    relay()
        .arg("-v")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_help_lists_server_flags() {
    relay()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--port"))
        .stdout(predicate::str::contains("--address"))
        .stdout(predicate::str::contains("--workers"));
}

#[test]
fn test_missing_config_file_fails() {
    let temp = TempDir::new().unwrap();

    relay()
        .current_dir(temp.path())
        .args(["--config", "nope.json", "--no-color"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("File not found"));
}

#[test]
fn test_worker_answers_status_and_build_requests() {
    let temp = TempDir::new().unwrap();
    let options = resolve(RawOptions {
        cache: Some(false),
        cache_dir: Some(temp.path().to_path_buf()),
        ..Default::default()
    });

    let mut input = String::new();
    for message in [
        ParentMessage::Status { id: 1 },
        ParentMessage::Build { id: 2, options },
    ] {
        input.push_str(&serde_json::to_string(&message).unwrap());
        input.push('\n');
    }

    relay()
        .args(["worker", "--quiet", "--no-color"])
        .write_stdin(input)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"{"type":"ready","pid":"#))
        .stdout(predicate::str::contains(r#"{"type":"status","id":1,"#))
        .stdout(predicate::str::contains(r#""id":2,"buildHash":"#))
        .stdout(predicate::str::contains(
            r#""buildData":{"error":{"type":"ConfigError""#,
        ));
}
