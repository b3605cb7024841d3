use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn test_config_path_command() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("weft")
        .env("WEFT_HOME", dir.path())
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_config_init_creates_file() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.toml");

    assert!(!config_path.exists());

    cargo_bin_cmd!("weft")
        .env("WEFT_HOME", dir.path())
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created config"));

    let contents = fs::read_to_string(&config_path).unwrap();
    assert!(contents.contains("max_ticks = 10"));

    cargo_bin_cmd!("weft")
        .env("WEFT_HOME", dir.path())
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_config_show_merges_file_over_defaults() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("config.toml"), "max_ticks = 3\nrenderer = \"xml\"\n").unwrap();

    cargo_bin_cmd!("weft")
        .env("WEFT_HOME", dir.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("# WEFT_HOME: {}", dir.path().display())))
        .stdout(predicate::str::contains("max_ticks = 3"))
        .stdout(predicate::str::contains("renderer = \"xml\""))
        .stdout(predicate::str::contains("client_tool_timeout_secs = 300"));
}

#[test]
fn test_config_show_without_file_reports_defaults() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("weft")
        .env("WEFT_HOME", dir.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("built-in defaults"))
        .stdout(predicate::str::contains("max_ticks = 10"));
}

#[test]
fn test_invalid_config_file_fails_run() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("config.toml"), "max_ticks = 0\n").unwrap();

    cargo_bin_cmd!("weft")
        .env("WEFT_HOME", dir.path())
        .args(["run", "-p", "hi"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("max_ticks"));
}
