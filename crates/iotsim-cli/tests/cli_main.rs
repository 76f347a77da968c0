//! Basic CLI tests for the iotsim command-line interface.

use assert_cmd::Command;
use predicates::prelude::*;

/// Test that the CLI binary exists and shows help.
#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("iotsim").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("IoT sensor fleet simulator"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("probe"));
}

/// Test that the CLI shows version information.
#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("iotsim").unwrap();
    cmd.arg("--version");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("iotsim"));
}

#[test]
fn test_run_help_lists_flags() {
    let mut cmd = Command::cargo_bin("iotsim").unwrap();
    cmd.args(["run", "--help"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("--mode"))
        .stdout(predicate::str::contains("--publishers"))
        .stdout(predicate::str::contains("--assign"))
        .stdout(predicate::str::contains("--transport"));
}

#[test]
fn test_invalid_mode_rejected() {
    let mut cmd = Command::cargo_bin("iotsim").unwrap();
    cmd.args(["run", "--mode", "everything"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid mode"));
}

#[test]
fn test_no_subcommand_shows_error() {
    let mut cmd = Command::cargo_bin("iotsim").unwrap();
    cmd.assert().failure();
}

#[test]
fn test_zero_publishers_fails_fast() {
    let mut cmd = Command::cargo_bin("iotsim").unwrap();
    cmd.args([
        "run",
        "--mode",
        "pub-only",
        "--transport",
        "memory",
        "--publishers",
        "0",
    ]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("at least one publisher"));
}

/// Publishers-only run against the in-process broker.
#[test]
fn test_memory_publishers_only_run() {
    let mut cmd = Command::cargo_bin("iotsim").unwrap();
    cmd.args([
        "run",
        "--mode",
        "pub-only",
        "--transport",
        "memory",
        "--publishers",
        "3",
        "--messages",
        "2",
        "--interval-ms",
        "1",
        "--assign",
        "park_north,humidity",
        "--assign",
        "bogus",
        "--json",
    ]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"total_published\": 6"))
        .stdout(predicate::str::contains("\"errors\": 0"))
        .stdout(predicate::str::contains("Skipping"));
}

#[test]
fn test_log_dir_receives_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("logs");

    let mut cmd = Command::cargo_bin("iotsim").unwrap();
    cmd.args(["--log-dir", log_dir.to_str().unwrap()])
        .args([
            "run",
            "--mode",
            "pub-only",
            "--transport",
            "memory",
            "--publishers",
            "1",
            "--messages",
            "1",
            "--interval-ms",
            "0",
        ]);

    cmd.assert().success();

    let log = std::fs::read_to_string(log_dir.join("iotsim.log")).unwrap();
    assert!(log.contains("All publishers finished"));
}

#[test]
fn test_config_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sim.toml");
    std::fs::write(
        &path,
        "num_publishers = 2\nmessages_per_device = 1\ninterval_ms = 1\nlaunch_stagger_ms = 0\n",
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("iotsim").unwrap();
    cmd.args([
        "run",
        "--mode",
        "pub-only",
        "--transport",
        "memory",
        "--json",
        "--config",
        path.to_str().unwrap(),
    ]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"publishers_launched\": 2"));
}

#[test]
fn test_missing_config_file_fails() {
    let mut cmd = Command::cargo_bin("iotsim").unwrap();
    cmd.args(["run", "--config", "/nonexistent/iotsim.toml"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load"));
}

#[test]
#[ignore] // Requires MQTT broker
fn test_probe_local_broker() {
    let mut cmd = Command::cargo_bin("iotsim").unwrap();
    cmd.args(["probe", "--broker", "localhost", "--port", "1883"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("is reachable"));
}
