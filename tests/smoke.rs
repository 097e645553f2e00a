//! Smoke tests -- verify the binary runs and the subcommands are wired.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("streamscore")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Online anomaly likelihood scoring"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("streamscore")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("streamscore"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["init", "create-metric", "ingest", "delete", "status"] {
        Command::cargo_bin("streamscore")
            .unwrap()
            .args([sub, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_ingest_requires_metric() {
    Command::cargo_bin("streamscore")
        .unwrap()
        .args(["ingest", "--input", "rows.csv"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("--metric"));
}

#[test]
fn test_missing_config_file_fails() {
    Command::cargo_bin("streamscore")
        .unwrap()
        .args(["--config", "/nonexistent/streamscore.toml", "status"])
        .assert()
        .failure();
}
