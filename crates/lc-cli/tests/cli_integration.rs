//! CLI integration tests
//!
//! Tests the local-companion binary using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;

fn local_companion() -> Command {
    let mut cmd = Command::cargo_bin("local-companion")
        .expect("Failed to locate local-companion binary - ensure it's built before running tests");
    for var in [
        "GITPOD_HOST",
        "GITPOD_LCA_API_PORT",
        "GITPOD_LCA_AUTO_TUNNEL",
        "GITPOD_LCA_AUTH_REDIRECT_URL",
        "GITPOD_LCA_LOG_LEVEL",
        "GITPOD_LCA_SSH_CONFIG",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_cli_help() {
    local_companion()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("local-companion"))
        .stdout(predicate::str::contains("--gitpod-host"))
        .stdout(predicate::str::contains("--mock-keyring"));
}

#[test]
fn test_cli_version() {
    local_companion()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("local-companion"));
}

#[test]
fn test_invalid_origin_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    local_companion()
        .args(["--gitpod-host", "ftp://gitpod.io", "--mock-keyring"])
        .arg("--ssh-config")
        .arg(dir.path().join("ssh_config"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));

    // Nothing is written before the configuration is accepted
    assert!(!dir.path().join("ssh_config").exists());
}

#[test]
fn test_zero_api_port_exits_non_zero() {
    local_companion()
        .args(["--api-port", "0", "--mock-keyring", "--ssh-config", ""])
        .assert()
        .failure()
        .stderr(predicate::str::contains("api_port"));
}

#[test]
fn test_unreadable_config_file_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    local_companion()
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_env_origin_is_validated() {
    local_companion()
        .env("GITPOD_HOST", "not a url")
        .args(["--mock-keyring", "--ssh-config", ""])
        .assert()
        .failure();
}
