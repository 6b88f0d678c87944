//! End-to-end tests of the offline `relayd` subcommands.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn relayd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("relayd").unwrap();
    cmd.env("RELAYD_DATA_DIR", data_dir.path())
        .env_remove("RELAYD_MQTT_URL")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("relayd").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("publish"))
        .stdout(predicate::str::contains("schedule"))
        .stdout(predicate::str::contains("next-runs"));
}

#[test]
fn test_next_runs_keep_local_hour_across_dst() {
    let dir = TempDir::new().unwrap();
    relayd(&dir)
        .args([
            "next-runs",
            "0 8 * * *",
            "--tz",
            "America/New_York",
            "--count",
            "3",
            "--from",
            "2025-03-08T12:30:00Z",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("2025-03-08T13:00:00Z"))
        .stdout(predicate::str::contains("2025-03-09T12:00:00Z"))
        .stdout(predicate::str::contains("2025-03-10 08:00 EDT"));
}

#[test]
fn test_schedule_lifecycle() {
    let dir = TempDir::new().unwrap();

    relayd(&dir)
        .args(["device", "add", "strip", "--channel", "power2", "--name", "Desk strip"])
        .assert()
        .success();
    relayd(&dir)
        .args(["device", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("POWER2"))
        .stdout(predicate::str::contains("Desk strip"));

    relayd(&dir)
        .args([
            "schedule", "add", "strip", "off", "*/5 * * * *", "--tz", "Europe/Berlin",
            "--window", "22:00-06:00", "--every", "30",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created schedule 1"))
        .stdout(predicate::str::contains("window=22:00-06:00/30m"));

    relayd(&dir)
        .args(["schedule", "disable", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("disabled"));

    relayd(&dir)
        .args(["schedule", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("strip"))
        .stdout(predicate::str::contains("disabled"));

    relayd(&dir)
        .args(["schedule", "runs", "1"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_invalid_schedule_is_rejected() {
    let dir = TempDir::new().unwrap();
    relayd(&dir)
        .args(["schedule", "add", "plug", "on", "0 8 * * *", "--tz", "Mars/Base"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid timezone"));

    relayd(&dir)
        .args(["schedule", "enable", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Schedule not found"));
}
