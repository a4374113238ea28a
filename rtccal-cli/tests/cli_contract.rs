//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("rtccal");
    cmd.env_remove("RTCCAL_BAUD")
        .env_remove("RTCCAL_COMMAND_TIMEOUT")
        .env_remove("RTCCAL_CONFIG");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("rtccal"))
        .stdout(predicate::str::contains("PORT"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("rtccal"))
        .stderr(predicate::str::is_empty());
}

// ============================================================================
// Exit Code Tests
// ============================================================================

/// Exit code 1: no serial port given
#[test]
fn exit_code_one_without_port() {
    let mut cmd = cli_cmd();
    cmd.assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Usage"));
}

/// Exit code 1: more than one positional argument
#[test]
fn exit_code_one_for_extra_arguments() {
    let mut cmd = cli_cmd();
    cmd.args(["/dev/ttyUSB0", "/dev/ttyUSB1"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn exit_code_one_for_invalid_flag() {
    let mut cmd = cli_cmd();
    cmd.arg("--invalid-flag-xyz")
        .assert()
        .failure()
        .code(1);
}

#[test]
fn malformed_settle_is_a_usage_error() {
    let mut cmd = cli_cmd();
    cmd.args(["--settle", "1M", "/dev/ttyUSB0"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("NAME=SECS"));
}

#[test]
fn settle_longer_than_window_is_rejected_before_opening_port() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("no-such-tty");

    let mut cmd = cli_cmd();
    cmd.arg("--settle")
        .arg("1M=120")
        .arg(missing.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("shorter than"));
}

#[test]
fn nonexistent_device_fails_with_diagnostic() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("no-such-tty");

    let mut cmd = cli_cmd();
    cmd.arg("-q")
        .arg(missing.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Error"))
        .stderr(predicate::str::contains("no-such-tty"));
}

#[test]
fn invalid_config_warns_but_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("rtccal.toml"), "invalid toml [[[").expect("write invalid config");

    let mut cmd = cli_cmd();
    // The run itself fails on the missing device; the bad file only warns.
    let output = cmd
        .current_dir(dir.path())
        .arg("no-such-tty")
        .output()
        .expect("command should execute");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML: {stderr}");
    assert!(stderr.contains("no-such-tty"), "{stderr}");
}

#[test]
fn list_ports_does_not_require_a_port() {
    let mut cmd = cli_cmd();
    let output = cmd
        .arg("--list-ports")
        .output()
        .expect("command should execute");

    // Enumeration can fail in sandboxes without udev; it must not be a usage error.
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("Usage"), "{stderr}");
}
