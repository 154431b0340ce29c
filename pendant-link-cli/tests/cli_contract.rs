//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, std::path::Path, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("pendant-link");
    for var in [
        "PENDANT_PORT",
        "PENDANT_BAUD",
        "PENDANT_TOOL_DIR",
        "PENDANT_OTA_ADDRESS",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// Command isolated from any user configuration.
fn isolated_cmd(dir: &Path) -> assert_cmd::Command {
    let config = dir.join("isolated.toml");
    fs::write(&config, "").expect("write empty config");
    let mut cmd = cli_cmd();
    cmd.current_dir(dir).arg("--config").arg(&config);
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("pendant-link"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pendant-link"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn list_ports_json_returns_valid_json() {
    let dir = tempdir().expect("tempdir should be created");
    let output = isolated_cmd(dir.path())
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value =
        serde_json::from_str(&stdout).expect("stdout should be JSON");
    assert!(parsed.is_array(), "should be a JSON array");
}

#[test]
fn completions_write_script_to_stdout() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pendant-link"));
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn exit_code_two_for_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("definitely-not-a-command")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_invalid_flag() {
    let mut cmd = cli_cmd();
    cmd.args(["list-ports", "--no-such-flag"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_missing_firmware_argument() {
    let mut cmd = cli_cmd();
    cmd.arg("flash-usb")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("FIRMWARE").or(predicate::str::contains("firmware")));
}

#[test]
fn exit_code_two_for_nonexistent_firmware_file() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args(["flash-ota", "missing.bin", "--address", "127.0.0.1"])
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("firmware file not found"));
}

#[test]
fn exit_code_two_for_ota_without_address() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("fw.bin"), b"\xE9firmware").expect("write firmware");
    isolated_cmd(dir.path())
        .args(["flash-ota", "fw.bin"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--address"));
}

#[test]
fn exit_code_two_for_channel_on_ble() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args(["connect", "--transport", "ble", "--device", "x", "--channel", "3"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--channel"));
}

#[test]
fn exit_code_one_for_missing_flash_tool() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("fw.bin"), b"\xE9firmware").expect("write firmware");
    isolated_cmd(dir.path())
        .args([
            "-q",
            "flash-usb",
            "fw.bin",
            "--port",
            "/dev/ttyUSB0",
            "--tool-dir",
            "no-such-dir",
        ])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Flashing tool unavailable"));
}

#[test]
fn exit_code_one_for_unreachable_ota_device() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("local addr").to_string();
    drop(listener);

    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("fw.bin"), vec![0xA5; 4096]).expect("write firmware");
    isolated_cmd(dir.path())
        .args(["flash-ota", "fw.bin", "--address", &address, "--timeout-secs", "5"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Upload failed"));
}

#[cfg(target_os = "linux")]
#[test]
fn flash_usb_runs_tool_to_completion() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().expect("tempdir should be created");
    let bin = dir.path().join("tools").join("bin");
    fs::create_dir_all(&bin).expect("create tool dir");
    let tool = bin.join("esptool-linux");
    fs::write(
        &tool,
        "#!/bin/sh\necho 'Connecting....'\necho 'Writing at 0x00010000... (50 %)'\necho 'Hash of data verified.'\nexit 0\n",
    )
    .expect("write tool");
    fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).expect("chmod tool");
    fs::write(dir.path().join("fw.bin"), b"\xE9firmware").expect("write firmware");

    isolated_cmd(dir.path())
        .args([
            "flash-usb",
            "fw.bin",
            "--port",
            "/dev/ttyUSB0",
            "--tool-dir",
            "tools",
        ])
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Firmware flashed successfully"));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn invalid_local_config_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("pendant-link.toml"), "invalid toml [[[")
        .expect("write invalid config");

    let output = cli_cmd()
        .current_dir(dir.path())
        .arg("list-ports")
        .output()
        .expect("command should execute");
    assert!(
        output.status.success(),
        "command should succeed despite config warning"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn config_file_supplies_ota_address() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("custom.toml");
    fs::write(&config, "[flash]\nota_address = \"127.0.0.1:1\"\n").expect("write config");
    fs::write(dir.path().join("fw.bin"), b"\xE9firmware").expect("write firmware");

    // Address comes from the file, so this fails at upload, not at usage
    cli_cmd()
        .current_dir(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["flash-ota", "fw.bin", "--timeout-secs", "5"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("127.0.0.1:1"));
}
