//! CLI Integration Tests
//!
//! These tests run the `blelink` binary for commands that never touch the
//! Bluetooth adapter. Each test points the binary at its own config and
//! state files so the user's real files are never read or written.
//!
//! ```
//! cargo test --package blelink-cli --test cli_integration
//! ```

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn run_blelink(args: &[&str], config: &Path, state: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_blelink"))
        .args(args)
        .env("BLELINK_CONFIG", config)
        .env("BLELINK_STATE", state)
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run blelink binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

struct Files {
    _dir: tempfile::TempDir,
    config: std::path::PathBuf,
    state: std::path::PathBuf,
}

fn files() -> Files {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    let state = dir.path().join("state.toml");
    Files {
        _dir: dir,
        config,
        state,
    }
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_lists_commands() {
    let f = files();
    let output = run_blelink(&["--help"], &f.config, &f.state);

    assert!(output.status.success());
    let text = stdout(&output);
    for command in [
        "connect",
        "watch",
        "status",
        "forget",
        "init",
        "completions",
    ] {
        assert!(text.contains(command), "help is missing {}", command);
    }
}

#[test]
fn test_version() {
    let f = files();
    let output = run_blelink(&["--version"], &f.config, &f.state);

    assert!(output.status.success());
    assert!(stdout(&output).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_unknown_command_fails() {
    let f = files();
    let output = run_blelink(&["pair"], &f.config, &f.state);
    assert!(!output.status.success());
}

#[test]
fn test_completions_bash() {
    let f = files();
    let output = run_blelink(&["completions", "bash"], &f.config, &f.state);

    assert!(output.status.success());
    assert!(stdout(&output).contains("blelink"));
}

// =============================================================================
// Status and Forget Tests
// =============================================================================

#[test]
fn test_status_with_nothing_remembered() {
    let f = files();
    let output = run_blelink(&["status"], &f.config, &f.state);

    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("Remembered:      (none)"));
    assert!(text.contains("(defaults)"));
    assert!(!f.state.exists());
}

#[test]
fn test_status_reads_config_and_state() {
    let f = files();
    fs::write(
        &f.config,
        "[link]\nname_prefix = \"Tag-\"\nstore_key = \"custom.key\"\n",
    )
    .unwrap();
    fs::write(&f.state, "\"custom.key\" = \"AA:BB:CC:DD:EE:FF\"\n").unwrap();

    let output = run_blelink(&["status"], &f.config, &f.state);

    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("AA:BB:CC:DD:EE:FF"));
    assert!(text.contains("Name filter:     Tag-"));
}

#[test]
fn test_status_treats_blank_value_as_nothing_remembered() {
    let f = files();
    fs::write(&f.state, "\"blelink.last_peripheral\" = \"   \"\n").unwrap();

    let output = run_blelink(&["status"], &f.config, &f.state);

    assert!(output.status.success());
    assert!(stdout(&output).contains("Remembered:      (none)"));
}

#[test]
fn test_forget_clears_remembered_peripheral() {
    let f = files();
    fs::write(
        &f.state,
        "\"blelink.last_peripheral\" = \"abc123\"\nother = \"kept\"\n",
    )
    .unwrap();

    let output = run_blelink(&["forget"], &f.config, &f.state);
    assert!(output.status.success());
    assert!(stdout(&output).contains("[OK]"));

    let state = fs::read_to_string(&f.state).unwrap();
    assert!(!state.contains("abc123"));
    assert!(state.contains("kept"));

    let status = run_blelink(&["status"], &f.config, &f.state);
    assert!(stdout(&status).contains("Remembered:      (none)"));
}

#[test]
fn test_forget_without_state_file_succeeds() {
    let f = files();
    let output = run_blelink(&["forget"], &f.config, &f.state);

    assert!(output.status.success());
    assert!(!f.state.exists());
}

#[test]
fn test_init_writes_loadable_config() {
    let f = files();
    let output = run_blelink(&["init"], &f.config, &f.state);
    assert!(output.status.success());

    let written = fs::read_to_string(&f.config).unwrap();
    assert!(written.contains("[link]"));
    assert!(written.contains("[behavior]"));

    let again = run_blelink(&["init"], &f.config, &f.state);
    assert!(!again.status.success());

    let status = run_blelink(&["status"], &f.config, &f.state);
    assert!(!stdout(&status).contains("(defaults)"));
}
