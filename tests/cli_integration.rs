//! Integration tests for the lvlt binary.
//!
//! Each test runs the built executable against its own config directory.

use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn lvlt(config_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_lvlt"))
        .args(args)
        .env("LVLT_CONFIG_DIR", config_dir)
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to run lvlt")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_cli_init_command() {
    let temp_dir = TempDir::new().unwrap();

    let output = lvlt(temp_dir.path(), &["init"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("lvlt initialized"));
    assert!(stdout(&output).contains("Node ID:"));
    assert!(temp_dir.path().join("config.toml").exists());
    assert!(temp_dir.path().join("identity.key").exists());
}

#[test]
fn test_cli_commands_require_init() {
    let temp_dir = TempDir::new().unwrap();

    let output = lvlt(temp_dir.path(), &["status"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("lvlt init"));
}

#[test]
fn test_cli_add_link_and_remove() {
    let temp_dir = TempDir::new().unwrap();
    let config_dir = temp_dir.path().join("config");
    let sync_dir = temp_dir.path().join("photos");
    assert!(lvlt(&config_dir, &["init"]).status.success());

    let output = lvlt(&config_dir, &["add", sync_dir.to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("Added folder"));
    let id = out
        .lines()
        .find_map(|l| l.trim().strip_prefix("Folder ID: "))
        .unwrap()
        .trim()
        .to_string();
    assert_eq!(id.len(), 64);

    let output = lvlt(&config_dir, &["link", &id[..8]]);
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert_eq!(out.matches("lvlt:").count(), 4);

    let output = lvlt(&config_dir, &["link", &id[..8], "--level", "read-only"]);
    let link = stdout(&output)
        .lines()
        .find_map(|l| l.split_whitespace().find(|w| w.starts_with("lvlt:")).map(str::to_string))
        .unwrap();

    // Joining the same folder a second time is refused.
    let output = lvlt(&config_dir, &["open", &link, temp_dir.path().join("again").to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("already synchronized"));

    let output = lvlt(&config_dir, &["status"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Daemon is not running"));

    let output = lvlt(&config_dir, &["remove", &id[..8]]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(sync_dir.exists());
    assert!(stdout(&lvlt(&config_dir, &["status"])).contains("No folders"));
}

#[test]
fn test_cli_open_rejects_bad_link() {
    let temp_dir = TempDir::new().unwrap();
    assert!(lvlt(temp_dir.path(), &["init"]).status.success());

    let target = temp_dir.path().join("joined");
    let output = lvlt(temp_dir.path(), &["open", "not-a-link", target.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Wrong link format"));
    assert!(!target.exists());
}

#[test]
fn test_cli_port_and_discovery() {
    let temp_dir = TempDir::new().unwrap();
    assert!(lvlt(temp_dir.path(), &["init"]).status.success());

    let output = lvlt(temp_dir.path(), &["port", "43210"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("43210"));

    let output = lvlt(temp_dir.path(), &["discovery", "global", "off"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("global discovery turned off"));

    let config = std::fs::read_to_string(temp_dir.path().join("config.toml")).unwrap();
    assert!(config.contains("listen_port = 43210"));
    assert!(config.contains("global = false"));

    let output = lvlt(temp_dir.path(), &["port", "eighty"]);
    assert!(!output.status.success());
}
