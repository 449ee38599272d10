//! CLI integration tests for the Hearth command-line interface.
//!
//! Every test points the CLI at a file store inside a temporary
//! directory, so nothing outside it is touched.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a command for the hearth binary.
fn hearth() -> Command {
    Command::cargo_bin("hearth").unwrap()
}

/// Write a config using a file store under `dir`, returning its path.
fn file_store_config(dir: &Path) -> std::path::PathBuf {
    let sessions = dir.join("sessions");
    std::fs::create_dir_all(&sessions).unwrap();
    let config = dir.join("hearth.toml");
    std::fs::write(
        &config,
        format!(
            "timeout = 60\nscavenge_interval_secs = 0\n\n[store]\ntype = \"file\"\npath = \"{}\"\n",
            sessions.display().to_string().replace('\\', "\\\\")
        ),
    )
    .unwrap();
    config
}

/// Write a stored snapshot for `id` directly into the file store.
fn write_snapshot(dir: &Path, id: &str, last_accessed: i64, max_inactive_secs: i64) {
    let expiry = if max_inactive_secs > 0 {
        last_accessed + max_inactive_secs * 1000
    } else {
        0
    };
    let body = serde_json::json!({
        "id": id,
        "created_at": last_accessed,
        "last_accessed": last_accessed,
        "max_inactive_secs": max_inactive_secs,
        "attributes": { "user": "ada" },
    });
    std::fs::write(
        dir.join("sessions").join(format!("{expiry}_{id}.json")),
        body.to_string(),
    )
    .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    hearth()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("inspect"))
        .stdout(predicate::str::contains("delete"))
        .stdout(predicate::str::contains("reap"));
}

#[test]
fn test_version_displays() {
    hearth()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("hearth"));
}

#[test]
fn test_reap_help_explains_remote_stores() {
    hearth()
        .args(["reap", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Remote stores are not scanned"));
}

#[test]
fn test_inspect_requires_id() {
    hearth().arg("inspect").assert().failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// Config Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_config_prints_effective_toml() {
    let dir = TempDir::new().unwrap();
    let config = file_store_config(dir.path());

    hearth()
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("timeout = 60"))
        .stdout(predicate::str::contains("type = \"file\""));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("bad.toml");
    std::fs::write(&config, "max_sessions = 0\n").unwrap();

    hearth()
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_sessions"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Store Commands
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_inspect_prints_snapshot_json() {
    let dir = TempDir::new().unwrap();
    let config = file_store_config(dir.path());
    write_snapshot(dir.path(), "abc", 1_700_000_000_000, 0);

    hearth()
        .arg("--config")
        .arg(&config)
        .args(["--json", "inspect", "abc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": \"abc\""))
        .stdout(predicate::str::contains("ada"));
}

#[test]
fn test_inspect_missing_session_fails() {
    let dir = TempDir::new().unwrap();
    let config = file_store_config(dir.path());

    hearth()
        .arg("--config")
        .arg(&config)
        .args(["inspect", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_delete_removes_snapshot() {
    let dir = TempDir::new().unwrap();
    let config = file_store_config(dir.path());
    write_snapshot(dir.path(), "abc", 1_700_000_000_000, 0);

    hearth()
        .arg("--config")
        .arg(&config)
        .args(["delete", "abc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted session abc"));

    hearth()
        .arg("--config")
        .arg(&config)
        .args(["delete", "abc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No session abc"));
}

#[test]
fn test_reap_destroys_expired_sessions() {
    let dir = TempDir::new().unwrap();
    let config = file_store_config(dir.path());
    write_snapshot(dir.path(), "stale", 1_000, 60);
    write_snapshot(dir.path(), "forever", 1_000, 0);

    hearth()
        .arg("--config")
        .arg(&config)
        .args(["--json", "reap"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"invalidated\":1"))
        .stdout(predicate::str::contains("\"store_scanned\":true"));

    let remaining: Vec<_> = std::fs::read_dir(dir.path().join("sessions"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(remaining, vec!["0_forever.json".to_string()]);
}
