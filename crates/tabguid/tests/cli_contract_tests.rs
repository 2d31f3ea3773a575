//! CLI command contract tests
//!
//! Runs `tg` against a temp directory holding a config file and a
//! `json_file` snapshot store.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test fixture helpers
// =============================================================================

const SNAPSHOT: &str = r#"{
  "schema_version": 1,
  "saved_at": 1700000000000,
  "records": [
    {"guid": "aaaaaaaa-0000-4000-8000-000000000001", "tab_id": 11, "index": 0,
     "fingerprint": "[\"https://a.test/\",\"\",1]", "attributes": {"pinned": true}},
    {"guid": "aaaaaaaa-0000-4000-8000-000000000002", "tab_id": 12, "index": 1,
     "fingerprint": "[\"https://b.test/\",\"\",1]"}
  ]
}"#;

/// Temp dir with `tabguid.toml` pointing at `store/`. Returns the guard and
/// the config path.
fn setup_workspace(with_snapshot: bool) -> (TempDir, String) {
    let dir = TempDir::new().expect("create temp dir");
    let store_dir = dir.path().join("store");
    std::fs::create_dir_all(&store_dir).expect("create store dir");

    let config_path = dir.path().join("tabguid.toml");
    let config = format!(
        "storage_key = \"TabRegistry\"\n\n[store]\nbackend = \"json_file\"\npath = {:?}\n",
        store_dir.to_string_lossy()
    );
    std::fs::write(&config_path, config).expect("write config");

    if with_snapshot {
        std::fs::write(store_dir.join("TabRegistry.json"), SNAPSHOT).expect("write snapshot");
    }

    (dir, config_path.to_string_lossy().to_string())
}

fn tg(config: &str) -> Command {
    let mut cmd = Command::cargo_bin("tg").expect("tg binary");
    cmd.env_remove("RUST_LOG")
        .env_remove("TABGUID_CONFIG")
        .args(["--config", config, "--log-level", "warn"]);
    cmd
}

// =============================================================================
// show
// =============================================================================

#[test]
fn show_lists_persisted_records() {
    let (_dir, config) = setup_workspace(true);
    tg(&config)
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("2 record(s)"))
        .stdout(predicate::str::contains("aaaaaaaa-0000-4000-8000-000000000001"))
        .stdout(predicate::str::contains("attributes=1"));
}

#[test]
fn show_json_is_parseable() {
    let (_dir, config) = setup_workspace(true);
    let output = tg(&config).args(["show", "--json"]).output().expect("run tg");
    assert!(output.status.success());

    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is JSON");
    assert_eq!(parsed["schema_version"], 1);
    assert_eq!(parsed["records"].as_array().map(Vec::len), Some(2));
}

#[test]
fn show_without_snapshot() {
    let (_dir, config) = setup_workspace(false);
    tg(&config)
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("no snapshot stored"));
}

#[test]
fn show_corrupt_snapshot_fails_with_remediation() {
    let (dir, config) = setup_workspace(false);
    std::fs::write(dir.path().join("store").join("TabRegistry.json"), "{oops")
        .expect("write corrupt snapshot");
    tg(&config)
        .arg("show")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"))
        .stderr(predicate::str::contains("To fix:"));
}

// =============================================================================
// lookup
// =============================================================================

#[test]
fn lookup_known_tab() {
    let (_dir, config) = setup_workspace(true);
    tg(&config)
        .args(["lookup", "12"])
        .assert()
        .success()
        .stdout("aaaaaaaa-0000-4000-8000-000000000002\n");
}

#[test]
fn lookup_unknown_tab_fails() {
    let (_dir, config) = setup_workspace(true);
    tg(&config)
        .args(["lookup", "99"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no persisted tab holds id 99"));
}

// =============================================================================
// reset
// =============================================================================

#[test]
fn reset_requires_confirmation() {
    let (dir, config) = setup_workspace(true);
    tg(&config)
        .arg("reset")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));
    assert!(dir.path().join("store").join("TabRegistry.json").exists());
}

#[test]
fn reset_deletes_snapshot() {
    let (dir, config) = setup_workspace(true);
    tg(&config).args(["reset", "--yes"]).assert().success();
    assert!(!dir.path().join("store").join("TabRegistry.json").exists());

    tg(&config)
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("no snapshot stored"));
}

// =============================================================================
// config
// =============================================================================

#[test]
fn config_prints_effective_toml() {
    let (_dir, config) = setup_workspace(false);
    tg(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("storage_key = \"TabRegistry\""))
        .stdout(predicate::str::contains("backend = \"json_file\""))
        .stdout(predicate::str::contains("level = \"warn\""));
}

#[test]
fn missing_config_file_fails() {
    tg("/nonexistent/tabguid.toml")
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn invalid_log_format_is_rejected() {
    let (_dir, config) = setup_workspace(false);
    tg(&config)
        .args(["--log-format", "xml", "config"])
        .assert()
        .failure();
}
