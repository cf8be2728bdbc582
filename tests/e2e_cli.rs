//! CLI end-to-end tests
//!
//! Tests for the imagetiles command-line interface.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

/// Get a command for the imagetiles binary
#[allow(deprecated)]
fn imagetiles_cmd() -> Command {
    Command::cargo_bin("imagetiles").unwrap()
}

/// A command pointed at `db`, ignoring any RUST_LOG in the environment.
fn cmd_with_db(db: &Path) -> Command {
    let mut cmd = imagetiles_cmd();
    cmd.env_remove("RUST_LOG").arg("--db").arg(db);
    cmd
}

fn create(db: &Path, filename: &str, project: &str) -> serde_json::Value {
    let output = cmd_with_db(db)
        .args([
            "create",
            "--filename",
            filename,
            "--project",
            project,
            "--width",
            "1024",
            "--height",
            "768",
        ])
        .output()
        .unwrap();
    assert!(output.status.success(), "create failed: {output:?}");
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_cli_no_args_shows_help() {
    let mut cmd = imagetiles_cmd();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_help_flag() {
    let mut cmd = imagetiles_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("imagetiles"))
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_version_command() {
    let mut cmd = imagetiles_cmd();
    cmd.arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("imagetiles"))
        .stdout(predicate::str::contains("schema version 2"));
}

#[test]
fn test_cli_migrate_then_up_to_date() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("images.db");

    cmd_with_db(&db)
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Applied migration 1: create_image_files"))
        .stdout(predicate::str::contains("from version 0 to 2"));

    cmd_with_db(&db)
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("up to date (version 2)"));
}

#[test]
fn test_cli_status_before_migrate() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("images.db");

    cmd_with_db(&db)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("001_create_image_files"))
        .stdout(predicate::str::contains("\"current_version\": 0"));
}

#[test]
fn test_cli_snapshot_lists_columns() {
    let mut cmd = imagetiles_cmd();
    cmd.arg("snapshot")
        .assert()
        .success()
        .stdout(predicate::str::contains("image_files"))
        .stdout(predicate::str::contains("idx_image_files_project"));
}

#[test]
fn test_cli_crud_flow() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("images.db");

    let created = create(&db, "tile1.png", "proj-A");
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["filename"], "tile1.png");

    cmd_with_db(&db)
        .args(["get", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("proj-A"));

    cmd_with_db(&db)
        .args(["list", "--project", "proj-A"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()));

    cmd_with_db(&db)
        .args(["list", "--project", "proj-B"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    cmd_with_db(&db)
        .args(["update", &id, "--description", "north tile"])
        .assert()
        .success()
        .stdout(predicate::str::contains("north tile"));

    cmd_with_db(&db)
        .arg("projects")
        .assert()
        .success()
        .stdout(predicate::str::contains("proj-A"));

    cmd_with_db(&db).args(["delete", &id]).assert().success();

    cmd_with_db(&db)
        .args(["delete", &id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_cli_rejects_long_filename() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("images.db");
    let long = "x".repeat(51);

    cmd_with_db(&db)
        .args([
            "create",
            "--filename",
            &long,
            "--project",
            "proj-A",
            "--width",
            "1",
            "--height",
            "1",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Validation error"));

    cmd_with_db(&db)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_cli_rejects_bad_id() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("images.db");

    cmd_with_db(&db)
        .args(["get", "not-a-uuid"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid image file id"));
}

#[test]
fn test_cli_validate_config() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    fs::write(
        &config_path,
        r#"
[database]
path = "/tmp/tiles.db"
pool_size = 2
"#,
    )
    .unwrap();

    let mut cmd = imagetiles_cmd();
    cmd.arg("validate")
        .arg(&config_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("Pool size: 2"));
}

#[test]
fn test_cli_validate_rejects_zero_pool() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    fs::write(&config_path, "[database]\npool_size = 0\n").unwrap();

    let mut cmd = imagetiles_cmd();
    cmd.arg("validate").arg(&config_path).assert().failure();
}
