//! Integration tests for the project registry commands.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;
use uuid::Uuid;

fn bmad_dash(config_dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_bmad-dash"));
    cmd.arg("--config-dir").arg(config_dir);
    cmd
}

fn stdout_str(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

#[test]
fn test_register_is_idempotent_and_listed() {
    let config_dir = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();

    let output = bmad_dash(config_dir.path())
        .args(["register"])
        .arg(project.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "register failed: {output:?}");
    let id: Uuid = stdout_str(&output).parse().unwrap();

    // Registering the same path again returns the same id
    let output = bmad_dash(config_dir.path())
        .args(["register"])
        .arg(project.path())
        .output()
        .unwrap();
    assert_eq!(stdout_str(&output).parse::<Uuid>().unwrap(), id);

    let output = bmad_dash(config_dir.path())
        .args(["list", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let summaries: serde_json::Value = serde_json::from_str(&stdout_str(&output)).unwrap();
    let summaries = summaries.as_array().unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["id"], id.to_string());
    assert_eq!(summaries[0]["state"], "idle");
}

#[test]
fn test_register_missing_path_fails() {
    let config_dir = TempDir::new().unwrap();
    let output = bmad_dash(config_dir.path())
        .args(["register", "/no/such/project"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "stderr: {stderr}");
}

#[test]
fn test_unregister_removes_project() {
    let config_dir = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();

    let output = bmad_dash(config_dir.path())
        .args(["register"])
        .arg(project.path())
        .output()
        .unwrap();
    let id = stdout_str(&output);

    let output = bmad_dash(config_dir.path())
        .args(["unregister", &id])
        .output()
        .unwrap();
    assert!(output.status.success(), "unregister failed: {output:?}");

    let output = bmad_dash(config_dir.path()).args(["list"]).output().unwrap();
    assert!(stdout_str(&output).contains("No projects registered"));
}

#[test]
fn test_scan_discovers_marked_directories() {
    let config_dir = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();

    for name in ["alpha", "beta"] {
        fs::create_dir_all(base.path().join(name).join(".bmad-assist")).unwrap();
    }
    fs::create_dir_all(base.path().join("unmarked")).unwrap();

    let output = bmad_dash(config_dir.path())
        .args(["scan"])
        .arg(base.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_str(&output).lines().count(), 2);

    // Second scan finds nothing new
    let output = bmad_dash(config_dir.path())
        .args(["scan"])
        .arg(base.path())
        .output()
        .unwrap();
    assert!(stdout_str(&output).contains("No new projects"));
}

fn write_fake_loop(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("fake-bmad-assist");
    fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn test_run_streams_output_and_exits_clean() {
    let config_dir = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    let scripts = TempDir::new().unwrap();
    let binary = write_fake_loop(scripts.path(), "echo hello-loop\nsleep 0.2\nexit 0\n");

    let output = bmad_dash(config_dir.path())
        .args(["run"])
        .arg(project.path())
        .arg("--binary")
        .arg(&binary)
        .output()
        .unwrap();

    assert!(output.status.success(), "run failed: {output:?}");
    assert!(stdout_str(&output).contains("hello-loop"));
}

#[test]
fn test_run_reports_crash() {
    let config_dir = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    let scripts = TempDir::new().unwrap();
    let binary = write_fake_loop(scripts.path(), "sleep 0.1\nexit 3\n");

    let output = bmad_dash(config_dir.path())
        .args(["run"])
        .arg(project.path())
        .arg("--binary")
        .arg(&binary)
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("exit code 3"), "stderr: {stderr}");
}
