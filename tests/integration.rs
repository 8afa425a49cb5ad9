mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dossier_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("dossier");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(files_dir.join("processo.pdf"), common::blank_pdf(3)).unwrap();
    fs::write(
        files_dir.join("good.json"),
        r#"{"summary": "Ação de cobrança", "parties": ["A", "B"]}"#,
    )
    .unwrap();
    fs::write(
        files_dir.join("truncated.json"),
        r#"{"summary": "Ação de cobrança", "parties": ["A", "#,
    )
    .unwrap();

    let config_path = common::write_config(&root, "");
    (tmp, config_path)
}

fn run_dossier(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dossier_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dossier binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn file(config_path: &Path, name: &str) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("files")
        .join(name)
        .to_string_lossy()
        .to_string()
}

/// Ingest the fixture PDF and return the document id printed by the CLI.
fn ingest(config_path: &Path) -> String {
    let (stdout, stderr, success) =
        run_dossier(config_path, &["ingest", &file(config_path, "processo.pdf")]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("id:"))
        .map(|id| id.trim().to_string())
        .expect("ingest output has an id line")
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dossier(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/dossier.sqlite").exists());
    assert!(tmp.path().join("store").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_dossier(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_dossier(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_counts_pages_and_dedupes() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);

    let (stdout, _, success) =
        run_dossier(&config_path, &["ingest", &file(&config_path, "processo.pdf")]);
    assert!(success);
    assert!(stdout.contains("Registered."));
    assert!(stdout.contains("pages:     3"));
    assert!(stdout.contains("chunked:   no"));

    let (stdout, _, success) =
        run_dossier(&config_path, &["ingest", &file(&config_path, "processo.pdf")]);
    assert!(success);
    assert!(stdout.contains("Already registered."));
}

#[test]
fn test_status_of_new_document() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);
    let id = ingest(&config_path);

    let (stdout, stderr, success) = run_dossier(&config_path, &["status", &id]);
    assert!(success, "status failed: {}", stderr);
    assert!(stdout.contains("status:      created"));
    assert!(stdout.contains("--- Units (0) ---"));
}

#[test]
fn test_status_unknown_document_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);

    let (_, stderr, success) = run_dossier(&config_path, &["status", "no-such-id"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_analyze_then_step_with_disabled_provider() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);
    let id = ingest(&config_path);

    let (stdout, stderr, success) = run_dossier(&config_path, &["analyze", &id]);
    assert!(success, "analyze failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("units:     2"));

    let (stdout, _, _) = run_dossier(&config_path, &["status", &id]);
    assert!(stdout.contains("status:      analyzing"));
    assert!(stdout.contains("pending"));

    // Both models fail against the disabled provider.
    let (stdout, stderr, success) = run_dossier(&config_path, &["step", &id]);
    assert!(success, "step failed: {}", stderr);
    assert!(stdout.contains("model_exhausted"));

    let (stdout, _, _) = run_dossier(&config_path, &["attempts", &id]);
    assert!(stdout.contains("--- Model attempts (2) ---"));
    assert!(stdout.contains("model-a"));
    assert!(stdout.contains("model-b"));
    assert!(stdout.contains("disabled"));

    let (stdout, _, _) = run_dossier(&config_path, &["status", &id]);
    assert!(stdout.contains("status:      error"));
    assert!(stdout.contains("reason:      model_exhausted"));
}

#[test]
fn test_validate_accepts_complete_json() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dossier(
        &config_path,
        &["validate", &file(&config_path, "good.json"), "--stage", "Prazos"],
    );
    assert!(success, "validate failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("valid:        true"));
}

#[test]
fn test_validate_reports_truncation() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_dossier(
        &config_path,
        &[
            "validate",
            &file(&config_path, "truncated.json"),
            "--stage",
            "Prazos",
        ],
    );
    assert!(!success);
    assert!(stdout.contains("valid:        false"));
    assert!(stdout.contains("truncated:    true"));
    assert!(stdout.contains("remediation:"));
}

#[test]
fn test_monitor_once_on_empty_database() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);

    let (stdout, stderr, success) = run_dossier(&config_path, &["monitor", "--once"]);
    assert!(success, "monitor failed: {}", stderr);
    assert!(stdout.contains("stuck:     0"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = common::write_config(tmp.path(), "\n[notify]\nkind = \"webhook\"\n");

    let (_, stderr, success) = run_dossier(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("notify.url"));
}
