use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn sift_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("sift");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("runtime.md"),
        "# Runtime\n\nThe runtime schedules tasks on worker threads.\n\n```rust\ntokio::spawn(async {});\n```",
    )
    .unwrap();
    fs::write(files_dir.join("notes.txt"), "Plain notes are not accepted.").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/sift.sqlite"

[chunking]
max_tokens = 64
overlap_tokens = 8

[storage]
root = "{root}/data/uploads"
prefix = "docs"

[writer]
flush_interval_ms = 50
"#,
        root = root.display()
    );

    let config_path = config_dir.join("sift.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_sift(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = sift_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run sift binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn file_arg(config_path: &Path, name: &str) -> String {
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

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_sift(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/sift.sqlite").exists());
    assert!(tmp.path().join("data/uploads").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_sift(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_sift(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_library_create_and_list() {
    let (_tmp, config_path) = setup_test_env();
    run_sift(&config_path, &["init"]);

    let (stdout, stderr, success) = run_sift(&config_path, &["library", "create", "tokio"]);
    assert!(success, "create failed: {}", stderr);
    assert!(stdout.contains("Created library tokio"));

    let (_, stderr, success) = run_sift(&config_path, &["library", "create", "tokio"]);
    assert!(!success, "duplicate library name should fail");
    assert!(stderr.contains("already exists"), "stderr={}", stderr);

    let (stdout, _, success) = run_sift(&config_path, &["library", "list"]);
    assert!(success);
    assert!(stdout.contains("tokio"));
}

#[test]
fn test_upload_without_provider_marks_failed() {
    let (_tmp, config_path) = setup_test_env();
    run_sift(&config_path, &["init"]);
    run_sift(&config_path, &["library", "create", "tokio"]);

    let file = file_arg(&config_path, "runtime.md");
    let (stdout, stderr, success) = run_sift(
        &config_path,
        &["upload", &file, "--library", "tokio", "--version", "1.40", "--wait", "--progress", "off"],
    );
    assert!(success, "upload failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("accepted"));
    assert!(
        stdout.contains("failed: ") && stdout.contains("disabled"),
        "stdout={}",
        stdout
    );

    let (stdout, _, success) = run_sift(&config_path, &["uploads", "tokio", "1.40"]);
    assert!(success);
    assert!(stdout.contains("failed"));
    assert!(stdout.contains("runtime.md"));
}

#[test]
fn test_duplicate_upload_rejected() {
    let (_tmp, config_path) = setup_test_env();
    run_sift(&config_path, &["init"]);
    run_sift(&config_path, &["library", "create", "tokio"]);

    let file = file_arg(&config_path, "runtime.md");
    let args = ["upload", file.as_str(), "--library", "tokio", "--version", "1.40"];
    let (_, stderr, success) = run_sift(&config_path, &args);
    assert!(success, "first upload failed: {}", stderr);

    let (_, stderr, success) = run_sift(&config_path, &args);
    assert!(!success, "duplicate upload should fail");
    assert!(stderr.contains("already exists"), "stderr={}", stderr);

    // A different version accepts the same bytes.
    let (_, stderr, success) = run_sift(
        &config_path,
        &["upload", &file, "--library", "tokio", "--version", "1.41"],
    );
    assert!(success, "upload to another version failed: {}", stderr);
}

#[test]
fn test_unsupported_file_type_rejected() {
    let (_tmp, config_path) = setup_test_env();
    run_sift(&config_path, &["init"]);
    run_sift(&config_path, &["library", "create", "tokio"]);

    let file = file_arg(&config_path, "notes.txt");
    let (_, stderr, success) = run_sift(
        &config_path,
        &["upload", &file, "--library", "tokio", "--version", "1.40"],
    );
    assert!(!success);
    assert!(stderr.contains("unsupported file type"), "stderr={}", stderr);
}

#[test]
fn test_unknown_library_rejected() {
    let (_tmp, config_path) = setup_test_env();
    run_sift(&config_path, &["init"]);

    let file = file_arg(&config_path, "runtime.md");
    let (_, stderr, success) = run_sift(
        &config_path,
        &["upload", &file, "--library", "missing", "--version", "1"],
    );
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr={}", stderr);
}

#[test]
fn test_delete_and_gc() {
    let (_tmp, config_path) = setup_test_env();
    run_sift(&config_path, &["init"]);
    run_sift(&config_path, &["library", "create", "tokio"]);
    let file = file_arg(&config_path, "runtime.md");
    run_sift(
        &config_path,
        &["upload", &file, "--library", "tokio", "--version", "1.40"],
    );

    let (stdout, stderr, success) = run_sift(&config_path, &["delete", "1"]);
    assert!(success, "delete failed: {}", stderr);
    assert!(stdout.contains("Deleted upload 1"));

    let (_, stderr, success) = run_sift(&config_path, &["delete", "1"]);
    assert!(!success, "second delete should fail");
    assert!(stderr.contains("not found"));

    let (stdout, _, success) = run_sift(&config_path, &["gc"]);
    assert!(success);
    assert!(stdout.contains("Removed"));
}

#[test]
fn test_search_rejects_blank_query_and_bad_mode() {
    let (_tmp, config_path) = setup_test_env();
    run_sift(&config_path, &["init"]);
    run_sift(&config_path, &["library", "create", "tokio"]);

    let (_, stderr, success) = run_sift(&config_path, &["search", "  ", "--library", "tokio"]);
    assert!(!success);
    assert!(stderr.contains("invalid parameters"), "stderr={}", stderr);

    let (_, stderr, success) = run_sift(
        &config_path,
        &["search", "spawn", "--library", "tokio", "--mode", "poetry"],
    );
    assert!(!success);
    assert!(stderr.contains("Unknown search mode"));
}

#[test]
fn test_stats() {
    let (_tmp, config_path) = setup_test_env();
    run_sift(&config_path, &["init"]);
    run_sift(&config_path, &["library", "create", "tokio"]);

    let (stdout, stderr, success) = run_sift(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Libraries:   1"));
    assert!(stdout.contains("Chunks:"));
}

#[test]
fn test_preview_needs_no_config() {
    let (tmp, config_path) = setup_test_env();
    let file = file_arg(&config_path, "runtime.md");
    let missing = tmp.path().join("nope.toml");

    let (stdout, stderr, success) = run_sift(&missing, &["preview", &file, "--max-tokens", "16"]);
    assert!(success, "preview failed: {}", stderr);
    assert!(stdout.contains("chunks (markdown)"));
    assert!(stdout.contains("tokio::spawn"));

    let (_, stderr, success) = run_sift(
        &missing,
        &["preview", &file, "--max-tokens", "8", "--overlap-tokens", "8"],
    );
    assert!(!success);
    assert!(stderr.contains("--overlap-tokens"));
}

#[test]
fn test_invalid_config_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("bad.toml");
    fs::write(
        &config_path,
        format!(
            "[db]\npath = \"{}/x.sqlite\"\n\n[embedding]\nprovider = \"magic\"\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, stderr, success) = run_sift(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Unknown embedding provider"));
}
