use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kb_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("kb");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("nested")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    // GBK-encoded Chinese text.
    let (gbk, _, _) = encoding_rs::GBK.encode("部署说明：使用容器和集群进行部署。");
    fs::write(files_dir.join("nested").join("deploy.txt"), gbk.as_ref()).unwrap();
    fs::write(files_dir.join("skip.bin"), [0u8, 159, 146, 150]).unwrap();

    let config_content = format!(
        r#"[store]
path = '{}'

[chunking]
max_chunk_size = 120
overlap = 20
boundary_policy = "word"

[embedding]
provider = "hash"
dims = 256

[ingest]
include_globs = ["**/*.md", "**/*.txt"]
"#,
        root.join("data").join("kb.snapshot").display()
    );

    let config_path = config_dir.join("kb.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kb_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kb binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn files_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("files")
}

#[test]
fn test_ingest_directory() {
    let (_tmp, config) = setup_test_env();
    let files = files_dir(&config);
    let (stdout, stderr, success) = run_kb(&config, &["ingest", files.to_str().unwrap()]);
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains("Ingested 3 of 3 documents"), "stdout: {}", stdout);
    assert!(!stdout.contains("skip.bin"));
    assert!(config
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("data/kb.snapshot")
        .exists());
}

#[test]
fn test_list_and_show() {
    let (_tmp, config) = setup_test_env();
    let files = files_dir(&config);
    run_kb(&config, &["ingest", files.to_str().unwrap()]);

    let (stdout, _, success) = run_kb(&config, &["list"]);
    assert!(success);
    assert_eq!(stdout.lines().count(), 3);
    assert!(stdout.lines().all(|l| l.contains("indexed")), "{}", stdout);
    assert!(stdout.contains("gb18030"), "GBK file should decode: {}", stdout);

    let line = stdout.lines().find(|l| l.contains("alpha.md")).unwrap();
    let id = line.split_whitespace().next().unwrap();
    let (stdout, _, success) = run_kb(&config, &["show", id]);
    assert!(success);
    assert!(stdout.contains("--- Document ---"));
    assert!(stdout.contains("Alpha Document"));
    assert!(stdout.contains("--- Chunks"));
}

#[test]
fn test_query_ranks_relevant_document_first() {
    let (_tmp, config) = setup_test_env();
    let files = files_dir(&config);
    run_kb(&config, &["ingest", files.to_str().unwrap()]);

    let (stdout, stderr, success) = run_kb(
        &config,
        &["query", "alpha document about Rust programming", "-k", "2"],
    );
    assert!(success, "query failed: {}", stderr);
    let first = stdout.lines().next().unwrap();
    assert!(first.contains("alpha.md"), "stdout: {}", stdout);
}

#[test]
fn test_query_json() {
    let (_tmp, config) = setup_test_env();
    let files = files_dir(&config);
    run_kb(&config, &["ingest", files.to_str().unwrap()]);

    let (stdout, _, success) = run_kb(&config, &["query", "部署", "-k", "1", "--json"]);
    assert!(success);
    let hits: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0]["document_name"]
        .as_str()
        .unwrap()
        .ends_with("deploy.txt"));
    assert!(hits[0]["score"].as_f64().is_some());
}

#[test]
fn test_remove_then_not_found() {
    let (_tmp, config) = setup_test_env();
    let files = files_dir(&config);
    run_kb(&config, &["ingest", files.join("beta.md").to_str().unwrap()]);

    let (stdout, _, _) = run_kb(&config, &["list"]);
    let id = stdout.split_whitespace().next().unwrap().to_string();

    let (stdout, stderr, success) = run_kb(&config, &["remove", &id]);
    assert!(success, "remove failed: {}", stderr);
    assert!(stdout.contains("Removed document"));

    let (stdout, _, _) = run_kb(&config, &["list"]);
    assert!(stdout.contains("No documents."));

    let (_, stderr, success) = run_kb(&config, &["remove", &id]);
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr: {}", stderr);
}

#[test]
fn test_stats_and_compact() {
    let (_tmp, config) = setup_test_env();
    let files = files_dir(&config);
    run_kb(&config, &["ingest", files.to_str().unwrap()]);

    let (stdout, _, success) = run_kb(&config, &["stats", "--json"]);
    assert!(success);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["documents"], 3);
    assert_eq!(stats["dimension"], 256);

    let (stdout, _, success) = run_kb(&config, &["compact"]);
    assert!(success);
    assert!(stdout.contains("Compacted index"));
}

#[test]
fn test_invalid_config_fails() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("bad.toml");
    fs::write(&config, "[store]\npath = 'x'\n[chunking]\nmax_chunk_size = 0\n").unwrap();
    let (_, stderr, success) = run_kb(&config, &["list"]);
    assert!(!success);
    assert!(stderr.contains("max_chunk_size"), "stderr: {}", stderr);
}
