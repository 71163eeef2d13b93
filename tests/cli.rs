use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;

fn kbh_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kbh"))
}

fn setup_test_env(bind: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let kb_dir = root.join("junit_kb");
    fs::create_dir_all(&kb_dir).unwrap();
    fs::write(
        kb_dir.join("assertions.txt"),
        "assertEquals compares expected and actual values.\n\nassertThrows verifies that an exception is thrown.",
    )
    .unwrap();
    fs::write(
        kb_dir.join("mockito.txt"),
        "Mockito when thenReturn stubs a method.\n\nverify checks that a mock interaction happened.",
    )
    .unwrap();
    fs::write(kb_dir.join("README.md"), "Not part of the corpus.").unwrap();

    let config_content = format!(
        r#"[corpus]
dir = "{root}/junit_kb"

[cache]
dir = "{root}/cache"

[chunking]
chunk_size = 80
overlap = 10

[retrieval]
k = 2

[embedding]
provider = "hash"
dims = 128

[llm]
provider = "disabled"

[server]
bind = "{bind}"
"#,
        root = root.display(),
        bind = bind,
    );

    let config_path = config_dir.join("kbh.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kbh(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kbh_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kbh binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_fingerprint_is_stable() {
    let (_tmp, config_path) = setup_test_env("127.0.0.1:7341");

    let (first, stderr, success) = run_kbh(&config_path, &["fingerprint"]);
    assert!(success, "fingerprint failed: {}", stderr);
    let (second, _, _) = run_kbh(&config_path, &["fingerprint"]);

    assert_eq!(first.trim().len(), 64);
    assert_eq!(first, second);
}

#[test]
fn test_fingerprint_changes_with_corpus() {
    let (tmp, config_path) = setup_test_env("127.0.0.1:7341");

    let (before, _, _) = run_kbh(&config_path, &["fingerprint"]);
    fs::write(
        tmp.path().join("junit_kb").join("lifecycle.txt"),
        "BeforeEach runs before every test.",
    )
    .unwrap();
    let (after, _, _) = run_kbh(&config_path, &["fingerprint"]);

    assert_ne!(before, after);
}

#[test]
fn test_status_before_and_after_warmup() {
    let (_tmp, config_path) = setup_test_env("127.0.0.1:7341");

    let (stdout, stderr, success) = run_kbh(&config_path, &["status"]);
    assert!(success, "status failed: {}", stderr);
    assert!(stdout.contains("files:      2"), "got: {}", stdout);
    assert!(stdout.contains("chunks:     absent"));
    assert!(stdout.contains("index:      absent"));

    let (stdout, stderr, success) = run_kbh(&config_path, &["warmup"]);
    assert!(success, "warmup failed: {}", stderr);
    assert!(stdout.contains("Pipeline ready."));
    assert!(stdout.contains("model:       hash"));

    let (stdout, _, _) = run_kbh(&config_path, &["status"]);
    assert!(stdout.contains("chunks:     fresh"), "got: {}", stdout);
    assert!(stdout.contains("index:      fresh"), "got: {}", stdout);
}

#[test]
fn test_status_reports_stale_cache() {
    let (tmp, config_path) = setup_test_env("127.0.0.1:7341");

    run_kbh(&config_path, &["warmup"]);
    fs::write(
        tmp.path().join("junit_kb").join("assertions.txt"),
        "assertAll groups several assertions.",
    )
    .unwrap();

    let (stdout, _, _) = run_kbh(&config_path, &["status"]);
    assert!(stdout.contains("chunks:     stale"), "got: {}", stdout);
    assert!(stdout.contains("index:      stale"), "got: {}", stdout);
}

#[test]
fn test_search_finds_relevant_source() {
    let (_tmp, config_path) = setup_test_env("127.0.0.1:7341");

    let (stdout, stderr, success) = run_kbh(&config_path, &["search", "mock verify interaction"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.starts_with("1. ["), "got: {}", stdout);
    assert!(
        stdout.lines().next().unwrap_or("").contains("mockito.txt"),
        "Expected mockito.txt first, got: {}",
        stdout
    );
}

#[test]
fn test_search_rejects_unknown_mode() {
    let (_tmp, config_path) = setup_test_env("127.0.0.1:7341");

    let (_, stderr, success) = run_kbh(&config_path, &["search", "mock", "--mode", "fuzzy"]);
    assert!(!success);
    assert!(stderr.contains("Unknown search mode"));
}

#[test]
fn test_query_with_disabled_model_fails() {
    let (_tmp, config_path) = setup_test_env("127.0.0.1:7341");

    let (_, stderr, success) = run_kbh(&config_path, &["query", "how do I mock?"]);
    assert!(!success);
    assert!(stderr.contains("model call failed"), "got: {}", stderr);
}

#[test]
fn test_clear_cache_removes_artifacts() {
    let (tmp, config_path) = setup_test_env("127.0.0.1:7341");
    let cache = tmp.path().join("cache");

    run_kbh(&config_path, &["warmup"]);
    assert!(cache.join("kb_splits.json").exists());
    assert!(cache.join("kb_index.meta.json").exists());
    assert!(cache.join("kb_index").is_dir());

    let (stdout, stderr, success) = run_kbh(&config_path, &["clear-cache"]);
    assert!(success, "clear-cache failed: {}", stderr);
    assert!(stdout.contains("Cache cleared"));
    assert!(!cache.join("kb_splits.json").exists());
    assert!(!cache.join("kb_index.meta.json").exists());
    assert!(!cache.join("kb_index").exists());

    // Idempotent.
    let (_, _, success) = run_kbh(&config_path, &["clear-cache"]);
    assert!(success);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_kbh(&tmp.path().join("nope.toml"), &["status"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

// ============ Server ============

struct ServerGuard(Child);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn start_server(config_path: &Path, base: &str) -> ServerGuard {
    let child = Command::new(kbh_binary())
        .arg("--config")
        .arg(config_path)
        .arg("serve")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let guard = ServerGuard(child);

    let client = reqwest::blocking::Client::new();
    for _ in 0..100 {
        if client.get(format!("{}/health", base)).send().is_ok() {
            return guard;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    panic!("server did not start on {}", base);
}

#[test]
fn test_server_endpoints() {
    let bind = format!("127.0.0.1:{}", free_port());
    let base = format!("http://{}", bind);
    let (_tmp, config_path) = setup_test_env(&bind);
    let _server = start_server(&config_path, &base);
    let client = reqwest::blocking::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(health["status"], "ok");

    let status: serde_json::Value = client
        .get(format!("{}/status", base))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert!(status["fingerprint"].is_null());
    assert_eq!(status["rebuilds"], 0);

    let rebuilt: serde_json::Value = client
        .post(format!("{}/rebuild", base))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(rebuilt["rebuilds"], 1);
    assert_eq!(rebuilt["embedding_model"], "hash");
    assert!(rebuilt["vectors"].as_u64().unwrap() > 0);

    let resp = client
        .post(format!("{}/query", base))
        .json(&serde_json::json!({ "prompt": "how do I mock?" }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 502);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "model");

    let resp = client
        .post(format!("{}/query", base))
        .json(&serde_json::json!({ "prompt": "   " }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    // The failed model call left the pipeline alone.
    let status: serde_json::Value = client
        .get(format!("{}/status", base))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(status["rebuilds"], 1);
}
