//! Shared test utilities for pipeline tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use autoinstall_builder::assets::FetchPolicy;
use autoinstall_builder::pipeline::BuildOptions;
use tempfile::TempDir;
use time::macros::datetime;
use walkdir::WalkDir;

/// Minimal valid document body: a user with a password.
pub const USER: &str = r#"
[user]
username = "ada"
full_name = "Ada Lovelace"
password = "s3cret-pass"
"#;

pub const PASSPHRASE: &str = "Tr0ub4dor&3-long";

/// Temporary project layout: config and local assets live in `root`,
/// builds go to `output`, remote fetches to `cache`.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub root: PathBuf,
    pub output: PathBuf,
    pub cache: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let root = base.join("project");
        fs::create_dir_all(&root).expect("Failed to create project dir");
        Self {
            _temp_dir: temp_dir,
            output: base.join("output"),
            cache: base.join("cache"),
            root,
        }
    }

    /// Write `build.toml` and return its path.
    pub fn write_config(&self, body: &str) -> PathBuf {
        let path = self.root.join("build.toml");
        fs::write(&path, body).expect("Failed to write config");
        path
    }

    /// Write a file under the project root, creating parents.
    pub fn write_file(&self, rel: &str, bytes: &[u8]) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        fs::write(&path, bytes).expect("Failed to write file");
        path
    }

    /// Options for a reproducible, installer-less build into `output`.
    pub fn options(&self, config: &Path) -> BuildOptions {
        self.options_into(config, &self.output)
    }

    pub fn options_into(&self, config: &Path, output: &Path) -> BuildOptions {
        let mut opts = BuildOptions::new(config, output);
        opts.cache_dir = self.cache.clone();
        opts.concurrency = 2;
        opts.timestamp = datetime!(2024-03-01 12:00:00 UTC);
        opts.fetch_policy = FetchPolicy {
            attempts: 3,
            retry_delay: Duration::from_millis(10),
            timeout: Some(Duration::from_secs(10)),
            connect_timeout: Duration::from_secs(5),
        };
        opts
    }
}

/// Relative path -> contents for every file under `root`.
pub fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .map(|e| e.expect("walk"))
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e
                .path()
                .strip_prefix(root)
                .expect("under root")
                .to_string_lossy()
                .replace('\\', "/");
            (rel, fs::read(e.path()).expect("read"))
        })
        .collect()
}

#[cfg(unix)]
pub fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).expect("metadata").permissions().mode() & 0o777
}

/// One-connection-at-a-time HTTP server on loopback. Each request gets the
/// next scripted `(status, body)`; the last one repeats.
pub struct MockServer {
    pub base_url: String,
    hits: Arc<AtomicUsize>,
}

impl MockServer {
    pub fn start(responses: Vec<(u16, Vec<u8>)>) -> Self {
        assert!(!responses.is_empty());
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let base_url = format!("http://{}", listener.local_addr().expect("addr"));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = &responses[index.min(responses.len() - 1)];

                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }

                let reason = match status {
                    200 => "OK",
                    404 => "Not Found",
                    503 => "Service Unavailable",
                    _ => "Status",
                };
                let head = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
                    status,
                    reason,
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(body);
                let _ = stream.flush();
            }
        });

        Self { base_url, hits }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}
