//! Streaming HTTP fetch into the asset cache.
//!
//! Bodies are streamed into a staging file under the cache's `tmp/`
//! directory while both digests are computed. Only a body whose sha256
//! matches the declared checksum (when one is declared) is admitted.

use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::digest::{Digests, DualHasher};
use crate::cache::{AssetCache, CacheHit};
use crate::cancel::CancelFlag;
use crate::error::{BuildError, BuildResult, IoContext};

/// Retry and timeout settings for remote fetches.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Base delay; doubles after each failed attempt (max 16x).
    pub retry_delay: Duration,
    /// Per-request timeout.
    pub timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_secs(2),
            timeout: Some(Duration::from_secs(600)),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl FetchPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        // attempt is 1-based; the first retry waits the base delay.
        self.retry_delay * (1u32 << (attempt.saturating_sub(2)).min(4))
    }

    pub fn client(&self) -> BuildResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("autoinstall-builder/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(self.connect_timeout);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder.build().map_err(|e| BuildError::Network {
            asset: "<client>".to_string(),
            url: String::new(),
            attempts: 0,
            message: format!("creating HTTP client: {}", e),
        })
    }
}

enum AttemptError {
    /// Worth another attempt.
    Transient(String),
    /// Give up immediately.
    Fatal(BuildError),
}

/// Resolve a remote asset to a verified cache entry.
pub(crate) async fn fetch_remote(
    client: &reqwest::Client,
    cache: &AssetCache,
    asset: &str,
    url: &str,
    expected_sha256: Option<&str>,
    policy: &FetchPolicy,
    cancel: &CancelFlag,
) -> BuildResult<CacheHit> {
    if let Some(expected) = expected_sha256 {
        if let Some(hit) = cache.get(expected)? {
            debug!(asset, sha256 = expected, "cache hit; skipping download");
            cache.record_remote(url, &hit.digests)?;
            return Ok(hit);
        }
    }

    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();
    let mut fetched = None;
    for attempt in 1..=attempts {
        cancel.check()?;
        if attempt > 1 {
            let delay = policy.backoff(attempt);
            warn!(asset, attempt, attempts, ?delay, error = %last_error, "retrying download");
            tokio::time::sleep(delay).await;
            cancel.check()?;
        }
        match fetch_once(client, cache, url, cancel).await {
            Ok(result) => {
                fetched = Some(result);
                break;
            }
            Err(AttemptError::Transient(message)) => last_error = message,
            Err(AttemptError::Fatal(BuildError::Network { message, .. })) => {
                return Err(network_error(asset, url, attempt, message))
            }
            Err(AttemptError::Fatal(err)) => return Err(err),
        }
    }
    let Some((staged, digests)) = fetched else {
        return Err(network_error(asset, url, attempts, last_error));
    };

    if let Some(expected) = expected_sha256 {
        if digests.sha256 != expected {
            // Dropping `staged` deletes the file; nothing reaches the cache.
            drop(staged);
            return Err(BuildError::Integrity {
                asset: asset.to_string(),
                expected: expected.to_string(),
                actual: digests.sha256,
            });
        }
    }

    let path = cache.admit(staged, &digests)?;
    cache.record_remote(url, &digests)?;
    info!(asset, url, sha256 = %digests.sha256, size = digests.size, "fetched");
    Ok(CacheHit { path, digests })
}

fn network_error(asset: &str, url: &str, attempts: u32, message: String) -> BuildError {
    BuildError::Network {
        asset: asset.to_string(),
        url: url.to_string(),
        attempts,
        message,
    }
}

async fn fetch_once(
    client: &reqwest::Client,
    cache: &AssetCache,
    url: &str,
    cancel: &CancelFlag,
) -> Result<(NamedTempFile, Digests), AttemptError> {
    let response = client.get(url).send().await.map_err(|e| {
        if is_transient_send_error(&e) {
            AttemptError::Transient(format!("request failed: {}", e))
        } else {
            AttemptError::Fatal(BuildError::Network {
                asset: String::new(),
                url: url.to_string(),
                attempts: 1,
                message: e.to_string(),
            })
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let message = format!(
            "HTTP {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown error")
        );
        return Err(if is_retryable_status(status) {
            AttemptError::Transient(message)
        } else {
            AttemptError::Fatal(BuildError::Network {
                asset: String::new(),
                url: url.to_string(),
                attempts: 1,
                message,
            })
        });
    }

    let tmp_dir = cache.tmp_dir();
    let staged = NamedTempFile::new_in(&tmp_dir)
        .io_context(|| format!("creating staging file in '{}'", tmp_dir.display()))
        .map_err(AttemptError::Fatal)?;
    let std_file = staged
        .as_file()
        .try_clone()
        .io_context(|| format!("opening staging file '{}'", staged.path().display()))
        .map_err(AttemptError::Fatal)?;
    let mut file = tokio::fs::File::from_std(std_file);

    let mut hasher = DualHasher::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(AttemptError::Fatal(BuildError::Cancelled));
        }
        let chunk =
            chunk.map_err(|e| AttemptError::Transient(format!("reading body: {}", e)))?;
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .io_context(|| format!("writing staging file '{}'", staged.path().display()))
            .map_err(AttemptError::Fatal)?;
    }
    file.flush()
        .await
        .io_context(|| format!("flushing staging file '{}'", staged.path().display()))
        .map_err(AttemptError::Fatal)?;

    Ok((staged, hasher.finalize()))
}

/// Only timeouts and failed connections are worth another attempt; a
/// request that could not be built fails the same way every time.
fn is_transient_send_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}
