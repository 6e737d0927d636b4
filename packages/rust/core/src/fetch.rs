//! HTTP download collaborator with bounded, fixed-delay retry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use stepledger_shared::{FetchConfig, Result, StepLedgerError};
use tracing::{debug, info, instrument, warn};
use url::Url;

const USER_AGENT: &str = concat!("stepledger/", env!("CARGO_PKG_VERSION"));

/// Download behaviour.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Per-attempt request timeout.
    pub timeout: Duration,
    /// Total attempts, at least 1.
    pub retries: u32,
    /// Fixed pause between attempts.
    pub retry_delay: Duration,
    /// Download even if the destination already exists.
    pub overwrite_existing: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from(&FetchConfig::default())
    }
}

impl From<&FetchConfig> for FetchOptions {
    fn from(config: &FetchConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            retries: config.retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            overwrite_existing: config.overwrite_existing,
        }
    }
}

/// Result of a [`download`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub path: PathBuf,
    pub bytes: u64,
    /// The file already existed and was not fetched again.
    pub reused_existing: bool,
    pub attempts: u32,
}

/// Build the shared HTTP client.
pub fn build_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| StepLedgerError::Network(format!("failed to build HTTP client: {e}")))
}

/// File name for `url`: its last path segment, or `download.pdf`.
pub fn file_name_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| "download.pdf".into())
}

/// Fetch `url` into `destination`, retrying failed attempts.
#[instrument(skip_all, fields(%url, dest = %destination.display()))]
pub async fn download(
    client: &Client,
    url: &Url,
    destination: &Path,
    options: &FetchOptions,
) -> Result<Download> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StepLedgerError::io(parent, e))?;
    }

    if !options.overwrite_existing {
        if let Ok(meta) = tokio::fs::metadata(destination).await {
            if meta.is_file() {
                info!("destination exists, skipping download");
                return Ok(Download {
                    path: destination.to_path_buf(),
                    bytes: meta.len(),
                    reused_existing: true,
                    attempts: 0,
                });
            }
        }
    }

    let attempts = options.retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        debug!(attempt, attempts, "fetching");
        match fetch_once(client, url, options.timeout).await {
            Ok(body) => {
                write_atomic(destination, &body).await?;
                info!(attempt, bytes = body.len(), "downloaded");
                return Ok(Download {
                    path: destination.to_path_buf(),
                    bytes: body.len() as u64,
                    reused_existing: false,
                    attempts: attempt,
                });
            }
            Err(e) => {
                warn!(attempt, attempts, error = %e, "download attempt failed");
                last_error = e;
                if attempt < attempts {
                    tokio::time::sleep(options.retry_delay).await;
                }
            }
        }
    }

    Err(StepLedgerError::Network(format!(
        "{url}: giving up after {attempts} attempts: {last_error}"
    )))
}

async fn fetch_once(
    client: &Client,
    url: &Url,
    timeout: Duration,
) -> std::result::Result<Vec<u8>, String> {
    let response = client
        .get(url.as_str())
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("HTTP {status}"));
    }

    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| format!("body read failed: {e}"))
}

async fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".into());
    let temp = path.with_file_name(format!(".{name}.tmp"));

    tokio::fs::write(&temp, body)
        .await
        .map_err(|e| StepLedgerError::io(&temp, e))?;
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| StepLedgerError::io(path, e))
}
