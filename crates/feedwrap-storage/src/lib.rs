//! Staged output files, HTTP fetch/put with retry, and delivery destinations.

pub mod sftp;
mod transfer;

pub use sftp::{SftpEndpoint, SftpError, SftpSession};
pub use transfer::{
    object_key, s3_client, transfer_for, Delivery, DestinationConfig, HttpPutTransfer,
    LocalDirTransfer, S3Transfer, SftpTransfer, Transfer, TransferError,
};

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredOutput {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: u64,
}

/// Root directory that normalized feed files are committed into.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Opens a temp file beside `relative_path`; the final name only appears on commit.
    pub fn stage(&self, relative_path: impl AsRef<Path>) -> anyhow::Result<StagedOutput> {
        let relative_path = relative_path.as_ref().to_path_buf();
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .with_context(|| format!("creating output directory {}", parent.display()))?;

        let file_name = absolute_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| format!("opening staged output {}", temp_path.display()))?;

        Ok(StagedOutput {
            relative_path,
            absolute_path,
            temp_path,
            writer: Some(BufWriter::new(file)),
            hasher: Sha256::new(),
            byte_size: 0,
            committed: false,
        })
    }
}

/// Output file under construction. Hashes bytes as they pass through; deleted on drop
/// unless [`StagedOutput::commit`] succeeded.
pub struct StagedOutput {
    relative_path: PathBuf,
    absolute_path: PathBuf,
    temp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    hasher: Sha256,
    byte_size: u64,
    committed: bool,
}

impl StagedOutput {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn final_path(&self) -> &Path {
        &self.absolute_path
    }

    pub fn bytes_written(&self) -> u64 {
        self.byte_size
    }

    pub fn commit(mut self) -> anyhow::Result<StoredOutput> {
        let writer = self
            .writer
            .take()
            .context("staged output was already closed")?;
        let file = writer
            .into_inner()
            .map_err(|err| err.into_error())
            .with_context(|| format!("flushing staged output {}", self.temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing staged output {}", self.temp_path.display()))?;
        drop(file);

        fs::rename(&self.temp_path, &self.absolute_path).with_context(|| {
            format!(
                "renaming staged output {} -> {}",
                self.temp_path.display(),
                self.absolute_path.display()
            )
        })?;
        self.committed = true;

        Ok(StoredOutput {
            content_hash: hex::encode(std::mem::take(&mut self.hasher).finalize()),
            relative_path: self.relative_path.clone(),
            absolute_path: self.absolute_path.clone(),
            byte_size: self.byte_size,
        })
    }
}

impl Write for StagedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("staged output is closed"))?;
        let written = writer.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.byte_size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for StagedOutput {
    fn drop(&mut self) {
        if !self.committed {
            self.writer.take();
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

pub fn modified_at(path: &Path) -> io::Result<DateTime<Utc>> {
    Ok(fs::metadata(path)?.modified()?.into())
}

/// Whether `path` exists and was last modified on `day` (UTC).
pub fn modified_on(path: &Path, day: NaiveDate) -> bool {
    modified_at(path)
        .map(|at| at.date_naive() == day)
        .unwrap_or(false)
}

/// 5xx and 429 are worth another attempt; any other failure status is final.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Connection drops and timeouts are transient; body, decode and redirect errors are not.
pub fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Capped exponential backoff between attempts at one request.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// `base_delay * 2^attempt`, never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        u32::try_from(attempt)
            .ok()
            .and_then(|exp| 2u32.checked_pow(exp))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// How long to wait before retrying after failed attempt `attempt`, or `None`
    /// once the retry budget is spent.
    pub fn retry_after(&self, attempt: usize) -> Option<Duration> {
        (attempt < self.max_retries).then(|| self.delay_for_attempt(attempt))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            max_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub final_url: String,
    pub bytes: u64,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("retries exhausted for {url}")]
    Exhausted { url: String },
    #[error("writing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<reqwest::Response, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        for attempt in 0..=self.backoff.max_retries {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }

                    if let Some(delay) = self
                        .backoff
                        .retry_after(attempt)
                        .filter(|_| is_retryable_status(status))
                    {
                        warn!(url, %status, attempt, delay_ms = delay.as_millis() as u64, "retrying after http status");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if let Some(delay) = self
                        .backoff
                        .retry_after(attempt)
                        .filter(|_| is_retryable_error(&err))
                    {
                        warn!(url, error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying after request error");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Exhausted {
            url: url.to_string(),
        })
    }

    /// Streams `url` into `dest` through a temp file, so `dest` is either complete or untouched.
    pub async fn download_to(
        &self,
        feed_id: &str,
        url: &str,
        dest: &Path,
    ) -> Result<DownloadedFile, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        self.download_inner(url, dest)
            .instrument(info_span!("http_download", feed_id, url))
            .await
    }

    async fn download_inner(&self, url: &str, dest: &Path) -> Result<DownloadedFile, FetchError> {
        let mut resp = self.send_with_retry(url, || self.client.get(url)).await?;
        let final_url = resp.url().to_string();

        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| FetchError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        let temp_path = parent.join(format!(".{}.download", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|source| FetchError::Io {
                path: temp_path.clone(),
                source,
            })?;

        let streamed = stream_body(&mut resp, &mut file, &temp_path).await;
        drop(file);

        let bytes = match streamed {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };
        if let Err(source) = tokio::fs::rename(&temp_path, dest).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(FetchError::Io {
                path: dest.to_path_buf(),
                source,
            });
        }

        Ok(DownloadedFile {
            path: dest.to_path_buf(),
            final_url,
            bytes,
        })
    }

    pub async fn put_bytes(
        &self,
        url: &str,
        body: Vec<u8>,
        bearer: Option<&str>,
    ) -> Result<StatusCode, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let span = info_span!("http_put", url, bytes = body.len());
        let resp = self
            .send_with_retry(url, || {
                let request = self.client.put(url).body(body.clone());
                match bearer {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                }
            })
            .instrument(span)
            .await?;
        Ok(resp.status())
    }

    /// `Last-Modified` of `url`, or `None` when the object does not exist.
    pub async fn last_modified(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let result = self
            .send_with_retry(url, || {
                let request = self.client.head(url);
                match bearer {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                }
            })
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(FetchError::HttpStatus { status: 404, .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        Ok(resp
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date))
    }
}

async fn stream_body(
    resp: &mut reqwest::Response,
    file: &mut tokio::fs::File,
    temp_path: &Path,
) -> Result<u64, FetchError> {
    let io_err = |source| FetchError::Io {
        path: temp_path.to_path_buf(),
        source,
    };
    let mut bytes = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        file.write_all(&chunk).await.map_err(io_err)?;
        bytes += chunk.len() as u64;
    }
    file.flush().await.map_err(io_err)?;
    Ok(bytes)
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}
