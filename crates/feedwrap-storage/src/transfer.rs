//! Delivery of committed feed files to their destination.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinError;
use tracing::info;
use uuid::Uuid;

use crate::sftp::{remote_join, SftpEndpoint, SftpError};
use crate::{FetchError, HttpFetcher};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DestinationConfig {
    LocalDir {
        path: PathBuf,
    },
    HttpPut {
        url: String,
        /// Environment variable holding a bearer token.
        #[serde(default)]
        token_env: Option<String>,
    },
    Sftp {
        #[serde(flatten)]
        endpoint: SftpEndpoint,
        remote_dir: String,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        region: Option<String>,
        /// Custom endpoint, e.g. LocalStack or another S3-compatible store.
        #[serde(default)]
        endpoint: Option<String>,
        /// Unset means the default AWS credential chain.
        #[serde(default)]
        access_key_env: Option<String>,
        #[serde(default)]
        secret_key_env: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub destination: String,
    pub remote_name: String,
    pub bytes: u64,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("credential variable {0} is not set")]
    MissingCredential(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Sftp(#[from] SftpError),
    #[error("s3 {operation} s3://{bucket}/{key}: {message}")]
    S3 {
        operation: &'static str,
        bucket: String,
        key: String,
        message: String,
    },
    #[error("transfer worker stopped: {0}")]
    Worker(#[from] JoinError),
}

fn env_credential(var: &str) -> Result<String, TransferError> {
    std::env::var(var).map_err(|_| TransferError::MissingCredential(var.to_string()))
}

#[async_trait]
pub trait Transfer: Send + Sync {
    fn describe(&self) -> String;

    /// Whether `remote_name` already holds a delivery made on `day` (UTC).
    async fn delivered_on(&self, remote_name: &str, day: NaiveDate) -> Result<bool, TransferError>;

    async fn deliver(&self, local_path: &Path, remote_name: &str) -> Result<Delivery, TransferError>;
}

pub async fn transfer_for(
    config: &DestinationConfig,
    http: Arc<HttpFetcher>,
) -> Result<Box<dyn Transfer>, TransferError> {
    match config {
        DestinationConfig::LocalDir { path } => Ok(Box::new(LocalDirTransfer::new(path.clone()))),
        DestinationConfig::HttpPut { url, token_env } => {
            let token = token_env.as_deref().map(env_credential).transpose()?;
            Ok(Box::new(HttpPutTransfer::new(url.clone(), token, http)))
        }
        DestinationConfig::Sftp {
            endpoint,
            remote_dir,
        } => {
            endpoint.check_credentials()?;
            Ok(Box::new(SftpTransfer::new(endpoint.clone(), remote_dir.clone())))
        }
        DestinationConfig::S3 {
            bucket,
            prefix,
            region,
            endpoint,
            access_key_env,
            secret_key_env,
        } => {
            let credentials = match (access_key_env, secret_key_env) {
                (Some(access), Some(secret)) => {
                    Some((env_credential(access)?, env_credential(secret)?))
                }
                _ => None,
            };
            let client =
                s3_client(region.as_deref(), endpoint.as_deref(), credentials).await;
            Ok(Box::new(S3Transfer::new(client, bucket.clone(), prefix.clone())))
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalDirTransfer {
    dir: PathBuf,
}

impl LocalDirTransfer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Transfer for LocalDirTransfer {
    fn describe(&self) -> String {
        format!("local_dir:{}", self.dir.display())
    }

    async fn delivered_on(&self, remote_name: &str, day: NaiveDate) -> Result<bool, TransferError> {
        let target = self.dir.join(remote_name);
        match fs::metadata(&target).await {
            Ok(meta) => {
                let modified = meta.modified().map_err(|source| TransferError::Read {
                    path: target.clone(),
                    source,
                })?;
                Ok(DateTime::<Utc>::from(modified).date_naive() == day)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(TransferError::Read {
                path: target,
                source,
            }),
        }
    }

    async fn deliver(&self, local_path: &Path, remote_name: &str) -> Result<Delivery, TransferError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| TransferError::Write {
                path: self.dir.clone(),
                source,
            })?;

        let target = self.dir.join(remote_name);
        let temp_path = self
            .dir
            .join(format!(".{remote_name}.{}.tmp", Uuid::new_v4()));
        let bytes = match fs::copy(local_path, &temp_path).await {
            Ok(bytes) => bytes,
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(TransferError::Read {
                    path: local_path.to_path_buf(),
                    source,
                });
            }
        };
        if let Err(source) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(TransferError::Write {
                path: target,
                source,
            });
        }

        info!(path = %target.display(), bytes, "delivered to local directory");
        Ok(Delivery {
            destination: self.describe(),
            remote_name: remote_name.to_string(),
            bytes,
        })
    }
}

/// Uploads with `PUT <base>/<remote_name>`, e.g. to a presigned bucket prefix or an HTTP drop box.
#[derive(Debug, Clone)]
pub struct HttpPutTransfer {
    base_url: String,
    token: Option<String>,
    http: Arc<HttpFetcher>,
}

impl HttpPutTransfer {
    pub fn new(base_url: impl Into<String>, token: Option<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.into(),
            token,
            http,
        }
    }

    pub fn object_url(&self, remote_name: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), remote_name)
    }
}

#[async_trait]
impl Transfer for HttpPutTransfer {
    fn describe(&self) -> String {
        format!("http_put:{}", self.base_url)
    }

    async fn delivered_on(&self, remote_name: &str, day: NaiveDate) -> Result<bool, TransferError> {
        let modified = self
            .http
            .last_modified(&self.object_url(remote_name), self.token.as_deref())
            .await?;
        Ok(modified.is_some_and(|at| at.date_naive() == day))
    }

    async fn deliver(&self, local_path: &Path, remote_name: &str) -> Result<Delivery, TransferError> {
        let body = fs::read(local_path)
            .await
            .map_err(|source| TransferError::Read {
                path: local_path.to_path_buf(),
                source,
            })?;
        let bytes = body.len() as u64;
        let url = self.object_url(remote_name);
        let status = self
            .http
            .put_bytes(&url, body, self.token.as_deref())
            .await?;

        info!(%url, %status, bytes, "delivered over http");
        Ok(Delivery {
            destination: self.describe(),
            remote_name: remote_name.to_string(),
            bytes,
        })
    }
}

/// Uploads into `remote_dir` on an SFTP server, one session per call.
#[derive(Debug, Clone)]
pub struct SftpTransfer {
    endpoint: SftpEndpoint,
    remote_dir: String,
}

impl SftpTransfer {
    pub fn new(endpoint: SftpEndpoint, remote_dir: impl Into<String>) -> Self {
        Self {
            endpoint,
            remote_dir: remote_dir.into(),
        }
    }

    pub fn remote_path(&self, remote_name: &str) -> String {
        remote_join(&self.remote_dir, remote_name)
    }
}

#[async_trait]
impl Transfer for SftpTransfer {
    fn describe(&self) -> String {
        format!("sftp:{}{}", self.endpoint.address(), self.remote_path(""))
    }

    async fn delivered_on(&self, remote_name: &str, day: NaiveDate) -> Result<bool, TransferError> {
        let endpoint = self.endpoint.clone();
        let remote = self.remote_path(remote_name);
        let modified = tokio::task::spawn_blocking(move || endpoint.connect()?.modified_at(&remote))
            .await??;
        Ok(modified.is_some_and(|at| at.date_naive() == day))
    }

    async fn deliver(&self, local_path: &Path, remote_name: &str) -> Result<Delivery, TransferError> {
        let endpoint = self.endpoint.clone();
        let remote = self.remote_path(remote_name);
        let local = local_path.to_path_buf();
        let target = remote.clone();
        let bytes = tokio::task::spawn_blocking(move || endpoint.connect()?.upload(&local, &target))
            .await??;

        info!(%remote, bytes, "delivered over sftp");
        Ok(Delivery {
            destination: self.describe(),
            remote_name: remote_name.to_string(),
            bytes,
        })
    }
}

/// Client construction follows the usual loader chain: explicit region,
/// optional custom endpoint (path-style), optional static credentials.
pub async fn s3_client(
    region: Option<&str>,
    endpoint: Option<&str>,
    credentials: Option<(String, String)>,
) -> aws_sdk_s3::Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_string()));
    }
    if let Some(endpoint) = endpoint {
        loader = loader.endpoint_url(endpoint);
    }
    if let Some((access_key, secret_key)) = credentials {
        loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "feedwrap",
        ));
    }
    let shared = loader.load().await;

    let builder = aws_sdk_s3::config::Builder::from(&shared);
    let config = if endpoint.is_some() {
        builder.force_path_style(true).build()
    } else {
        builder.build()
    };
    aws_sdk_s3::Client::from_conf(config)
}

/// `prefix/name`, or just `name` without a prefix.
pub fn object_key(prefix: Option<&str>, remote_name: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}/{remote_name}"),
        None => remote_name.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct S3Transfer {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Transfer {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>, prefix: Option<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix,
        }
    }

    fn s3_error(&self, operation: &'static str, key: &str, message: String) -> TransferError {
        TransferError::S3 {
            operation,
            bucket: self.bucket.clone(),
            key: key.to_string(),
            message,
        }
    }
}

#[async_trait]
impl Transfer for S3Transfer {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, object_key(self.prefix.as_deref(), ""))
    }

    async fn delivered_on(&self, remote_name: &str, day: NaiveDate) -> Result<bool, TransferError> {
        let key = object_key(self.prefix.as_deref(), remote_name);
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;
        let output = match head {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {
                return Ok(false)
            }
            Err(err) => {
                return Err(self.s3_error("head", &key, DisplayErrorContext(&err).to_string()))
            }
        };
        Ok(output
            .last_modified()
            .and_then(|at| DateTime::<Utc>::from_timestamp(at.secs(), 0))
            .is_some_and(|at| at.date_naive() == day))
    }

    async fn deliver(&self, local_path: &Path, remote_name: &str) -> Result<Delivery, TransferError> {
        let key = object_key(self.prefix.as_deref(), remote_name);
        let bytes = fs::metadata(local_path)
            .await
            .map_err(|source| TransferError::Read {
                path: local_path.to_path_buf(),
                source,
            })?
            .len();
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|err| TransferError::Read {
                path: local_path.to_path_buf(),
                source: io::Error::other(err),
            })?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .content_type("application/gzip")
            .send()
            .await
            .map_err(|err| self.s3_error("put", &key, DisplayErrorContext(&err).to_string()))?;

        info!(bucket = %self.bucket, %key, bytes, "delivered to s3");
        Ok(Delivery {
            destination: self.describe(),
            remote_name: remote_name.to_string(),
            bytes,
        })
    }
}
