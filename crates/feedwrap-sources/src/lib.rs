//! Feed source contracts: where a feed's raw input file comes from on a given run.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use feedwrap_storage::sftp::remote_join;
use feedwrap_storage::{modified_on, FetchError, HttpFetcher, SftpEndpoint, SftpError};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinError;
use tracing::info;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Path template; `{date}` expands to the run date as `YYYYMMDD`.
    Local {
        path: String,
        #[serde(default)]
        require_fresh: bool,
    },
    Http {
        url: String,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        require_fresh: bool,
    },
    /// A file in `remote_dir` on an SFTP server; `file` is a template.
    Sftp {
        #[serde(flatten)]
        endpoint: SftpEndpoint,
        remote_dir: String,
        file: String,
        /// Local name under staging; defaults to the rendered remote name.
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        require_fresh: bool,
    },
}

#[derive(Debug, Clone)]
pub struct SourceContext {
    pub feed_id: String,
    pub run_date: NaiveDate,
    pub staging_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedInput {
    pub path: PathBuf,
    pub downloaded: bool,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("input {} does not exist", .0.display())]
    NotFound(PathBuf),
    #[error("input {} was last modified {modified_at}, not on {run_date}", .location)]
    Stale {
        location: String,
        modified_at: DateTime<Utc>,
        run_date: NaiveDate,
    },
    #[error("cannot derive a file name from {0}; set file_name")]
    NoFileName(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Sftp(#[from] SftpError),
    #[error("sftp worker stopped: {0}")]
    Worker(#[from] JoinError),
    #[error("inspecting {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SourceError {
    /// Stale inputs are skipped for the run rather than treated as failures.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    fn describe(&self) -> String;

    async fn resolve(&self, ctx: &SourceContext) -> Result<ResolvedInput, SourceError>;
}

pub fn source_for(config: &SourceConfig, http: Arc<HttpFetcher>) -> Box<dyn FeedSource> {
    match config {
        SourceConfig::Local {
            path,
            require_fresh,
        } => Box::new(LocalFileSource::new(path.clone(), *require_fresh)),
        SourceConfig::Http {
            url,
            file_name,
            require_fresh,
        } => Box::new(HttpSource::new(
            url.clone(),
            file_name.clone(),
            *require_fresh,
            http,
        )),
        SourceConfig::Sftp {
            endpoint,
            remote_dir,
            file,
            file_name,
            require_fresh,
        } => Box::new(SftpSource::new(
            endpoint.clone(),
            remote_dir.clone(),
            file.clone(),
            file_name.clone(),
            *require_fresh,
        )),
    }
}

pub fn render_date_template(template: &str, run_date: NaiveDate) -> String {
    template.replace("{date}", &run_date.format("%Y%m%d").to_string())
}

async fn modified_time(path: &Path) -> Result<DateTime<Utc>, SourceError> {
    let meta = match fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(SourceError::NotFound(path.to_path_buf()))
        }
        Err(source) => {
            return Err(SourceError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let modified = meta.modified().map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(modified.into())
}

#[derive(Debug, Clone)]
pub struct LocalFileSource {
    template: String,
    require_fresh: bool,
}

impl LocalFileSource {
    pub fn new(template: impl Into<String>, require_fresh: bool) -> Self {
        Self {
            template: template.into(),
            require_fresh,
        }
    }
}

#[async_trait]
impl FeedSource for LocalFileSource {
    fn describe(&self) -> String {
        format!("local:{}", self.template)
    }

    async fn resolve(&self, ctx: &SourceContext) -> Result<ResolvedInput, SourceError> {
        let path = PathBuf::from(render_date_template(&self.template, ctx.run_date));
        let modified_at = modified_time(&path).await?;
        if self.require_fresh && modified_at.date_naive() != ctx.run_date {
            return Err(SourceError::Stale {
                location: path.display().to_string(),
                modified_at,
                run_date: ctx.run_date,
            });
        }
        Ok(ResolvedInput {
            path,
            downloaded: false,
            modified_at: Some(modified_at),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpSource {
    url: String,
    file_name: Option<String>,
    require_fresh: bool,
    http: Arc<HttpFetcher>,
}

impl HttpSource {
    pub fn new(
        url: impl Into<String>,
        file_name: Option<String>,
        require_fresh: bool,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            url: url.into(),
            file_name,
            require_fresh,
            http,
        }
    }

    /// Where the downloaded copy lives under the staging directory.
    pub fn staged_path(&self, ctx: &SourceContext) -> Result<PathBuf, SourceError> {
        let url = render_date_template(&self.url, ctx.run_date);
        let file_name = match &self.file_name {
            Some(name) => render_date_template(name, ctx.run_date),
            None => file_name_from_url(&url).ok_or_else(|| SourceError::NoFileName(url.clone()))?,
        };
        Ok(ctx.staging_dir.join(&ctx.feed_id).join(file_name))
    }
}

/// Last path segment of `url`, percent-decoded. `None` when the path ends in `/`
/// or the segment would not be a plain file name.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    let name = percent_decode_str(segment).decode_utf8().ok()?;
    (!name.is_empty() && !name.contains(['/', '\\']) && name != "..").then(|| name.into_owned())
}

#[async_trait]
impl FeedSource for HttpSource {
    fn describe(&self) -> String {
        format!("http:{}", self.url)
    }

    async fn resolve(&self, ctx: &SourceContext) -> Result<ResolvedInput, SourceError> {
        let dest = self.staged_path(ctx)?;
        if modified_on(&dest, ctx.run_date) {
            info!(feed_id = %ctx.feed_id, path = %dest.display(), "staged copy is from today; skipping download");
            let modified_at = modified_time(&dest).await?;
            return Ok(ResolvedInput {
                path: dest,
                downloaded: false,
                modified_at: Some(modified_at),
            });
        }

        let url = render_date_template(&self.url, ctx.run_date);
        if self.require_fresh {
            if let Some(modified_at) = self.http.last_modified(&url, None).await? {
                if modified_at.date_naive() != ctx.run_date {
                    return Err(SourceError::Stale {
                        location: url,
                        modified_at,
                        run_date: ctx.run_date,
                    });
                }
            }
        }

        let downloaded = self.http.download_to(&ctx.feed_id, &url, &dest).await?;
        info!(feed_id = %ctx.feed_id, bytes = downloaded.bytes, path = %dest.display(), "downloaded feed");
        Ok(ResolvedInput {
            path: dest,
            downloaded: true,
            modified_at: Some(Utc::now()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SftpSource {
    endpoint: SftpEndpoint,
    remote_dir: String,
    file: String,
    file_name: Option<String>,
    require_fresh: bool,
}

impl SftpSource {
    pub fn new(
        endpoint: SftpEndpoint,
        remote_dir: impl Into<String>,
        file: impl Into<String>,
        file_name: Option<String>,
        require_fresh: bool,
    ) -> Self {
        Self {
            endpoint,
            remote_dir: remote_dir.into(),
            file: file.into(),
            file_name,
            require_fresh,
        }
    }

    pub fn remote_path(&self, run_date: NaiveDate) -> String {
        remote_join(&self.remote_dir, &render_date_template(&self.file, run_date))
    }

    pub fn staged_path(&self, ctx: &SourceContext) -> PathBuf {
        let name = match &self.file_name {
            Some(name) => render_date_template(name, ctx.run_date),
            None => render_date_template(&self.file, ctx.run_date),
        };
        ctx.staging_dir.join(&ctx.feed_id).join(name)
    }
}

#[async_trait]
impl FeedSource for SftpSource {
    fn describe(&self) -> String {
        format!("sftp:{}{}", self.endpoint.address(), remote_join(&self.remote_dir, &self.file))
    }

    async fn resolve(&self, ctx: &SourceContext) -> Result<ResolvedInput, SourceError> {
        let dest = self.staged_path(ctx);
        if modified_on(&dest, ctx.run_date) {
            info!(feed_id = %ctx.feed_id, path = %dest.display(), "staged copy is from today; skipping download");
            let modified_at = modified_time(&dest).await?;
            return Ok(ResolvedInput {
                path: dest,
                downloaded: false,
                modified_at: Some(modified_at),
            });
        }

        let endpoint = self.endpoint.clone();
        let remote = self.remote_path(ctx.run_date);
        let require_fresh = self.require_fresh;
        let run_date = ctx.run_date;
        let local = dest.clone();
        let (modified_at, bytes) = tokio::task::spawn_blocking(move || {
            let session = endpoint.connect()?;
            let modified_at = session.modified_at(&remote)?;
            let Some(modified_at) = modified_at else {
                return Err(SourceError::NotFound(PathBuf::from(&remote)));
            };
            if require_fresh && modified_at.date_naive() != run_date {
                return Err(SourceError::Stale {
                    location: remote,
                    modified_at,
                    run_date,
                });
            }
            let bytes = session.download(&remote, &local)?;
            Ok((modified_at, bytes))
        })
        .await??;

        info!(feed_id = %ctx.feed_id, bytes, path = %dest.display(), "downloaded feed over sftp");
        Ok(ResolvedInput {
            path: dest,
            downloaded: true,
            modified_at: Some(modified_at),
        })
    }
}
