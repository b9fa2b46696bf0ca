//! Feed pipeline orchestration: registry loading, per-feed normalization fan-out,
//! delivery, run reports and the optional cron scheduler.

pub mod inspect;
mod normalize;
mod registry;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use feedwrap_core::{ColumnMap, NormalizeError, NormalizeSummary};
use feedwrap_sources::{render_date_template, source_for, SourceContext};
use feedwrap_storage::{transfer_for, Delivery, HttpClientConfig, HttpFetcher, OutputStore};
use serde::Serialize;
use tokio::fs;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use normalize::{FeedNormalizer, NormalizeOptions, PROGRESS_EVERY};
pub use registry::{AliasList, ColumnMapConfig, DelimiterSetting, FeedConfig, FeedRegistry};

pub const CRATE_NAME: &str = "feedwrap-pipeline";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub registry_path: PathBuf,
    pub output_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub max_parallel: usize,
    pub feed_timeout: Option<Duration>,
    pub scheduler_enabled: bool,
    pub cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            registry_path: std::env::var("FEEDWRAP_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./feeds.yaml")),
            output_dir: std::env::var("FEEDWRAP_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./processed")),
            staging_dir: std::env::var("FEEDWRAP_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./incoming")),
            reports_dir: std::env::var("FEEDWRAP_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            max_parallel: std::env::var("FEEDWRAP_MAX_PARALLEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(5),
            feed_timeout: std::env::var("FEEDWRAP_FEED_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            scheduler_enabled: std::env::var("FEEDWRAP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cron: std::env::var("FEEDWRAP_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            user_agent: std::env::var("FEEDWRAP_USER_AGENT")
                .unwrap_or_else(|_| "feedwrap/0.1".to_string()),
            http_timeout_secs: std::env::var("FEEDWRAP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }

    /// Everything under one directory: `feeds.yaml`, `processed/`, `incoming/`, `reports/`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            registry_path: root.join("feeds.yaml"),
            output_dir: root.join("processed"),
            staging_dir: root.join("incoming"),
            reports_dir: root.join("reports"),
            max_parallel: 5,
            feed_timeout: None,
            scheduler_enabled: false,
            cron: "0 0 6 * * *".to_string(),
            user_agent: "feedwrap/0.1".to_string(),
            http_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Normalized,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedOutcome {
    pub feed_id: String,
    pub status: FeedStatus,
    pub input_path: Option<String>,
    pub downloaded: bool,
    pub delimiter: Option<String>,
    pub output_path: Option<String>,
    pub sha256: Option<String>,
    pub bytes: Option<u64>,
    pub summary: Option<NormalizeSummary>,
    pub delivery: Option<Delivery>,
    pub delivery_skipped: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl FeedOutcome {
    fn new(feed_id: &str) -> Self {
        Self {
            feed_id: feed_id.to_string(),
            status: FeedStatus::Failed,
            input_path: None,
            downloaded: false,
            delimiter: None,
            output_path: None,
            sha256: None,
            bytes: None,
            summary: None,
            delivery: None,
            delivery_skipped: false,
            error: None,
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub selected_feeds: usize,
    pub normalized: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows_written: u64,
    pub malformed_rows: u64,
    pub reports_dir: String,
    pub outcomes: Vec<FeedOutcome>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// A feed that stopped early: skipped (stale input) or failed.
enum FeedStop {
    Skipped(String),
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for FeedStop {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err)
    }
}

struct FeedJob {
    feed: FeedConfig,
    column_map: ColumnMap,
    run_date: NaiveDate,
}

#[derive(Clone)]
pub struct FeedPipeline {
    config: PipelineConfig,
    outputs: OutputStore,
    http: Arc<HttpFetcher>,
}

impl FeedPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let outputs = OutputStore::new(config.output_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            outputs,
            http: Arc::new(http),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Processes every enabled feed (or just `only`) and writes the run reports.
    /// A failing feed is recorded in its outcome; it never aborts the others.
    pub async fn run_once(&self, only: &[String]) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let run_date = started_at.date_naive();
        let registry = FeedRegistry::load(&self.config.registry_path)?;
        let selected = registry.select(only)?;

        let mut jobs = Vec::with_capacity(selected.len());
        for feed in selected {
            jobs.push(FeedJob {
                column_map: registry.column_map_for(feed)?,
                feed: feed.clone(),
                run_date,
            });
        }
        let selected_feeds = jobs.len();
        info!(%run_id, feeds = selected_feeds, max_parallel = self.config.max_parallel, "starting feed run");

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut tasks = JoinSet::new();
        for (position, job) in jobs.into_iter().enumerate() {
            let pipeline = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let span = info_span!("feed", feed_id = %job.feed.feed_id, %run_id);
            tasks.spawn(
                async move {
                    let permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("semaphore not closed");
                    (position, pipeline.process_feed(job, permit).await)
                }
                .instrument(span),
            );
        }

        let mut outcomes = Vec::with_capacity(selected_feeds);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => outcomes.push(entry),
                Err(err) => error!(error = %err, "feed task aborted"),
            }
        }
        outcomes.sort_by_key(|(position, _)| *position);
        let outcomes: Vec<FeedOutcome> = outcomes.into_iter().map(|(_, outcome)| outcome).collect();

        let count = |status: FeedStatus| outcomes.iter().filter(|o| o.status == status).count();
        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        let summary = RunSummary {
            run_id,
            run_date,
            started_at,
            finished_at: Utc::now(),
            selected_feeds,
            normalized: count(FeedStatus::Normalized),
            skipped: count(FeedStatus::Skipped),
            failed: count(FeedStatus::Failed),
            rows_written: outcomes
                .iter()
                .filter_map(|o| o.summary.as_ref())
                .map(|s| s.rows_written)
                .sum(),
            malformed_rows: outcomes
                .iter()
                .filter_map(|o| o.summary.as_ref())
                .map(|s| s.malformed_rows)
                .sum(),
            reports_dir: reports_dir.display().to_string(),
            outcomes,
        };
        self.write_reports(&reports_dir, &summary).await?;

        info!(
            %run_id,
            normalized = summary.normalized,
            skipped = summary.skipped,
            failed = summary.failed,
            "feed run finished"
        );
        Ok(summary)
    }

    async fn process_feed(&self, job: FeedJob, permit: OwnedSemaphorePermit) -> FeedOutcome {
        let started = Instant::now();
        let mut outcome = FeedOutcome::new(&job.feed.feed_id);
        match self.process_feed_inner(&job, permit, &mut outcome).await {
            Ok(()) => {}
            Err(FeedStop::Skipped(reason)) => {
                info!(%reason, "feed skipped");
                outcome.status = FeedStatus::Skipped;
                outcome.error = Some(reason);
            }
            Err(FeedStop::Failed(err)) => {
                let message = format!("{err:#}");
                error!(error = %message, "feed failed");
                outcome.status = FeedStatus::Failed;
                outcome.error = Some(message);
            }
        }
        outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        outcome
    }

    async fn process_feed_inner(
        &self,
        job: &FeedJob,
        permit: OwnedSemaphorePermit,
        outcome: &mut FeedOutcome,
    ) -> Result<(), FeedStop> {
        let feed = &job.feed;
        let ctx = SourceContext {
            feed_id: feed.feed_id.clone(),
            run_date: job.run_date,
            staging_dir: self.config.staging_dir.clone(),
        };

        let source = source_for(&feed.source, Arc::clone(&self.http));
        let resolved = match source.resolve(&ctx).await {
            Ok(resolved) => resolved,
            Err(err) if err.is_skip() => return Err(FeedStop::Skipped(err.to_string())),
            Err(err) => {
                return Err(anyhow!(err)
                    .context(format!("resolving {}", source.describe()))
                    .into())
            }
        };
        outcome.input_path = Some(resolved.path.display().to_string());
        outcome.downloaded = resolved.downloaded;

        let compressed = feed.is_compressed(&resolved.path);
        let delimiter = match feed.delimiter {
            DelimiterSetting::Fixed(delimiter) => delimiter,
            DelimiterSetting::Auto => {
                let path = resolved.path.clone();
                tokio::task::spawn_blocking(move || inspect::sniff_delimiter(&path, compressed))
                    .await
                    .context("delimiter sniffing task panicked")??
            }
        };
        outcome.delimiter = Some(inspect::describe_delimiter(delimiter));

        let output_name = render_date_template(&feed.output_name, job.run_date);
        let mut staged = self.outputs.stage(&output_name)?;
        let cancel = Arc::new(AtomicBool::new(false));
        let normalizer = FeedNormalizer::new(
            NormalizeOptions::new(delimiter)
                .compressed(compressed)
                .column_map(job.column_map.clone())
                .url_rule(feed.url_rule())
                .cancel_flag(Arc::clone(&cancel)),
        );
        let input_path = resolved.path.clone();
        let span = tracing::Span::current();
        // The permit travels with the blocking work so a timed-out feed keeps
        // its slot until the thread has actually stopped.
        let mut handle = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let file = File::open(&input_path)
                .map_err(|source| NormalizeError::InputUnreadable { row: None, source })?;
            let summary = normalizer.normalize(BufReader::new(file), &mut staged)?;
            Ok::<_, NormalizeError>((summary, staged, permit))
        });

        let joined = match self.config.feed_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    cancel.store(true, Ordering::Relaxed);
                    // Wait for the worker to notice; its staged file is discarded on the way out.
                    let _ = handle.await;
                    return Err(anyhow!(
                        "normalization timed out after {}ms",
                        limit.as_millis()
                    )
                    .into());
                }
            },
            None => handle.await,
        };
        let (summary, staged, _permit) = joined
            .context("normalizer task panicked")?
            .with_context(|| format!("normalizing {}", resolved.path.display()))?;
        if summary.malformed_rows > 0 {
            warn!(malformed_rows = summary.malformed_rows, "dropped malformed rows");
        }
        outcome.summary = Some(summary);

        let stored = staged.commit()?;
        outcome.output_path = Some(stored.absolute_path.display().to_string());
        outcome.sha256 = Some(stored.content_hash.clone());
        outcome.bytes = Some(stored.byte_size);
        outcome.status = FeedStatus::Normalized;

        if let Some(destination) = &feed.destination {
            let transfer = transfer_for(destination, Arc::clone(&self.http))
                .await
                .with_context(|| format!("configuring delivery for {}", feed.feed_id))?;
            if transfer
                .delivered_on(&output_name, job.run_date)
                .await
                .with_context(|| format!("checking {}", transfer.describe()))?
            {
                info!(destination = %transfer.describe(), "already delivered today; not re-sending");
                outcome.delivery_skipped = true;
            } else {
                let delivery = transfer
                    .deliver(&stored.absolute_path, &output_name)
                    .await
                    .with_context(|| format!("delivering to {}", transfer.describe()))?;
                outcome.delivery = Some(delivery);
            }
        }
        Ok(())
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.cron.clone();
        let pipeline = self.clone();
        let job = Job::new_async(&cron, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once(&[]).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        normalized = summary.normalized,
                        failed = summary.failed,
                        "scheduled feed run finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled feed run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn write_reports(&self, reports_dir: &Path, summary: &RunSummary) -> Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), json)
            .await
            .context("writing run_summary.json")?;
        fs::write(reports_dir.join("run_brief.md"), render_brief(summary))
            .await
            .context("writing run_brief.md")?;
        Ok(())
    }
}

pub fn render_brief(summary: &RunSummary) -> String {
    let feed_lines = summary
        .outcomes
        .iter()
        .map(|o| match o.status {
            FeedStatus::Normalized => {
                let rows = o.summary.as_ref().map_or(0, |s| s.rows_written);
                let malformed = o.summary.as_ref().map_or(0, |s| s.malformed_rows);
                let delivered = match (&o.delivery, o.delivery_skipped) {
                    (Some(d), _) => format!(", delivered to {}", d.destination),
                    (None, true) => ", already delivered today".to_string(),
                    (None, false) => String::new(),
                };
                format!(
                    "- {}: normalized {} rows ({} malformed) -> {}{}",
                    o.feed_id,
                    rows,
                    malformed,
                    o.output_path.as_deref().unwrap_or("?"),
                    delivered
                )
            }
            FeedStatus::Skipped => format!(
                "- {}: skipped ({})",
                o.feed_id,
                o.error.as_deref().unwrap_or("no reason recorded")
            ),
            FeedStatus::Failed => format!(
                "- {}: FAILED: {}",
                o.feed_id,
                o.error.as_deref().unwrap_or("unknown error")
            ),
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# Feed Run Brief\n\n- Run ID: `{}`\n- Run date: {}\n- Started: {}\n- Finished: {}\n- Feeds: {} (normalized {}, skipped {}, failed {})\n- Rows written: {}\n- Malformed rows dropped: {}\n\n## Feeds\n{}\n",
        summary.run_id,
        summary.run_date,
        summary.started_at,
        summary.finished_at,
        summary.selected_feeds,
        summary.normalized,
        summary.skipped,
        summary.failed,
        summary.rows_written,
        summary.malformed_rows,
        feed_lines
    )
}

pub async fn run_once_from_env(only: &[String]) -> Result<RunSummary> {
    let pipeline = FeedPipeline::new(PipelineConfig::from_env())?;
    pipeline.run_once(only).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(feed_id: &str, status: FeedStatus) -> FeedOutcome {
        let mut outcome = FeedOutcome::new(feed_id);
        outcome.status = status;
        outcome
    }

    #[test]
    fn brief_lists_each_feed_status() {
        let mut normalized = outcome("wayfair-us", FeedStatus::Normalized);
        normalized.summary = Some(NormalizeSummary {
            rows_written: 42,
            malformed_rows: 1,
            ..NormalizeSummary::default()
        });
        normalized.output_path = Some("processed/amp_wayfair.tsv.gz".to_string());
        let mut skipped = outcome("houzz-us", FeedStatus::Skipped);
        skipped.error = Some("input was last modified yesterday".to_string());
        let mut failed = outcome("bbb-ca", FeedStatus::Failed);
        failed.error = Some("invalid gzip input".to_string());

        let now = Utc::now();
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            run_date: now.date_naive(),
            started_at: now,
            finished_at: now,
            selected_feeds: 3,
            normalized: 1,
            skipped: 1,
            failed: 1,
            rows_written: 42,
            malformed_rows: 1,
            reports_dir: "reports/x".to_string(),
            outcomes: vec![normalized, skipped, failed],
        };
        let brief = render_brief(&summary);
        assert!(brief.contains("- wayfair-us: normalized 42 rows (1 malformed) -> processed/amp_wayfair.tsv.gz"));
        assert!(brief.contains("- houzz-us: skipped (input was last modified yesterday)"));
        assert!(brief.contains("- bbb-ca: FAILED: invalid gzip input"));
        assert!(summary.has_failures());
    }

    #[test]
    fn rooted_config_keeps_everything_under_root() {
        let config = PipelineConfig::rooted_at(Path::new("/srv/feedwrap"));
        assert_eq!(config.registry_path, PathBuf::from("/srv/feedwrap/feeds.yaml"));
        assert_eq!(config.reports_dir, PathBuf::from("/srv/feedwrap/reports"));
        assert_eq!(config.max_parallel, 5);
    }
}
