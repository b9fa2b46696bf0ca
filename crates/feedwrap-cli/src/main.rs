use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use feedwrap_core::{ColumnMap, UrlRewriteRule, DEFAULT_URL_COLUMN};
use feedwrap_pipeline::inspect::{self, describe_delimiter, is_gzip_path};
use feedwrap_pipeline::{
    ColumnMapConfig, DelimiterSetting, FeedNormalizer, FeedPipeline, FeedStatus,
    NormalizeOptions, PipelineConfig,
};
use feedwrap_storage::OutputStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "feedwrap")]
#[command(about = "Normalize vendor product feeds into tab-delimited gzip with tracking links")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process the feeds in the registry once.
    Run {
        /// Only run these feed ids (repeatable).
        #[arg(long = "feed")]
        feeds: Vec<String>,
    },
    /// Normalize a single file without a registry.
    Normalize {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Single ASCII character, `\t`, or `auto`.
        #[arg(long, default_value = ",")]
        delimiter: DelimiterSetting,
        /// Defaults to true for `.gz` inputs.
        #[arg(long)]
        compressed: Option<bool>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long, default_value = DEFAULT_URL_COLUMN)]
        url_column: String,
        /// YAML file with `columns` and/or `renames`.
        #[arg(long)]
        column_map: Option<PathBuf>,
    },
    /// Print the first lines of a (possibly gzipped) file.
    Head {
        file: PathBuf,
        #[arg(short = 'n', long, default_value_t = 30)]
        lines: usize,
    },
    /// Find the first row of a normalized file whose column contains a value.
    Find {
        file: PathBuf,
        #[arg(long)]
        column: String,
        #[arg(long)]
        needle: String,
    },
    /// Guess the delimiter of a raw feed file.
    Sniff { file: PathBuf },
    /// Run the registry on the configured cron schedule until interrupted.
    Schedule,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stderr keeps stdout clean for command output
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { feeds: Vec::new() }) {
        Commands::Run { feeds } => {
            let summary = feedwrap_pipeline::run_once_from_env(&feeds).await?;
            println!(
                "run complete: run_id={} feeds={} normalized={} skipped={} failed={} rows={} reports={}",
                summary.run_id,
                summary.selected_feeds,
                summary.normalized,
                summary.skipped,
                summary.failed,
                summary.rows_written,
                summary.reports_dir
            );
            for outcome in &summary.outcomes {
                if outcome.status == FeedStatus::Failed {
                    println!(
                        "  {} failed: {}",
                        outcome.feed_id,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            if summary.has_failures() {
                bail!("{} feed(s) failed", summary.failed);
            }
        }
        Commands::Normalize {
            input,
            output,
            delimiter,
            compressed,
            base_url,
            url_column,
            column_map,
        } => {
            let column_map = match column_map {
                Some(path) => load_column_map(&path)?,
                None => ColumnMap::new(),
            };
            let url_rule = base_url.map(|base| UrlRewriteRule::new(base).with_column(url_column));
            tokio::task::spawn_blocking(move || {
                normalize_file(&input, &output, delimiter, compressed, column_map, url_rule)
            })
            .await
            .context("normalize task panicked")??;
        }
        Commands::Head { file, lines } => {
            for line in inspect::head(&file, is_gzip_path(&file), lines)? {
                println!("{line}");
            }
        }
        Commands::Find {
            file,
            column,
            needle,
        } => match inspect::find_record(&file, is_gzip_path(&file), &column, &needle)? {
            Some(found) => println!("line {}: {}", found.line_no, found.line),
            None => println!("no row with {column} containing {needle:?}"),
        },
        Commands::Sniff { file } => {
            let delimiter = inspect::sniff_delimiter(&file, is_gzip_path(&file))?;
            println!("{}", describe_delimiter(delimiter));
        }
        Commands::Schedule => {
            let mut config = PipelineConfig::from_env();
            config.scheduler_enabled = true;
            let cron = config.cron.clone();
            let pipeline = FeedPipeline::new(config)?;
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn load_column_map(path: &Path) -> Result<ColumnMap> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: ColumnMapConfig =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config.to_column_map())
}

fn normalize_file(
    input: &Path,
    output: &Path,
    delimiter: DelimiterSetting,
    compressed: Option<bool>,
    column_map: ColumnMap,
    url_rule: Option<UrlRewriteRule>,
) -> Result<()> {
    let compressed = compressed.unwrap_or_else(|| is_gzip_path(input));
    let delimiter = match delimiter {
        DelimiterSetting::Fixed(delimiter) => delimiter,
        DelimiterSetting::Auto => inspect::sniff_delimiter(input, compressed)?,
    };

    let file_name = output
        .file_name()
        .with_context(|| format!("{} has no file name", output.display()))?;
    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut staged = OutputStore::new(dir).stage(file_name)?;

    let normalizer = FeedNormalizer::new(
        NormalizeOptions::new(delimiter)
            .compressed(compressed)
            .column_map(column_map)
            .url_rule(url_rule),
    );
    let reader = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let summary = normalizer
        .normalize(BufReader::new(reader), &mut staged)
        .with_context(|| format!("normalizing {}", input.display()))?;
    let stored = staged.commit()?;

    println!(
        "normalized {} -> {}: rows={} malformed={} padded={} urls={} sha256={}",
        input.display(),
        stored.absolute_path.display(),
        summary.rows_written,
        summary.malformed_rows,
        summary.padded_rows,
        summary.urls_rewritten,
        stored.content_hash
    );
    Ok(())
}
