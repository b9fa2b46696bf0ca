use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use feedwrap_pipeline::{FeedPipeline, FeedStatus, PipelineConfig};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::tempdir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(name)
}

fn gunzip_file(path: &Path) -> String {
    let mut text = String::new();
    MultiGzDecoder::new(fs::File::open(path).expect("open output"))
        .read_to_string(&mut text)
        .expect("decode output");
    text
}

fn write_registry(root: &Path) {
    let inputs = root.join("inputs");
    fs::create_dir_all(&inputs).expect("inputs dir");
    fs::copy(fixture("shopping_feed.csv"), inputs.join("shopping_feed.csv")).expect("copy fixture");

    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(b"\"Item\"\tLink\n\"A-1\"\thttps://bbb.example/p/a1?x=1\nA-2\thttps://bbb.example/p/a2\n")
        .expect("compress");
    fs::write(inputs.join("bbb_ca.txt.gz"), encoder.finish().expect("finish")).expect("gz fixture");

    fs::write(inputs.join("broken.csv"), "id,link\n1,https://a.example\n").expect("broken fixture");

    let stale = inputs.join("stale.csv");
    fs::write(&stale, "id,link\n1,https://a.example\n").expect("stale fixture");
    fs::File::options()
        .write(true)
        .open(&stale)
        .expect("open stale")
        .set_modified(SystemTime::now() - Duration::from_secs(3 * 24 * 3600))
        .expect("age stale fixture");

    let registry = format!(
        r#"
profiles:
  shopping:
    columns:
      SKU/id: [id, sku]
      Name: [title]
      Manufacturer: [brand]
      URL: [link]
feeds:
  - feed_id: sample-shopping
    source: {{kind: local, path: "{inputs}/shopping_feed.csv"}}
    profile: shopping
    url_base: "https://t.example/x?a=1"
    output_name: sample_{{date}}.tsv.gz
    destination: {{kind: local_dir, path: "{outbox}"}}
  - feed_id: bbb-ca
    source: {{kind: local, path: "{inputs}/bbb_ca.txt.gz"}}
    delimiter: auto
    column_map:
      renames:
        Link: URL
    url_base: "https://t.example/y?b=2"
    output_name: bbb_ca.tsv.gz
  - feed_id: broken
    source: {{kind: local, path: "{inputs}/broken.csv"}}
    compressed: true
    output_name: broken.tsv.gz
  - feed_id: missing
    source: {{kind: local, path: "{inputs}/missing.csv"}}
    output_name: missing.tsv.gz
  - feed_id: stale
    source: {{kind: local, path: "{inputs}/stale.csv", require_fresh: true}}
    output_name: stale.tsv.gz
  - feed_id: paused
    enabled: false
    source: {{kind: local, path: "{inputs}/shopping_feed.csv"}}
    output_name: paused.tsv.gz
"#,
        inputs = inputs.display(),
        outbox = root.join("outbox").display(),
    );
    fs::write(root.join("feeds.yaml"), registry).expect("registry");
}

#[tokio::test]
async fn run_once_normalizes_delivers_and_isolates_failures() {
    let root = tempdir().expect("tempdir");
    write_registry(root.path());
    let pipeline = FeedPipeline::new(PipelineConfig::rooted_at(root.path())).expect("pipeline");

    let summary = pipeline.run_once(&[]).await.expect("run");
    assert_eq!(summary.selected_feeds, 5);
    assert_eq!(summary.normalized, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 2);

    let ids: Vec<_> = summary.outcomes.iter().map(|o| o.feed_id.as_str()).collect();
    assert_eq!(ids, vec!["sample-shopping", "bbb-ca", "broken", "missing", "stale"]);

    let sample = &summary.outcomes[0];
    assert_eq!(sample.status, FeedStatus::Normalized);
    let counts = sample.summary.as_ref().expect("sample summary");
    assert_eq!(counts.rows_read, 4);
    assert_eq!(counts.rows_written, 4);
    assert_eq!(counts.malformed_rows, 0);
    assert_eq!(counts.padded_rows, 1);
    assert_eq!(counts.urls_rewritten, 3);

    let output = PathBuf::from(sample.output_path.as_deref().expect("output path"));
    let text = gunzip_file(&output);
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("SKU/id\tName\tPrice\tURL\timage_link\tManufacturer\tavailability\tgoogle_product_category\tColor")
    );
    let first: Vec<&str> = lines.next().expect("first row").split('\t').collect();
    assert_eq!(first[1], "Oak Desk, 120cm");
    assert_eq!(
        first[3],
        "https://t.example/x?a=1&cu=https%3A%2F%2Fshop.example.com%2Fp%2Foak-desk&fbu=https%3A%2F%2Fshop.example.com%2Fp%2Foak-desk"
    );
    let second: Vec<&str> = lines.next().expect("second row").split('\t').collect();
    assert_eq!(second[1], "24 Monitor Arm");
    let third: Vec<&str> = lines.next().expect("third row").split('\t').collect();
    assert_eq!(third[3], "");
    let fourth: Vec<&str> = lines.next().expect("fourth row").split('\t').collect();
    assert_eq!(fourth.len(), 9);

    let delivery = sample.delivery.as_ref().expect("delivered");
    let delivered = root.path().join("outbox").join(&delivery.remote_name);
    assert_eq!(fs::read(&delivered).expect("outbox copy"), fs::read(&output).expect("output"));

    let bbb = &summary.outcomes[1];
    assert_eq!(bbb.status, FeedStatus::Normalized);
    assert_eq!(bbb.delimiter.as_deref(), Some("\\t"));
    let bbb_text = gunzip_file(Path::new(bbb.output_path.as_deref().expect("bbb output")));
    assert!(bbb_text.starts_with("Item\tURL\nA-1\thttps://t.example/y?b=2&cu=https%3A%2F%2Fbbb.example%2Fp%2Fa1&fbu="));

    assert!(summary.outcomes[2]
        .error
        .as_deref()
        .is_some_and(|err| err.contains("gzip")));
    assert!(!root.path().join("processed/broken.tsv.gz").exists());
    assert_eq!(summary.outcomes[3].status, FeedStatus::Failed);
    assert_eq!(summary.outcomes[4].status, FeedStatus::Skipped);

    let leftovers: Vec<_> = fs::read_dir(root.path().join("processed"))
        .expect("processed dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());

    let reports = PathBuf::from(&summary.reports_dir);
    let json: serde_json::Value =
        serde_json::from_slice(&fs::read(reports.join("run_summary.json")).expect("summary json"))
            .expect("parse summary");
    assert_eq!(json["normalized"], 2);
    assert_eq!(json["outcomes"][4]["status"], "skipped");
    let brief = fs::read_to_string(reports.join("run_brief.md")).expect("brief");
    assert!(brief.contains("- missing: FAILED"));
}

#[tokio::test]
async fn second_run_does_not_redeliver_todays_file() {
    let root = tempdir().expect("tempdir");
    write_registry(root.path());
    let pipeline = FeedPipeline::new(PipelineConfig::rooted_at(root.path())).expect("pipeline");
    let only = vec!["sample-shopping".to_string()];

    let first = pipeline.run_once(&only).await.expect("first run");
    assert!(first.outcomes[0].delivery.is_some());

    let second = pipeline.run_once(&only).await.expect("second run");
    assert_eq!(second.selected_feeds, 1);
    assert!(second.outcomes[0].delivery_skipped);
    assert!(second.outcomes[0].delivery.is_none());
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn unknown_feed_filter_fails_the_run() {
    let root = tempdir().expect("tempdir");
    write_registry(root.path());
    let pipeline = FeedPipeline::new(PipelineConfig::rooted_at(root.path())).expect("pipeline");
    assert!(pipeline.run_once(&["nope".to_string()]).await.is_err());
}

#[tokio::test]
async fn feed_timeout_fails_the_feed_and_leaves_no_output() {
    let root = tempdir().expect("tempdir");
    let input = root.path().join("large.csv");
    let mut text = String::from("id,title,link\n");
    for n in 0..200_000 {
        text.push_str(&format!("{n},Item {n},https://shop.example/p/{n}?ref=feed\n"));
    }
    fs::write(&input, text).expect("large input");
    fs::write(
        root.path().join("feeds.yaml"),
        format!(
            "feeds:\n  - feed_id: large\n    source: {{kind: local, path: \"{}\"}}\n    url_base: \"https://t.example/x?a=1\"\n    column_map:\n      renames:\n        link: URL\n    output_name: large.tsv.gz\n",
            input.display()
        ),
    )
    .expect("registry");

    let mut config = PipelineConfig::rooted_at(root.path());
    config.feed_timeout = Some(Duration::from_millis(1));
    config.max_parallel = 1;
    let pipeline = FeedPipeline::new(config).expect("pipeline");

    let summary = pipeline.run_once(&[]).await.expect("run");
    assert_eq!(summary.failed, 1);
    let outcome = &summary.outcomes[0];
    assert_eq!(outcome.status, FeedStatus::Failed);
    assert!(outcome
        .error
        .as_deref()
        .is_some_and(|err| err.contains("timed out")));
    assert!(outcome.output_path.is_none());

    let processed = root.path().join("processed");
    let remaining: Vec<_> = fs::read_dir(&processed)
        .map(|entries| entries.filter_map(|entry| entry.ok()).collect())
        .unwrap_or_default();
    assert!(remaining.is_empty(), "left behind: {remaining:?}");
}
