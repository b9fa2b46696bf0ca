//! `feeds.yaml`: column-map profiles plus the list of feeds to process.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use feedwrap_core::{ColumnMap, UrlRewriteRule, DEFAULT_URL_COLUMN};
use feedwrap_sources::SourceConfig;
use feedwrap_storage::DestinationConfig;
use serde::{Deserialize, Serialize};

use crate::inspect::{describe_delimiter, is_gzip_path};

#[derive(Debug, Clone, Deserialize)]
pub struct FeedRegistry {
    #[serde(default)]
    pub profiles: BTreeMap<String, ColumnMapConfig>,
    pub feeds: Vec<FeedConfig>,
}

/// Column map as written in YAML. `columns` lists aliases per canonical name;
/// `renames` is the flat `source: canonical` shorthand.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ColumnMapConfig {
    #[serde(default)]
    pub columns: BTreeMap<String, AliasList>,
    #[serde(default)]
    pub renames: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AliasList {
    One(String),
    Many(Vec<String>),
}

impl AliasList {
    fn as_slice(&self) -> &[String] {
        match self {
            Self::One(alias) => std::slice::from_ref(alias),
            Self::Many(aliases) => aliases,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &str> {
        self.as_slice().iter().map(String::as_str)
    }
}

impl ColumnMapConfig {
    pub fn to_column_map(&self) -> ColumnMap {
        let mut map = ColumnMap::new();
        for (canonical, aliases) in &self.columns {
            map = map.with_aliases(canonical.as_str(), aliases.iter());
        }
        for (source, canonical) in &self.renames {
            map.insert_alias(canonical.as_str(), source.as_str());
        }
        map
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DelimiterSetting {
    Fixed(u8),
    Auto,
}

impl Default for DelimiterSetting {
    fn default() -> Self {
        Self::Fixed(b',')
    }
}

impl FromStr for DelimiterSetting {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "auto" => Ok(Self::Auto),
            "\\t" | "tab" | "\t" => Ok(Self::Fixed(b'\t')),
            other => {
                let mut chars = other.chars();
                match (chars.next(), chars.next()) {
                    (Some(ch), None) if ch.is_ascii() && ch != '\n' && ch != '\r' && ch != '"' => {
                        Ok(Self::Fixed(ch as u8))
                    }
                    _ => Err(format!(
                        "delimiter must be a single ASCII character, \\t, or auto (got {other:?})"
                    )),
                }
            }
        }
    }
}

impl TryFrom<String> for DelimiterSetting {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DelimiterSetting> for String {
    fn from(value: DelimiterSetting) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DelimiterSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Fixed(delimiter) => f.write_str(&describe_delimiter(*delimiter)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub feed_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub source: SourceConfig,
    #[serde(default)]
    pub delimiter: DelimiterSetting,
    /// Unset means "infer from a `.gz` extension".
    #[serde(default)]
    pub compressed: Option<bool>,
    #[serde(default)]
    pub profile: Option<String>,
    /// Merged over the profile, if both are given.
    #[serde(default)]
    pub column_map: Option<ColumnMapConfig>,
    #[serde(default)]
    pub url_base: Option<String>,
    #[serde(default)]
    pub url_column: Option<String>,
    /// Output file name; `{date}` renders the run date.
    pub output_name: String,
    #[serde(default)]
    pub destination: Option<DestinationConfig>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl FeedConfig {
    pub fn is_compressed(&self, input: &Path) -> bool {
        self.compressed.unwrap_or_else(|| is_gzip_path(input))
    }

    pub fn url_rule(&self) -> Option<UrlRewriteRule> {
        let base = self.url_base.as_deref().filter(|base| !base.trim().is_empty())?;
        let column = self.url_column.as_deref().unwrap_or(DEFAULT_URL_COLUMN);
        Some(UrlRewriteRule::new(base).with_column(column))
    }
}

impl FeedRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing feed registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for feed in &self.feeds {
            if feed.feed_id.trim().is_empty() {
                bail!("feed with empty feed_id");
            }
            if !seen.insert(feed.feed_id.as_str()) {
                bail!("duplicate feed_id {}", feed.feed_id);
            }
            if feed.output_name.trim().is_empty() || feed.output_name.contains(['/', '\\']) {
                bail!(
                    "feed {}: output_name must be a plain file name (got {:?})",
                    feed.feed_id,
                    feed.output_name
                );
            }
            if let Some(profile) = &feed.profile {
                if !self.profiles.contains_key(profile) {
                    bail!("feed {} references unknown profile {profile}", feed.feed_id);
                }
            }
        }
        Ok(())
    }

    pub fn feed(&self, feed_id: &str) -> Option<&FeedConfig> {
        self.feeds.iter().find(|feed| feed.feed_id == feed_id)
    }

    /// Profile map first, then the feed's inline map on top.
    pub fn column_map_for(&self, feed: &FeedConfig) -> Result<ColumnMap> {
        let mut map = match &feed.profile {
            Some(profile) => self
                .profiles
                .get(profile)
                .with_context(|| format!("feed {} references unknown profile {profile}", feed.feed_id))?
                .to_column_map(),
            None => ColumnMap::new(),
        };
        if let Some(inline) = &feed.column_map {
            map.merge(&inline.to_column_map());
        }
        Ok(map)
    }

    /// Enabled feeds, narrowed to `only` when it is non-empty.
    pub fn select(&self, only: &[String]) -> Result<Vec<&FeedConfig>> {
        let unknown: Vec<&str> = only
            .iter()
            .filter(|id| self.feed(id).is_none())
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            bail!("unknown feed id(s): {}", unknown.join(", "));
        }
        Ok(self
            .feeds
            .iter()
            .filter(|feed| feed.enabled)
            .filter(|feed| only.is_empty() || only.iter().any(|id| *id == feed.feed_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
profiles:
  shopping:
    columns:
      id: [ID, sku, Item Number]
      URL: [link, Product URL]
      Shipping costs: shipping
feeds:
  - feed_id: wayfair-us
    display_name: Wayfair US
    source:
      kind: local
      path: /feeds/{date}_wayfair.csv.gz
    profile: shopping
    column_map:
      renames:
        Brand Name: brand
    url_base: https://t.example/x?a=1
    output_name: amp_klarna_wayfair_us.tsv.gz
  - feed_id: bbb-ca
    enabled: false
    source:
      kind: http
      url: https://cdn.example.com/bbb_ca.txt
    delimiter: auto
    output_name: bbb_ca.tsv.gz
    destination:
      kind: local_dir
      path: /srv/outbox
"#;

    #[test]
    fn parses_profiles_inline_maps_and_auto_delimiter() {
        let registry = FeedRegistry::from_yaml_str(REGISTRY).expect("registry");
        let wayfair = registry.feed("wayfair-us").expect("wayfair");
        assert!(wayfair.enabled);
        assert_eq!(wayfair.delimiter, DelimiterSetting::Fixed(b','));
        assert!(wayfair.is_compressed(Path::new("/feeds/20250101_wayfair.csv.gz")));

        let map = registry.column_map_for(wayfair).expect("map");
        let resolver = map.resolver();
        assert_eq!(resolver.resolve("Item Number"), Some("id"));
        assert_eq!(resolver.resolve("shipping"), Some("Shipping costs"));
        assert_eq!(resolver.resolve("Brand Name"), Some("brand"));

        let rule = wayfair.url_rule().expect("rule");
        assert_eq!(rule.column, "URL");

        let bbb = registry.feed("bbb-ca").expect("bbb");
        assert_eq!(bbb.delimiter, DelimiterSetting::Auto);
        assert!(bbb.url_rule().is_none());
        assert!(!bbb.is_compressed(Path::new("bbb_ca.txt")));
        assert!(bbb.destination.is_some());
    }

    #[test]
    fn selection_respects_enabled_flag_and_filter() {
        let registry = FeedRegistry::from_yaml_str(REGISTRY).expect("registry");
        let all: Vec<_> = registry.select(&[]).expect("select").iter().map(|f| f.feed_id.clone()).collect();
        assert_eq!(all, vec!["wayfair-us".to_string()]);
        assert!(registry.select(&["nope".to_string()]).is_err());
    }

    #[test]
    fn bundled_registry_loads_every_source_and_destination_kind() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../feeds.yaml");
        let registry = FeedRegistry::load(&path).expect("bundled feeds.yaml");

        let bloomingdales = registry.feed("bloomingdales-us").expect("sftp feed");
        assert!(matches!(bloomingdales.source, SourceConfig::Sftp { .. }));
        assert!(matches!(
            bloomingdales.destination,
            Some(DestinationConfig::Sftp { .. })
        ));
        let harry = registry.feed("harrydavid-us").expect("s3 feed");
        assert!(matches!(harry.destination, Some(DestinationConfig::S3 { .. })));

        let enabled: Vec<_> = registry
            .select(&[])
            .expect("select")
            .iter()
            .map(|feed| feed.feed_id.as_str())
            .collect();
        assert_eq!(enabled, vec!["sample-shopping"]);
    }

    #[test]
    fn delimiter_settings_parse() {
        assert_eq!("\\t".parse::<DelimiterSetting>(), Ok(DelimiterSetting::Fixed(b'\t')));
        assert_eq!("tab".parse::<DelimiterSetting>(), Ok(DelimiterSetting::Fixed(b'\t')));
        assert_eq!("|".parse::<DelimiterSetting>(), Ok(DelimiterSetting::Fixed(b'|')));
        assert_eq!("auto".parse::<DelimiterSetting>(), Ok(DelimiterSetting::Auto));
        assert!("§".parse::<DelimiterSetting>().is_err());
        assert!(";;".parse::<DelimiterSetting>().is_err());
        assert_eq!(DelimiterSetting::Fixed(b'\t').to_string(), "\\t");
    }

    #[test]
    fn unknown_profile_and_duplicate_ids_are_rejected() {
        let unknown = "feeds:\n  - feed_id: a\n    source: {kind: local, path: a.csv}\n    profile: missing\n    output_name: a.tsv.gz\n";
        assert!(FeedRegistry::from_yaml_str(unknown).is_err());

        let duplicate = "feeds:\n  - feed_id: a\n    source: {kind: local, path: a.csv}\n    output_name: a.tsv.gz\n  - feed_id: a\n    source: {kind: local, path: b.csv}\n    output_name: b.tsv.gz\n";
        assert!(FeedRegistry::from_yaml_str(duplicate).is_err());
    }
}
