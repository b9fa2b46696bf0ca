//! Canonical feed model: column maps, header translation, tracking URL wrapping.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Canonical column that carries the product link unless a feed says otherwise.
pub const DEFAULT_URL_COLUMN: &str = "URL";

/// Mapping from canonical output column to the vendor aliases recognized for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnMap {
    columns: BTreeMap<String, BTreeSet<String>>,
}

impl ColumnMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from `source -> canonical` pairs.
    pub fn from_renames<I, S, C>(renames: I) -> Self
    where
        I: IntoIterator<Item = (S, C)>,
        S: Into<String>,
        C: Into<String>,
    {
        let mut map = Self::new();
        for (source, canonical) in renames {
            map.insert_alias(canonical, source);
        }
        map
    }

    pub fn with_aliases<C, I, A>(mut self, canonical: C, aliases: I) -> Self
    where
        C: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        let entry = self.columns.entry(canonical.into()).or_default();
        entry.extend(aliases.into_iter().map(Into::into));
        self
    }

    pub fn insert_alias(&mut self, canonical: impl Into<String>, alias: impl Into<String>) {
        self.columns
            .entry(canonical.into())
            .or_default()
            .insert(alias.into());
    }

    pub fn merge(&mut self, other: &ColumnMap) {
        for (canonical, aliases) in &other.columns {
            self.columns
                .entry(canonical.clone())
                .or_default()
                .extend(aliases.iter().cloned());
        }
    }

    pub fn canonical_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn aliases(&self, canonical: &str) -> Option<&BTreeSet<String>> {
        self.columns.get(canonical)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Precomputes the lookup tables used to translate one header.
    pub fn resolver(&self) -> ColumnResolver {
        let mut exact = HashMap::new();
        let mut folded = HashMap::new();

        // Canonical names are inserted first so they win over any alias spelled the same way.
        for canonical in self.columns.keys() {
            exact.insert(canonical.clone(), canonical.clone());
            folded
                .entry(fold_column_name(canonical))
                .or_insert_with(|| canonical.clone());
        }
        for (canonical, aliases) in &self.columns {
            for alias in aliases {
                exact
                    .entry(alias.clone())
                    .or_insert_with(|| canonical.clone());
                folded
                    .entry(fold_column_name(alias))
                    .or_insert_with(|| canonical.clone());
            }
        }

        ColumnResolver { exact, folded }
    }
}

fn fold_column_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Lookup tables derived from a [`ColumnMap`].
#[derive(Debug, Clone)]
pub struct ColumnResolver {
    exact: HashMap<String, String>,
    folded: HashMap<String, String>,
}

impl ColumnResolver {
    /// Exact match first, then a trimmed case-insensitive match.
    pub fn resolve(&self, source: &str) -> Option<&str> {
        self.exact
            .get(source)
            .or_else(|| self.folded.get(&fold_column_name(source)))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRename {
    pub source: String,
    pub canonical: String,
}

/// Translated header of one feed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    names: Vec<String>,
    renames: Vec<ColumnRename>,
    url_index: Option<usize>,
}

impl Header {
    pub fn translate<I, S>(source: I, resolver: &ColumnResolver, url_column: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names = Vec::new();
        let mut renames = Vec::new();
        for column in source {
            let column = column.as_ref();
            match resolver.resolve(column) {
                Some(canonical) => {
                    if canonical != column {
                        renames.push(ColumnRename {
                            source: column.to_string(),
                            canonical: canonical.to_string(),
                        });
                    }
                    names.push(canonical.to_string());
                }
                None => names.push(column.to_string()),
            }
        }
        let url_index = names.iter().position(|name| name == url_column);
        Self {
            names,
            renames,
            url_index,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn renames(&self) -> &[ColumnRename] {
        &self.renames
    }

    pub fn url_index(&self) -> Option<usize> {
        self.url_index
    }

    pub fn to_line(&self) -> String {
        self.names.join("\t")
    }
}

/// Tracking URL wrap applied to the product link column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRewriteRule {
    pub base_url: String,
    #[serde(default = "default_url_column")]
    pub column: String,
}

fn default_url_column() -> String {
    DEFAULT_URL_COLUMN.to_string()
}

impl UrlRewriteRule {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            column: default_url_column(),
        }
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Drops any query string from `link` and appends it as `cu`/`fbu` to the base URL.
    pub fn wrap(&self, link: &str) -> String {
        let encoded = encode_query_value(strip_query(link));
        format!("{}&cu={encoded}&fbu={encoded}", self.base_url)
    }
}

pub fn strip_query(link: &str) -> &str {
    link.split_once('?').map_or(link, |(head, _)| head)
}

/// Everything except `A-Z a-z 0-9 - _ . ~` is escaped in a query value.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Query-value escaping with `+` for spaces. A literal `%` is itself escaped,
/// so every `%20` in the encoded form came from a space.
pub fn encode_query_value(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE)
        .to_string()
        .replace("%20", "+")
}

/// Removes every literal double quote from a field value.
pub fn strip_quotes(field: &str) -> Cow<'_, str> {
    if field.contains('"') {
        Cow::Owned(field.replace('"', ""))
    } else {
        Cow::Borrowed(field)
    }
}

/// Right-pads `fields` with empty values up to `width`. Returns whether padding happened.
pub fn pad_fields(fields: &mut Vec<String>, width: usize) -> bool {
    if fields.len() >= width {
        return false;
    }
    fields.resize(width, String::new());
    true
}

/// Counts reported for one normalized file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeSummary {
    pub header: Vec<String>,
    pub renamed_columns: Vec<ColumnRename>,
    pub url_column_index: Option<usize>,
    pub rows_read: u64,
    pub rows_written: u64,
    pub malformed_rows: u64,
    pub padded_rows: u64,
    pub urls_rewritten: u64,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("input unreadable{}: {source}", at_row(.row))]
    InputUnreadable {
        row: Option<u64>,
        #[source]
        source: io::Error,
    },
    #[error("invalid gzip input{}: {source}", at_row(.row))]
    Decompression {
        row: Option<u64>,
        #[source]
        source: io::Error,
    },
    #[error("input is empty: no header row")]
    MissingHeader,
    #[error("header row could not be decoded: {0}")]
    MalformedHeader(String),
    #[error("writing normalized output: {0}")]
    OutputWrite(#[source] io::Error),
    #[error("normalization cancelled at row {row}")]
    Cancelled { row: u64 },
}

impl NormalizeError {
    pub fn row(&self) -> Option<u64> {
        match self {
            Self::InputUnreadable { row, .. } | Self::Decompression { row, .. } => *row,
            Self::Cancelled { row } => Some(*row),
            _ => None,
        }
    }
}

fn at_row(row: &Option<u64>) -> String {
    match row {
        Some(row) => format!(" at row {row}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_map() -> ColumnMap {
        ColumnMap::from_renames([("id", "SKU/id"), ("link", "URL"), ("price", "Price")])
    }

    #[test]
    fn translates_example_header_and_locates_url_column() {
        let header = Header::translate(["id", "link", "price"], &example_map().resolver(), "URL");
        assert_eq!(header.to_line(), "SKU/id\tURL\tPrice");
        assert_eq!(header.url_index(), Some(1));
        assert_eq!(header.renames().len(), 3);
    }

    #[test]
    fn wraps_example_link() {
        let rule = UrlRewriteRule::new("https://x.example/?plid=1");
        assert_eq!(
            rule.wrap("https://shop.example.com/item/42?ref=ads"),
            "https://x.example/?plid=1&cu=https%3A%2F%2Fshop.example.com%2Fitem%2F42&fbu=https%3A%2F%2Fshop.example.com%2Fitem%2F42"
        );
    }

    #[test]
    fn translation_is_idempotent_on_canonical_header() {
        let resolver = example_map().resolver();
        let once = Header::translate(["id", "link", "price", "color"], &resolver, "URL");
        let twice = Header::translate(once.names(), &resolver, "URL");
        assert_eq!(once.names(), twice.names());
        assert!(twice.renames().is_empty());
    }

    #[test]
    fn alias_match_falls_back_to_case_insensitive() {
        let map = ColumnMap::new().with_aliases("Name", ["title", "product_name"]);
        let resolver = map.resolver();
        assert_eq!(resolver.resolve("title"), Some("Name"));
        assert_eq!(resolver.resolve(" Product_Name "), Some("Name"));
        assert_eq!(resolver.resolve("NAME"), Some("Name"));
        assert_eq!(resolver.resolve("headline"), None);
    }

    #[test]
    fn canonical_name_beats_alias_with_same_spelling() {
        let map = ColumnMap::new()
            .with_aliases("Category", ["product_type"])
            .with_aliases("Shipping costs", ["Category", "shipping"]);
        let resolver = map.resolver();
        assert_eq!(resolver.resolve("Category"), Some("Category"));
        assert_eq!(resolver.resolve("CATEGORY"), Some("Category"));
    }

    #[test]
    fn exact_alias_beats_case_insensitive_canonical() {
        let map = ColumnMap::new()
            .with_aliases("Category", ["product_type"])
            .with_aliases("Shipping costs", ["category"]);
        let resolver = map.resolver();
        assert_eq!(resolver.resolve("category"), Some("Shipping costs"));
        assert_eq!(resolver.resolve("Category"), Some("Category"));
    }

    #[test]
    fn unmatched_columns_pass_through() {
        let header = Header::translate(["gender", "link"], &example_map().resolver(), "URL");
        assert_eq!(header.names(), ["gender", "URL"]);
        assert_eq!(header.renames().len(), 1);
    }

    #[test]
    fn missing_url_column_is_none() {
        let header = Header::translate(["id", "price"], &example_map().resolver(), "URL");
        assert_eq!(header.url_index(), None);
    }

    #[test]
    fn rewrap_restrips_at_first_question_mark() {
        let rule = UrlRewriteRule::new("https://x.example/?plid=1");
        let once = rule.wrap("https://shop.example.com/a");
        let twice = rule.wrap(&once);
        assert_eq!(
            twice,
            "https://x.example/?plid=1&cu=https%3A%2F%2Fx.example%2F&fbu=https%3A%2F%2Fx.example%2F"
        );
    }

    #[test]
    fn query_encoding_uses_plus_for_spaces() {
        assert_eq!(encode_query_value("a b&c=d"), "a+b%26c%3Dd");
        assert_eq!(encode_query_value("100% cotton"), "100%25+cotton");
        assert_eq!(strip_query("?only=query"), "");
        assert_eq!(strip_query("no-query"), "no-query");
    }

    #[test]
    fn tilde_is_kept_and_asterisk_escaped() {
        let rule = UrlRewriteRule::new("https://t.example/x?a=1");
        assert_eq!(
            rule.wrap("https://shop.example.com/~user/a*b"),
            "https://t.example/x?a=1&cu=https%3A%2F%2Fshop.example.com%2F~user%2Fa%2Ab&fbu=https%3A%2F%2Fshop.example.com%2F~user%2Fa%2Ab"
        );
        assert_eq!(encode_query_value("Caf\u{e9}-1_2.3"), "Caf%C3%A9-1_2.3");
    }

    #[test]
    fn quotes_are_removed_anywhere() {
        assert_eq!(strip_quotes(r#"12" "wide""#), "12 wide");
        assert!(matches!(strip_quotes("plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn pads_short_rows_and_never_truncates() {
        let mut short = vec!["a".to_string()];
        assert!(pad_fields(&mut short, 3));
        assert_eq!(short, ["a", "", ""]);

        let mut long = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert!(!pad_fields(&mut long, 2));
        assert_eq!(long.len(), 3);
    }

    #[test]
    fn error_messages_carry_row_numbers() {
        let err = NormalizeError::InputUnreadable {
            row: Some(7),
            source: io::Error::other("boom"),
        };
        assert_eq!(err.to_string(), "input unreadable at row 7: boom");
        assert_eq!(err.row(), Some(7));
    }
}
