//! Read-only helpers for poking at raw and normalized feed files.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use tracing::{info, warn};

use crate::PROGRESS_EVERY;

/// Delimiters tried by [`sniff_delimiter`], in tie-break order.
pub const SNIFF_CANDIDATES: [u8; 5] = [b'\t', b',', b'|', b';', b':'];
pub const SNIFF_LINES: usize = 10;

pub fn is_gzip_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

pub fn open_decoded(path: &Path, compressed: bool) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    if compressed {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(file)))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Reads up to `limit` lines, decoding invalid UTF-8 lossily.
fn read_lines(reader: &mut dyn BufRead, limit: usize) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    while lines.len() < limit {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).context("reading line")? == 0 {
            break;
        }
        lines.push(trim_line_end(&buf));
    }
    Ok(lines)
}

fn trim_line_end(buf: &[u8]) -> String {
    let text = String::from_utf8_lossy(buf);
    text.trim_end_matches(['\n', '\r']).to_string()
}

pub fn head(path: &Path, compressed: bool, n: usize) -> Result<Vec<String>> {
    let mut reader = open_decoded(path, compressed)?;
    read_lines(reader.as_mut(), n).with_context(|| format!("reading {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FoundRecord {
    /// 1-based line number, header included.
    pub line_no: u64,
    pub line: String,
}

/// Scans a tab-delimited file for the first row whose `column` contains `needle`.
pub fn find_record(
    path: &Path,
    compressed: bool,
    column: &str,
    needle: &str,
) -> Result<Option<FoundRecord>> {
    let mut reader = open_decoded(path, compressed)?;
    let mut buf = Vec::new();
    if reader
        .read_until(b'\n', &mut buf)
        .with_context(|| format!("reading header of {}", path.display()))?
        == 0
    {
        bail!("{} is empty", path.display());
    }
    let header = trim_line_end(&buf);
    let Some(column_idx) = header.split('\t').position(|name| name == column) else {
        bail!("column {column:?} not found in header of {}", path.display());
    };

    let mut line_no: u64 = 1;
    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("reading {} at line {}", path.display(), line_no + 1))?;
        if read == 0 {
            return Ok(None);
        }
        line_no += 1;
        let line = trim_line_end(&buf);
        if line
            .split('\t')
            .nth(column_idx)
            .is_some_and(|value| value.contains(needle))
        {
            return Ok(Some(FoundRecord { line_no, line }));
        }
        if (line_no - 1) % PROGRESS_EVERY == 0 {
            info!(rows = line_no - 1, "search progress");
        }
    }
}

/// Picks the candidate delimiter that splits the most lines into the same
/// number of fields. Candidates that never split a line are ignored.
pub fn sniff_lines<S: AsRef<str>>(lines: &[S]) -> Option<u8> {
    let mut best: Option<(u8, usize)> = None;
    for candidate in SNIFF_CANDIDATES {
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for line in lines {
            let line = line.as_ref();
            if line.is_empty() {
                continue;
            }
            let fields = line.split(char::from(candidate)).count();
            *counts.entry(fields).or_default() += 1;
        }
        let Some((_, score)) = counts
            .into_iter()
            .filter(|(fields, _)| *fields > 1)
            .max_by_key(|(fields, score)| (*score, *fields))
        else {
            continue;
        };
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((candidate, score));
        }
    }
    best.map(|(delimiter, _)| delimiter)
}

pub fn sniff_delimiter(path: &Path, compressed: bool) -> Result<u8> {
    let lines = head(path, compressed, SNIFF_LINES)?;
    match sniff_lines(lines.as_slice()) {
        Some(delimiter) => {
            info!(path = %path.display(), delimiter = %describe_delimiter(delimiter), "sniffed delimiter");
            Ok(delimiter)
        }
        None => {
            warn!(path = %path.display(), "no candidate delimiter found; assuming comma");
            Ok(b',')
        }
    }
}

pub fn describe_delimiter(delimiter: u8) -> String {
    match delimiter {
        b'\t' => "\\t".to_string(),
        other => char::from(other).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn sniffs_comma_and_tab() {
        let csv = ["id,title,link", "1,Chair,https://a.example", "2,Desk,https://b.example"];
        assert_eq!(sniff_lines(&csv), Some(b','));

        let tsv = ["id\ttitle\tlink", "1\tChair: oak\thttps://a.example"];
        assert_eq!(sniff_lines(&tsv), Some(b'\t'));

        let piped = ["a|b|c", "1|2|3"];
        assert_eq!(sniff_lines(&piped), Some(b'|'));
    }

    #[test]
    fn sniffing_single_column_finds_nothing() {
        assert_eq!(sniff_lines(&["id", "1", "2"]), None);
    }

    #[test]
    fn head_and_find_over_gzip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.tsv.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(b"id\ttitle\tURL\n1\tChair\thttps://a\n2\tDesk\thttps://b\n")
            .expect("write");
        std::fs::write(&path, encoder.finish().expect("finish")).expect("save");

        assert!(is_gzip_path(&path));
        assert_eq!(
            head(&path, true, 2).expect("head"),
            vec!["id\ttitle\tURL".to_string(), "1\tChair\thttps://a".to_string()]
        );

        let found = find_record(&path, true, "title", "es")
            .expect("find")
            .expect("match");
        assert_eq!(found.line_no, 3);
        assert_eq!(found.line, "2\tDesk\thttps://b");

        assert!(find_record(&path, true, "title", "Sofa").expect("find").is_none());
        assert!(find_record(&path, true, "price", "1").is_err());
        assert_eq!(sniff_delimiter(&path, true).expect("sniff"), b'\t');
    }
}
