//! Streaming transform from a vendor feed (delimited, optionally gzip) to a
//! tab-delimited gzip file with canonical headers and wrapped product links.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use csv::{ReaderBuilder, StringRecord};
use feedwrap_core::{
    pad_fields, strip_quotes, ColumnMap, Header, NormalizeError, NormalizeSummary,
    UrlRewriteRule, DEFAULT_URL_COLUMN,
};
use flate2::read::MultiGzDecoder;
use flate2::{Compression, GzBuilder};
use tracing::{info, warn};

pub const PROGRESS_EVERY: u64 = 100_000;

const OUTPUT_BUFFER_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub delimiter: u8,
    pub compressed: bool,
    pub column_map: ColumnMap,
    pub url_rule: Option<UrlRewriteRule>,
    pub progress_every: u64,
    /// Checked before every row; once set the run stops with `Cancelled`.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl NormalizeOptions {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            compressed: false,
            column_map: ColumnMap::new(),
            url_rule: None,
            progress_every: PROGRESS_EVERY,
            cancel: None,
        }
    }

    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn column_map(mut self, column_map: ColumnMap) -> Self {
        self.column_map = column_map;
        self
    }

    pub fn url_rule(mut self, url_rule: Option<UrlRewriteRule>) -> Self {
        self.url_rule = url_rule;
        self
    }

    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FeedNormalizer {
    options: NormalizeOptions,
}

enum ReadFailure {
    Malformed(String),
    Fatal(NormalizeError),
}

impl FeedNormalizer {
    pub fn new(options: NormalizeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &NormalizeOptions {
        &self.options
    }

    /// Streams `input` into `output` one record at a time.
    ///
    /// The gzip stream written to `output` is always finished, so even when a
    /// fatal read error stops the run the bytes already written decode cleanly.
    /// Callers decide whether such partial output is kept.
    pub fn normalize<R: Read, W: Write>(
        &self,
        input: R,
        output: W,
    ) -> Result<NormalizeSummary, NormalizeError> {
        if self.options.compressed {
            self.encode(MultiGzDecoder::new(BufReader::new(input)), output)
        } else {
            self.encode(input, output)
        }
    }

    fn encode<R: Read, W: Write>(
        &self,
        input: R,
        output: W,
    ) -> Result<NormalizeSummary, NormalizeError> {
        // GzBuilder leaves mtime at 0, which keeps output byte-for-byte reproducible.
        let encoder = GzBuilder::new().write(output, Compression::default());
        let mut writer = BufWriter::with_capacity(OUTPUT_BUFFER_BYTES, encoder);
        let result = self.transform(input, &mut writer);

        let finished = writer
            .into_inner()
            .map_err(|err| err.into_error())
            .and_then(|encoder| encoder.finish().map(drop));

        match (result, finished) {
            (Ok(summary), Ok(())) => Ok(summary),
            (Ok(_), Err(err)) => Err(NormalizeError::OutputWrite(err)),
            (Err(err), _) => Err(err),
        }
    }

    fn transform<R: Read, W: Write>(
        &self,
        input: R,
        out: &mut W,
    ) -> Result<NormalizeSummary, NormalizeError> {
        let compressed = self.options.compressed;
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.options.delimiter)
            .from_reader(input);
        let mut record = StringRecord::new();

        match reader.read_record(&mut record) {
            Ok(true) => {}
            Ok(false) => return Err(NormalizeError::MissingHeader),
            Err(err) => {
                return Err(match classify(err, None, compressed) {
                    ReadFailure::Malformed(message) => NormalizeError::MalformedHeader(message),
                    ReadFailure::Fatal(err) => err,
                })
            }
        }

        if spans_lines(&record) {
            return Err(NormalizeError::MalformedHeader(
                "header row spans several lines (unbalanced quote)".to_string(),
            ));
        }

        let source_header: Vec<String> = record
            .iter()
            .enumerate()
            .map(|(idx, field)| {
                let field = if idx == 0 {
                    field.trim_start_matches('\u{feff}')
                } else {
                    field
                };
                strip_quotes(field).into_owned()
            })
            .collect();

        let url_column = self
            .options
            .url_rule
            .as_ref()
            .map_or(DEFAULT_URL_COLUMN, |rule| rule.column.as_str());
        let header = Header::translate(
            &source_header,
            &self.options.column_map.resolver(),
            url_column,
        );
        write_line(out, &header.to_line())?;

        let url_index = header.url_index();
        let width = header.len();
        let mut summary = NormalizeSummary {
            header: header.names().to_vec(),
            renamed_columns: header.renames().to_vec(),
            url_column_index: url_index,
            ..NormalizeSummary::default()
        };

        let progress_every = self.options.progress_every.max(1);
        let mut fields: Vec<String> = Vec::with_capacity(width);
        let mut line = String::new();
        // Row numbers count the header as row 1.
        let mut row: u64 = 1;

        loop {
            row += 1;
            if self
                .options
                .cancel
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                return Err(NormalizeError::Cancelled { row });
            }
            match reader.read_record(&mut record) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => match classify(err, Some(row), compressed) {
                    ReadFailure::Malformed(message) => {
                        summary.rows_read += 1;
                        summary.malformed_rows += 1;
                        warn!(row, error = %message, "skipping malformed row");
                        continue;
                    }
                    ReadFailure::Fatal(err) => return Err(err),
                },
            }
            summary.rows_read += 1;

            // A quoted newline means the row ran past its own line, usually an
            // unbalanced quote; tab-delimited output cannot carry it.
            if spans_lines(&record) {
                summary.malformed_rows += 1;
                let line = record.position().map(|pos| pos.line());
                warn!(row, ?line, "skipping malformed row: field spans several lines");
                continue;
            }

            fields.clear();
            fields.extend(record.iter().map(|field| strip_quotes(field).into_owned()));
            if pad_fields(&mut fields, width) {
                summary.padded_rows += 1;
            }

            if let (Some(idx), Some(rule)) = (url_index, self.options.url_rule.as_ref()) {
                if !fields[idx].is_empty() {
                    fields[idx] = rule.wrap(&fields[idx]);
                    summary.urls_rewritten += 1;
                }
            }

            line.clear();
            for (idx, field) in fields.iter().enumerate() {
                if idx > 0 {
                    line.push('\t');
                }
                line.push_str(field);
            }
            write_line(out, &line)?;
            summary.rows_written += 1;

            if summary.rows_written % progress_every == 0 {
                info!(rows = summary.rows_written, "normalization progress");
            }
        }

        info!(
            rows_read = summary.rows_read,
            rows_written = summary.rows_written,
            malformed_rows = summary.malformed_rows,
            "normalization finished"
        );
        Ok(summary)
    }
}

fn spans_lines(record: &StringRecord) -> bool {
    record.iter().any(|field| field.contains(['\n', '\r']))
}

fn write_line<W: Write>(out: &mut W, line: &str) -> Result<(), NormalizeError> {
    out.write_all(line.as_bytes())
        .and_then(|()| out.write_all(b"\n"))
        .map_err(NormalizeError::OutputWrite)
}

fn classify(err: csv::Error, row: Option<u64>, compressed: bool) -> ReadFailure {
    let message = err.to_string();
    match err.into_kind() {
        csv::ErrorKind::Io(source) => {
            if compressed && is_gzip_failure(&source) {
                ReadFailure::Fatal(NormalizeError::Decompression { row, source })
            } else {
                ReadFailure::Fatal(NormalizeError::InputUnreadable { row, source })
            }
        }
        _ => ReadFailure::Malformed(message),
    }
}

fn is_gzip_failure(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
    )
}
