use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::error::configuration;
use crate::record::{Record, RecordKind, RecordState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Comma,
    Tab,
}

impl Delimiter {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Comma => b',',
            Self::Tab => b'\t',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Comma => "comma",
            Self::Tab => "tab",
        }
    }

    /// Explicit choice wins; otherwise `.tsv`/`.tab` means tab and everything else comma.
    pub fn resolve(path: &Path, explicit: Option<&str>) -> Result<Self> {
        if let Some(value) = explicit {
            let value = value.trim();
            if value.eq_ignore_ascii_case("comma") || value == "," || value.eq_ignore_ascii_case("csv")
            {
                return Ok(Self::Comma);
            }
            if value.eq_ignore_ascii_case("tab") || value == "\\t" || value.eq_ignore_ascii_case("tsv")
            {
                return Ok(Self::Tab);
            }
            return Err(configuration(format!(
                "unsupported delimiter: {value} (expected comma|tab)"
            )));
        }
        let extension = path
            .extension()
            .and_then(|value| value.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if extension == "tsv" || extension == "tab" {
            Ok(Self::Tab)
        } else {
            Ok(Self::Comma)
        }
    }
}

/// Parses delimited text whose first row is the header.
///
/// Each data row becomes a [`RecordKind::Row`] record numbered from 1, with the
/// header names as field keys. Blank rows are dropped; short rows get empty
/// values for missing columns.
pub fn parse_delimited(content: &str, delimiter: Delimiter) -> Result<Vec<Record>> {
    let content = strip_bom(content);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter.as_byte())
        .flexible(true)
        .has_headers(true)
        .from_reader(content.as_bytes());

    let headers = reader
        .headers()
        .context("failed to read header row")?
        .iter()
        .map(|value| value.trim().to_string())
        .collect::<Vec<_>>();
    for (index, header) in headers.iter().enumerate() {
        if !header.is_empty() && headers[..index].contains(header) {
            bail!("column `{header}` appears more than once in the header row");
        }
    }

    let mut records = Vec::new();
    let mut row_number = 0i64;
    for row in reader.records() {
        let row = row.context("failed to parse delimited row")?;
        if row.iter().all(|value| value.trim().is_empty()) {
            continue;
        }
        row_number += 1;
        let mut state = RecordState::default();
        for (index, header) in headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            state.set_field(header, row.get(index).unwrap_or_default());
        }
        records.push(Record::new(row_number, RecordKind::Row, state));
    }
    Ok(records)
}

/// Reads an input file; unreadable files and missing columns are configuration errors.
pub fn read_delimited(
    path: &Path,
    delimiter: Delimiter,
    required_columns: &[&str],
) -> Result<Vec<Record>> {
    let content = fs::read_to_string(path).map_err(|error| {
        configuration(format!("failed to read input file {}: {error}", path.display()))
    })?;
    let records = parse_delimited(&content, delimiter).map_err(|error| {
        configuration(format!("failed to parse {}: {error:#}", path.display()))
    })?;
    if let Some(first) = records.first() {
        for column in required_columns {
            if !first.state.fields.contains_key(*column) {
                return Err(configuration(format!(
                    "{} is missing required column `{column}`",
                    path.display()
                )));
            }
        }
    }
    Ok(records)
}

/// Row-at-a-time delimited writer with a fixed header.
pub struct DelimitedWriter {
    writer: csv::Writer<File>,
    path: PathBuf,
    columns: usize,
    rows_written: usize,
}

impl DelimitedWriter {
    pub fn create(path: &Path, delimiter: Delimiter, header: &[&str]) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create output directory {}", parent.display()))?;
        }
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter.as_byte())
            .from_writer(file);
        writer
            .write_record(header)
            .with_context(|| format!("failed to write header to {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", path.display()))?;
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            columns: header.len(),
            rows_written: 0,
        })
    }

    pub fn write_row(&mut self, values: &[String]) -> Result<()> {
        if values.len() != self.columns {
            anyhow::bail!(
                "row has {} values but {} expects {} columns",
                values.len(),
                self.path.display(),
                self.columns
            );
        }
        self.writer
            .write_record(values)
            .with_context(|| format!("failed to write row to {}", self.path.display()))?;
        // Flush per row so an interrupted run leaves every accepted row on disk.
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn strip_bom(content: &str) -> &str {
    content.strip_prefix('\u{feff}').unwrap_or(content)
}
