//! Durable, append-only output for enriched rows.
//!
//! The number of rows a sink holds is the resume offset of a run, so a
//! sink must never expose part of a batch.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use prospect_core::model::{EnrichmentResult, InputRow};

use crate::error::{EnrichError, EnrichResult};

/// An input row together with its enrichment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedRow {
    pub input: InputRow,
    pub result: EnrichmentResult,
}

impl EnrichedRow {
    /// Input values followed by output values.
    pub fn record(&self) -> Vec<String> {
        let mut record = self.input.values().to_vec();
        record.extend(self.result.values());
        record
    }
}

/// Append-only store of enriched rows.
pub trait OutputSink: Send {
    /// Rows durably held. Used as the offset to resume from.
    fn row_count(&self) -> EnrichResult<usize>;

    /// Discard all previous output.
    fn reset(&mut self) -> EnrichResult<()>;

    /// Durably append a batch. Either the whole batch becomes visible or
    /// none of it does.
    fn append_batch(&mut self, rows: &[EnrichedRow]) -> EnrichResult<()>;
}

/// In-memory sink, for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    rows: Vec<EnrichedRow>,
    flushes: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[EnrichedRow] {
        &self.rows
    }

    /// Number of successful `append_batch` calls.
    pub const fn flushes(&self) -> usize {
        self.flushes
    }
}

impl OutputSink for MemorySink {
    fn row_count(&self) -> EnrichResult<usize> {
        Ok(self.rows.len())
    }

    fn reset(&mut self) -> EnrichResult<()> {
        self.rows.clear();
        self.flushes = 0;
        Ok(())
    }

    fn append_batch(&mut self, rows: &[EnrichedRow]) -> EnrichResult<()> {
        self.rows.extend_from_slice(rows);
        self.flushes += 1;
        Ok(())
    }
}

/// What a scan of an existing output file found.
#[derive(Debug, Default)]
struct Existing {
    header: Option<Vec<String>>,
    rows: usize,
    /// Byte length of the header plus every complete record.
    valid_len: u64,
}

fn scan(path: &Path) -> EnrichResult<Existing> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Existing::default()),
        Err(e) => return Err(prospect_core::Error::from(e).into()),
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes.as_slice());
    let mut record = csv::StringRecord::new();
    let mut existing = Existing::default();

    loop {
        match reader.read_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                log::debug!("Stopping scan of {} at unreadable record: {}", path.display(), e);
                break;
            }
        }
        let end = reader.position().byte();
        let terminated = usize::try_from(end)
            .ok()
            .and_then(|end| bytes.get(..end))
            .is_some_and(|prefix| prefix.ends_with(b"\n"));
        if !terminated {
            break;
        }
        match &existing.header {
            None => existing.header = Some(record.iter().map(String::from).collect()),
            Some(header) if header.len() == record.len() => existing.rows += 1,
            Some(_) => break,
        }
        existing.valid_len = end;
    }

    if existing.valid_len < bytes.len() as u64 {
        log::warn!(
            "Ignoring {} trailing bytes of incomplete output in {}",
            bytes.len() as u64 - existing.valid_len,
            path.display()
        );
    }
    Ok(existing)
}

/// CSV file sink.
///
/// The header is the input columns followed by the output columns. Each
/// batch is written by copying the current file to a sibling `.partial`
/// file, appending the batch, syncing it and renaming it over the
/// original, so the visible file only ever holds whole batches.
#[derive(Debug)]
pub struct CsvSink {
    path: PathBuf,
    header: Vec<String>,
    existing_header: Option<Vec<String>>,
    rows: usize,
    valid_len: u64,
    #[cfg(test)]
    fail_after_bytes: Option<usize>,
}

impl CsvSink {
    /// Open the sink at `path`, counting the complete records of any
    /// output already there.
    pub fn open(path: impl Into<PathBuf>, header: Vec<String>) -> EnrichResult<Self> {
        let path = path.into();
        let existing = scan(&path)?;
        Ok(Self {
            path,
            header,
            existing_header: existing.header,
            rows: existing.rows,
            valid_len: existing.valid_len,
            #[cfg(test)]
            fail_after_bytes: None,
        })
    }

    fn partial_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".partial");
        self.path.with_file_name(name)
    }

    fn encode(&self, rows: &[EnrichedRow], with_header: bool) -> EnrichResult<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        if with_header {
            writer
                .write_record(&self.header)
                .map_err(prospect_core::Error::from)?;
        }
        for row in rows {
            let record = row.record();
            if record.len() != self.header.len() {
                return Err(EnrichError::InvalidInput(format!(
                    "row {} has {} fields for {} columns",
                    row.input.offset(),
                    record.len(),
                    self.header.len()
                )));
            }
            writer
                .write_record(&record)
                .map_err(prospect_core::Error::from)?;
        }
        writer
            .into_inner()
            .map_err(|e| EnrichError::durability(e.error()))
    }

    #[cfg(not(test))]
    fn write_encoded(&self, file: &mut File, encoded: &[u8]) -> io::Result<()> {
        file.write_all(encoded)
    }

    #[cfg(test)]
    fn write_encoded(&self, file: &mut File, encoded: &[u8]) -> io::Result<()> {
        match self.fail_after_bytes {
            Some(limit) => {
                file.write_all(&encoded[..limit.min(encoded.len())])?;
                Err(io::Error::other("injected write fault"))
            }
            None => file.write_all(encoded),
        }
    }

    fn write_partial(&self, partial: &Path, encoded: &[u8]) -> io::Result<u64> {
        let mut file = File::create(partial)?;
        if self.valid_len > 0 {
            let mut current = io::Read::take(File::open(&self.path)?, self.valid_len);
            let copied = io::copy(&mut current, &mut file)?;
            if copied != self.valid_len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "output file shrank during flush",
                ));
            }
        }
        self.write_encoded(&mut file, encoded)?;
        file.sync_all()?;
        drop(file);
        fs::rename(partial, &self.path)?;
        sync_parent(&self.path);
        Ok(self.valid_len + encoded.len() as u64)
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
        log::debug!("Could not sync directory {}: {}", parent.display(), e);
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

impl OutputSink for CsvSink {
    fn row_count(&self) -> EnrichResult<usize> {
        match &self.existing_header {
            Some(existing) if *existing != self.header => Err(EnrichError::InvalidInput(format!(
                "existing output {} has different columns; rerun without resume to overwrite it",
                self.path.display()
            ))),
            _ => Ok(self.rows),
        }
    }

    fn reset(&mut self) -> EnrichResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(EnrichError::durability(e)),
        }
        self.existing_header = None;
        self.rows = 0;
        self.valid_len = 0;
        Ok(())
    }

    fn append_batch(&mut self, rows: &[EnrichedRow]) -> EnrichResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let with_header = self.valid_len == 0;
        let encoded = self.encode(rows, with_header)?;
        let partial = self.partial_path();

        match self.write_partial(&partial, &encoded) {
            Ok(len) => {
                self.valid_len = len;
                self.rows += rows.len();
                if with_header {
                    self.existing_header = Some(self.header.clone());
                }
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&partial) {
                    log::debug!("Could not remove {}: {}", partial.display(), cleanup);
                }
                Err(EnrichError::durability(format!(
                    "flush to {} failed: {e}",
                    self.path.display()
                )))
            }
        }
    }
}
