//! JSON-lines storage backend for traces.
//!
//! Traces are written as one JSON object per line into files named
//! `traces_{n}.jsonl`, starting a new file every `traces_per_file` traces.
//! [`OfflineTraces`] reads such a directory back, for example to train a
//! proposal network from pre-generated traces.

use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Lines, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use itertools::Itertools;
use tracing::debug;

use crate::storage::{StorageConfig, TraceRecord, TraceStorage};

/// Configuration for JSON-lines trace storage.
///
/// # Example
///
/// ```rust
/// use probtrace::JsonlConfig;
/// let config = JsonlConfig::new("traces").with_traces_per_file(500);
/// ```
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    output_dir: PathBuf,
    traces_per_file: usize,
}

impl JsonlConfig {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            traces_per_file: 1000,
        }
    }

    /// Number of traces per file before a new file is started.
    ///
    /// Default is 1000. Zero is treated as one.
    pub fn with_traces_per_file(mut self, traces_per_file: usize) -> Self {
        self.traces_per_file = traces_per_file.max(1);
        self
    }
}

impl StorageConfig for JsonlConfig {
    type Storage = JsonlTraceStorage;

    fn new_storage(self) -> Result<Self::Storage> {
        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("Failed to create output directory: {:?}", self.output_dir)
        })?;
        Ok(JsonlTraceStorage {
            output_dir: self.output_dir,
            traces_per_file: self.traces_per_file,
            writer: None,
            in_current_file: 0,
            files: Vec::new(),
        })
    }
}

pub struct JsonlTraceStorage {
    output_dir: PathBuf,
    traces_per_file: usize,
    writer: Option<BufWriter<File>>,
    in_current_file: usize,
    files: Vec<PathBuf>,
}

impl JsonlTraceStorage {
    fn rotate(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        let path = self
            .output_dir
            .join(format!("traces_{}.jsonl", self.files.len()));
        let file = File::create(&path)
            .with_context(|| format!("Failed to create trace file: {:?}", path))?;
        debug!(path = %path.display(), "started trace file");
        self.files.push(path);
        self.in_current_file = 0;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }
}

impl TraceStorage for JsonlTraceStorage {
    /// Paths of all files written, in order.
    type Finalized = Vec<PathBuf>;

    fn record_trace(&mut self, record: TraceRecord) -> Result<()> {
        if self.writer.is_none() || self.in_current_file >= self.traces_per_file {
            self.rotate()?;
        }
        let writer = self.writer.as_mut().context("Trace file is not open")?;
        serde_json::to_writer(&mut *writer, &record).context("Could not write trace record")?;
        writeln!(writer)?;
        self.in_current_file += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn finalize(mut self) -> Result<Self::Finalized> {
        self.flush()?;
        Ok(self.files)
    }
}

fn file_index(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("traces_")?
        .strip_suffix(".jsonl")?
        .parse()
        .ok()
}

/// A directory of trace files written by [`JsonlTraceStorage`].
#[derive(Debug, Clone)]
pub struct OfflineTraces {
    files: Vec<PathBuf>,
}

impl OfflineTraces {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Could not read trace directory {:?}", dir))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if let Some(index) = file_index(&path) {
                files.push((index, path));
            }
        }
        let files = files
            .into_iter()
            .sorted_by_key(|(index, _)| *index)
            .map(|(_, path)| path)
            .collect();
        Ok(Self { files })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// All records, file by file in the order they were written.
    pub fn records(&self) -> OfflineRecords<'_> {
        OfflineRecords {
            files: self.files.iter(),
            current: None,
        }
    }
}

pub struct OfflineRecords<'a> {
    files: std::slice::Iter<'a, PathBuf>,
    current: Option<Lines<BufReader<File>>>,
}

impl Iterator for OfflineRecords<'_> {
    type Item = Result<TraceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(lines) = self.current.as_mut() {
                match lines.next() {
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => {
                        return Some(
                            serde_json::from_str(&line).context("Could not parse trace record"),
                        )
                    }
                    Some(Err(err)) => return Some(Err(err.into())),
                    None => self.current = None,
                }
            }
            let path = self.files.next()?;
            match File::open(path) {
                Ok(file) => self.current = Some(BufReader::new(file).lines()),
                Err(err) => {
                    return Some(
                        Err(err).with_context(|| format!("Could not open trace file {:?}", path)),
                    )
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(i: i64) -> TraceRecord {
        TraceRecord {
            variables: Vec::new(),
            log_prob: 0.,
            log_prob_observed: 0.,
            log_importance_weight: 0.,
            result: serde_json::json!(i),
        }
    }

    #[test]
    fn rotates_and_reads_back_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut storage = JsonlConfig::new(dir.path())
            .with_traces_per_file(4)
            .new_storage()?;
        for i in 0..10 {
            storage.record_trace(record(i))?;
        }
        let files = storage.finalize()?;
        assert_eq!(files.len(), 3);

        let offline = OfflineTraces::open(dir.path())?;
        assert_eq!(offline.files(), files.as_slice());
        let results = offline
            .records()
            .map(|r| r.and_then(|r| r.result_as::<i64>()))
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(results, (0..10).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn ignores_unrelated_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("notes.txt"), "hello")?;
        let offline = OfflineTraces::open(dir.path())?;
        assert_eq!(offline.records().count(), 0);
        Ok(())
    }
}
