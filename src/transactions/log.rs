//! Restoring and appending the transaction log.
//!
//! [`RestoredLog`] parses a prior (possibly partial) log so a run can be
//! reconciled against it: the experiment descriptor is recovered, finished
//! work items are collected, and a truncated trailing line left by a crash
//! is tolerated. [`TransactionSink`] is the single append point for new
//! records; it is only ever driven from the coordinator.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::{ExperimentDescriptor, Record, WorkItemId, SCHEMA_VERSION};

/// Errors raised while restoring or appending the transaction log.
///
/// All of these are fatal for the run: a log that cannot be parsed (other
/// than its final line) or appended to cannot be safely extended. Records
/// flushed before an append failure remain valid.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error(
        "Conflicting experiment descriptors in log: ({0:?}) and ({1:?})",
    )]
    DescriptorConflict(ExperimentDescriptor, ExperimentDescriptor),

    #[error("Log schema {found} is newer than supported schema {supported}")]
    UnsupportedSchema { found: u64, supported: u64 },
}

/// A fully parsed prior transaction log.
#[derive(Debug, Default)]
pub struct RestoredLog {
    /// Every successfully parsed record, in file order.
    pub records: Vec<Record>,
    /// The descriptor recovered from the first `X` record, if any.
    pub descriptor: Option<ExperimentDescriptor>,
    /// Work items that already have recorded interaction results.
    pub finished: BTreeSet<WorkItemId>,
}

impl RestoredLog {
    /// Parses the log at `path` in full.
    ///
    /// An unparsable *final* record is assumed to be a line truncated by a
    /// crash mid-append: it is logged and discarded. An unparsable record
    /// anywhere else means the file is not a transaction log and is fatal.
    pub fn load(path: &Path) -> Result<Self, LogError> {
        let text = std::fs::read_to_string(path)?;
        let lines: Vec<(usize, &str)> = text
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .collect();

        let mut restored = RestoredLog::default();
        let last = lines.len().saturating_sub(1);

        for (position, (line_no, line)) in lines.iter().enumerate() {
            match Record::decode(line) {
                Ok(record) => restored.absorb(record)?,
                Err(reason) if position == last => {
                    warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        %reason,
                        "Discarding truncated trailing record from interrupted run"
                    );
                }
                Err(reason) => {
                    return Err(LogError::Malformed {
                        line: line_no + 1,
                        reason: reason.to_string(),
                    });
                }
            }
        }

        debug!(
            path = %path.display(),
            records = restored.records.len(),
            finished = restored.finished.len(),
            "Restored transaction log"
        );

        Ok(restored)
    }

    fn absorb(&mut self, record: Record) -> Result<(), LogError> {
        match &record {
            Record::Version { schema } => {
                if *schema > SCHEMA_VERSION {
                    return Err(LogError::UnsupportedSchema {
                        found: *schema,
                        supported: SCHEMA_VERSION,
                    });
                }
            }
            Record::Experiment {
                n_learners,
                n_environments,
            } => {
                let found = ExperimentDescriptor {
                    n_learners: *n_learners,
                    n_environments: *n_environments,
                };
                match self.descriptor {
                    None => self.descriptor = Some(found),
                    Some(existing) if existing != found => {
                        return Err(LogError::DescriptorConflict(existing, found));
                    }
                    Some(_) => {}
                }
            }
            Record::Interaction { .. } => {
                if let Some(id) = record.work_item_id() {
                    self.finished.insert(id);
                }
            }
            _ => {}
        }
        self.records.push(record);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Removes a truncated trailing record left by a crash mid-append.
///
/// Appending after a damaged tail would turn it into a malformed interior
/// line, making the log unreadable; cutting the file back to the last valid
/// record keeps restore and append consistent.
fn trim_truncated_tail(path: &Path) -> Result<(), LogError> {
    let text = std::fs::read_to_string(path)?;
    let mut last: Option<(usize, &str)> = None;
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        if !line.trim().is_empty() {
            last = Some((offset, line));
        }
        offset += line.len();
    }
    if let Some((start, line)) = last {
        if Record::decode(line.trim_end()).is_err() {
            warn!(
                path = %path.display(),
                "Trimming truncated trailing record before appending"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(start as u64)?;
        }
    }
    Ok(())
}

enum SinkInner {
    File { writer: BufWriter<File>, path: PathBuf },
    Memory(Vec<Record>),
}

/// The append-only sink for a run's records.
///
/// Writes one minified line per record and flushes each append, so a crash
/// leaves at most one truncated trailing line. Param records already present
/// (restored or appended earlier in this run) are skipped, keeping a resumed
/// log merge-compatible: every id appears once no matter how many work items
/// reference it.
pub struct TransactionSink {
    inner: SinkInner,
    wrote_version: bool,
    wrote_descriptor: bool,
    env_ids: BTreeSet<u32>,
    lrn_ids: BTreeSet<u32>,
    val_ids: BTreeSet<u32>,
    appended: usize,
}

impl TransactionSink {
    /// Opens (or creates) the log at `path` for appending.
    ///
    /// `restored` primes the duplicate-suppression state so records carried
    /// over from a prior run are not re-written. A `V` record is always
    /// appended; the `X` descriptor is appended only for a fresh log.
    pub fn file(
        path: &Path,
        restored: &RestoredLog,
        descriptor: ExperimentDescriptor,
    ) -> Result<Self, LogError> {
        if path.exists() {
            trim_truncated_tail(path)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut sink = Self {
            inner: SinkInner::File {
                writer: BufWriter::new(file),
                path: path.to_path_buf(),
            },
            wrote_version: false,
            wrote_descriptor: restored.descriptor.is_some(),
            env_ids: BTreeSet::new(),
            lrn_ids: BTreeSet::new(),
            val_ids: BTreeSet::new(),
            appended: 0,
        };
        sink.prime(restored);
        sink.write_preamble(descriptor)?;
        Ok(sink)
    }

    /// An in-memory sink for runs that do not target a file.
    pub fn memory(descriptor: ExperimentDescriptor) -> Self {
        let mut sink = Self {
            inner: SinkInner::Memory(Vec::new()),
            wrote_version: false,
            wrote_descriptor: false,
            env_ids: BTreeSet::new(),
            lrn_ids: BTreeSet::new(),
            val_ids: BTreeSet::new(),
            appended: 0,
        };
        // Memory appends cannot fail.
        let _ = sink.write_preamble(descriptor);
        sink
    }

    fn prime(&mut self, restored: &RestoredLog) {
        for record in &restored.records {
            match record {
                Record::EnvironmentParams { env_id, .. } => {
                    self.env_ids.insert(*env_id);
                }
                Record::LearnerParams { lrn_id, .. } => {
                    self.lrn_ids.insert(*lrn_id);
                }
                Record::EvaluatorParams { val_id, .. } => {
                    self.val_ids.insert(*val_id);
                }
                _ => {}
            }
        }
    }

    fn write_preamble(&mut self, descriptor: ExperimentDescriptor) -> Result<(), LogError> {
        self.append(Record::Version {
            schema: SCHEMA_VERSION,
        })?;
        self.append(Record::Experiment {
            n_learners: descriptor.n_learners,
            n_environments: descriptor.n_environments,
        })
    }

    /// Appends a record, suppressing duplicates of idempotent record kinds.
    ///
    /// Any I/O failure here is fatal for the run; lines flushed before the
    /// failure remain valid on disk.
    pub fn append(&mut self, record: Record) -> Result<(), LogError> {
        let fresh = match &record {
            Record::Version { .. } => !std::mem::replace(&mut self.wrote_version, true),
            Record::Experiment { .. } => !std::mem::replace(&mut self.wrote_descriptor, true),
            Record::EnvironmentParams { env_id, .. } => self.env_ids.insert(*env_id),
            Record::LearnerParams { lrn_id, .. } => self.lrn_ids.insert(*lrn_id),
            Record::EvaluatorParams { val_id, .. } => self.val_ids.insert(*val_id),
            Record::Interaction { .. } => true,
        };
        if !fresh {
            return Ok(());
        }

        match &mut self.inner {
            SinkInner::File { writer, .. } => {
                writeln!(writer, "{}", record.encode())?;
                writer.flush()?;
            }
            SinkInner::Memory(records) => records.push(record),
        }
        self.appended += 1;
        Ok(())
    }

    /// Number of records actually written by this sink (duplicates excluded).
    pub fn appended(&self) -> usize {
        self.appended
    }

    /// The target path for file-backed sinks.
    pub fn path(&self) -> Option<&Path> {
        match &self.inner {
            SinkInner::File { path, .. } => Some(path),
            SinkInner::Memory(_) => None,
        }
    }

    /// Consumes a memory sink, returning the records it collected.
    pub fn into_records(self) -> Vec<Record> {
        match self.inner {
            SinkInner::Memory(records) => records,
            SinkInner::File { .. } => Vec::new(),
        }
    }
}
