//! Feeding WARC files into a capture index.
//!
//! [`warc::RecordReader`] reads records from a file, plain or with one gzip
//! member per record, and [`capture::capture`] turns each `response` or
//! `revisit` record into a [`CaptureRecord`](cdx::CaptureRecord) whose storage
//! reference is `<file name>:<offset>:<length>`. [`Indexer`] ties these to a
//! [`CdxIndex`], skipping files that have not changed since they were last
//! indexed.

#[macro_use]
extern crate log;

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use cdx::{CdxIndex, FileInfo, QueryError, WriteError};
use indicatif::ProgressBar;
use thiserror::Error;

use crate::warc::{Compression, InvalidRecord, RecordReader};

pub mod capture;
pub mod digest;
pub mod warc;

const READ_BUFFER: usize = 64 << 10;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("cannot read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Records after a malformed one cannot be located, so the rest of the
    /// file is abandoned.
    #[error("malformed record in {name} at offset {offset}")]
    Record {
        name: String,
        offset: u64,
        #[source]
        source: InvalidRecord,
    },
    #[error("index lookup failed")]
    Query(#[from] QueryError),
    #[error("index update failed")]
    Write(#[from] WriteError),
}

/// Counts of what happened to the records of one input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub records: usize,
    pub indexed: usize,
    /// Records of types that are not indexed.
    pub skipped: usize,
    /// Indexable records that could not be described as captures.
    pub invalid: usize,
}

/// What [`Indexer::index_file`] did with a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Same size and modification time as when it was last indexed.
    Unchanged,
    Indexed(IndexStats),
    /// Some captures were lost when flushing, so the file is not marked as
    /// indexed and will be read again next time.
    Incomplete(IndexStats),
}

pub struct Indexer<'a> {
    index: &'a CdxIndex,
    progress: ProgressBar,
}

impl<'a> Indexer<'a> {
    pub fn new(index: &'a CdxIndex) -> Self {
        Indexer {
            index,
            progress: ProgressBar::hidden(),
        }
    }

    /// Report progress through `bar`, measured in bytes of input.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = bar;
        self
    }

    /// Index every capture in a WARC file unless it is unchanged since it was
    /// last indexed.
    pub fn index_file<P: AsRef<Path>>(&self, path: P) -> Result<FileOutcome, IndexError> {
        let path = path.as_ref();
        let io_error = |source| IndexError::Io {
            path: path.to_owned(),
            source,
        };

        let info = FileInfo::from_path(path).map_err(io_error)?;
        if let Some(previous) = self.index.resolve_filename(&info.name)? {
            if previous.is_unchanged(&info) {
                info!("{} is unchanged since it was indexed", info.name);
                return Ok(FileOutcome::Unchanged);
            }
            debug!("{} changed since it was indexed; reindexing", info.name);
        }

        let file = File::open(path).map_err(io_error)?;
        let dropped_before = self.index.flush_totals().dropped;
        self.progress.set_length(info.size);
        self.progress.set_position(0);
        self.progress.set_message(info.name.clone());

        let stats = self.index_stream(
            BufReader::with_capacity(READ_BUFFER, file),
            Compression::guess_for_filename(path),
            &info.name,
        )?;
        self.index.flush();
        // Captures may also have been flushed by a full queue or the batch
        // timer while the file was being read.
        let dropped = self.index.flush_totals().dropped - dropped_before;
        if dropped > 0 {
            warn!(
                "{} captures were dropped while indexing {}; it will be read again",
                dropped, info.name
            );
            return Ok(FileOutcome::Incomplete(stats));
        }

        self.index.put_file_info(&info)?;
        info!(
            "Indexed {}: {} captures from {} records",
            info.name, stats.indexed, stats.records
        );
        Ok(FileOutcome::Indexed(stats))
    }

    /// Queue every capture in `input`, recording `name` as its storage location.
    ///
    /// Captures are only queued; flush the index to make them searchable.
    pub fn index_stream<R: BufRead>(
        &self,
        input: R,
        compression: Compression,
        name: &str,
    ) -> Result<IndexStats, IndexError> {
        let mut reader = RecordReader::new(input, compression);
        let mut stats = IndexStats::default();

        loop {
            let offset = reader.position();
            let record = match reader.read_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(source) => {
                    return Err(IndexError::Record {
                        name: name.to_owned(),
                        offset,
                        source,
                    })
                }
            };
            stats.records += 1;
            self.progress.set_position(reader.position());

            let id = record.header.record_id().unwrap_or("<missing>");
            match capture::capture(&record, name) {
                Ok(Some(capture)) => match self.index.write(&capture) {
                    Ok(()) => stats.indexed += 1,
                    Err(e) => {
                        warn!("Not indexing record {} in {}: {}", id, name, e);
                        stats.invalid += 1;
                    }
                },
                Ok(None) => {
                    trace!("Skip {:?} record {}", record.header.warc_type(), id);
                    stats.skipped += 1;
                }
                Err(e) => {
                    warn!("Not indexing record {} in {}: {}", id, name, e);
                    stats.invalid += 1;
                }
            }
        }

        Ok(stats)
    }
}
