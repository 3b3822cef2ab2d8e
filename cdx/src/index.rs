use std::sync::Arc;

use thiserror::Error;

use crate::batch::{BatchOptions, Batcher, FlushReport};
use crate::query::{self, QueryError, QueryOptions, ResultStream, RevisitTarget, SearchRequest};
use crate::reclaim::{ReclaimOptions, Reclaimer};
use crate::record::{self, CaptureRecord, FileInfo, RecordError};
use crate::store::{self, Namespace, Store, StoreError, StoreOptions};

/// Everything needed to open a [`CdxIndex`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexOptions {
    pub store: StoreOptions,
    pub batch: BatchOptions,
    pub reclaim: ReclaimOptions,
    pub query: QueryOptions,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("capture cannot be indexed")]
    Record(#[from] RecordError),
    #[error("storage error")]
    Store(#[from] StoreError),
}

/// A capture index: a store plus the batcher writing to it and the
/// reclaimer maintaining it.
///
/// Writes are queued and become visible to searches once flushed, either by
/// the batcher's size and time thresholds or an explicit [`flush`](CdxIndex::flush).
pub struct CdxIndex {
    store: Arc<dyn Store>,
    batcher: Batcher,
    reclaimer: Reclaimer,
    query: QueryOptions,
    closed: bool,
}

impl CdxIndex {
    pub fn open(options: IndexOptions) -> Result<CdxIndex, StoreError> {
        let store = store::open(&options.store)?;
        Self::with_store(store, options)
    }

    /// Build an index over an already-open store.
    pub fn with_store(store: Arc<dyn Store>, options: IndexOptions) -> Result<CdxIndex, StoreError> {
        let batcher = Batcher::start(Arc::clone(&store), &options.batch)?;
        let reclaimer = Reclaimer::start(Arc::clone(&store), &options.reclaim)?;
        Ok(CdxIndex {
            store,
            batcher,
            reclaimer,
            query: options.query,
            closed: false,
        })
    }

    /// Queue a capture for indexing.
    pub fn write(&self, record: &CaptureRecord) -> Result<(), WriteError> {
        let entries = record::encode(record)?;
        trace!(
            "Queue {} {}",
            record.record_id,
            String::from_utf8_lossy(&entries.cdx.key)
        );
        if let Some(report) = self.batcher.push(entries) {
            if report.dropped > 0 {
                warn!("{} captures dropped while flushing a full queue", report.dropped);
            }
        }
        Ok(())
    }

    /// Write every queued capture now.
    pub fn flush(&self) -> FlushReport {
        self.batcher.flush()
    }

    /// Sum of every flush since the index was opened, whether triggered by
    /// [`write`](CdxIndex::write), the batch timer or [`flush`](CdxIndex::flush).
    pub fn flush_totals(&self) -> FlushReport {
        self.batcher.totals()
    }

    /// Storage reference of a WARC record, if indexed.
    pub fn resolve_id(&self, record_id: &str) -> Result<Option<String>, QueryError> {
        match self.store.get(Namespace::Id, record_id.as_bytes())? {
            Some(value) => Ok(Some(record::decode_storage_ref(&value)?)),
            None => Ok(None),
        }
    }

    /// What was recorded about a source file when it was last indexed.
    pub fn resolve_filename(&self, name: &str) -> Result<Option<FileInfo>, QueryError> {
        match self.store.get(Namespace::File, name.as_bytes())? {
            Some(value) => Ok(Some(FileInfo::decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Record that a source file has been indexed in full.
    pub fn put_file_info(&self, info: &FileInfo) -> Result<(), WriteError> {
        self.store
            .put(Namespace::File, info.name.as_bytes(), &info.encode()?)?;
        Ok(())
    }

    pub fn search(&self, request: &SearchRequest) -> Result<ResultStream, QueryError> {
        query::search(Arc::clone(&self.store), request, &self.query)
    }

    /// Captures of `url`, nearest to `target` (4 to 14 digits) first.
    pub fn closest(
        &self,
        url: &str,
        target: &str,
        limit: Option<usize>,
    ) -> Result<ResultStream, QueryError> {
        query::closest(Arc::clone(&self.store), url, target, limit, &self.query)
    }

    pub fn resolve_revisit(&self, revisit: &CaptureRecord) -> Result<RevisitTarget, QueryError> {
        query::resolve_revisit(&*self.store, revisit)
    }

    /// Remove every entry from every namespace, including queued writes.
    pub fn delete_all(&self) -> Result<(), StoreError> {
        let discarded = self.batcher.discard();
        if discarded > 0 {
            info!("Discarded {} queued captures", discarded);
        }
        for ns in Namespace::ALL {
            self.store.delete_all(ns)?;
        }
        Ok(())
    }

    /// Number of entries in a namespace, not counting queued writes.
    pub fn count(&self, ns: Namespace) -> Result<usize, StoreError> {
        self.store.count(ns)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Flush queued writes, run the shutdown reclamation pass and close the store.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let report = self.batcher.stop();
        if report.dropped > 0 {
            warn!("{} captures dropped in final flush", report.dropped);
        }
        self.reclaimer.stop();
        self.store.close()
    }
}

impl Drop for CdxIndex {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Closing index failed: {}", e);
        }
    }
}
