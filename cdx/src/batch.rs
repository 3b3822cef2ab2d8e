//! Buffering of index writes.
//!
//! Captures are queued and written to the store in batches, either when the
//! queue reaches [`BatchOptions::max_size`] (synchronously, by the writer that
//! filled it) or every [`BatchOptions::max_wait`] from a timer thread.
//! Stopping the batcher flushes whatever is still queued.

use std::mem;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::record::Entries;
use crate::store::{Namespace, Put, Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    /// Queue length that triggers an immediate flush.
    pub max_size: usize,
    /// Longest a queued capture waits before being flushed.
    pub max_wait: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            max_size: 1000,
            max_wait: Duration::from_secs(5),
        }
    }
}

/// What one flush did with the captures it took from the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Captures taken from the queue.
    pub records: usize,
    /// Entries written across both namespaces.
    pub written: usize,
    /// Entries left out for having an oversized key.
    pub skipped: usize,
    /// Captures lost to write failures or oversized record ids.
    pub dropped: usize,
}

impl FlushReport {
    fn merge(&mut self, other: FlushReport) {
        self.records += other.records;
        self.written += other.written;
        self.skipped += other.skipped;
        self.dropped += other.dropped;
    }
}

struct Shared {
    store: Arc<dyn Store>,
    queue: Mutex<Vec<Entries>>,
    // Serializes flushes so an explicit flush returns only after any timer
    // flush in progress has landed.
    writing: Mutex<()>,
    // Sum of every flush so far, whichever thread ran it.
    totals: Mutex<FlushReport>,
    max_size: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock cannot leave the queue half-updated.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn flush(&self) -> FlushReport {
        let _writing = lock(&self.writing);
        let batch = mem::take(&mut *lock(&self.queue));
        if batch.is_empty() {
            return FlushReport::default();
        }
        let report = self.write(batch);
        lock(&self.totals).merge(report);
        report
    }

    fn write(&self, batch: Vec<Entries>) -> FlushReport {
        let mut report = FlushReport {
            records: batch.len(),
            ..Default::default()
        };
        let limit = self.store.max_key_size();

        let mut ids = Vec::with_capacity(batch.len());
        let mut captures = Vec::with_capacity(batch.len());
        for entries in batch {
            if entries.id.key.len() > limit {
                warn!(
                    "Dropping capture with {}-byte record id (limit {}): {:.64}",
                    entries.id.key.len(),
                    limit,
                    String::from_utf8_lossy(&entries.id.key)
                );
                report.dropped += 1;
                continue;
            }
            ids.push(Put::new(Namespace::Id, entries.id.key, entries.id.value));
            captures.push(Put::new(Namespace::Cdx, entries.cdx.key, entries.cdx.value));
        }

        // A capture is only useful if its record id resolves, so capture
        // entries are withheld when the ids did not make it to the store.
        let pending = captures.len();
        match self.store.write_batch(ids) {
            Ok(summary) => {
                report.written += summary.written;
                report.skipped += summary.skipped;
            }
            Err(e) => {
                report_failure(Namespace::Id, pending, &e);
                report.dropped += pending;
                return report;
            }
        }
        match self.store.write_batch(captures) {
            Ok(summary) => {
                report.written += summary.written;
                report.skipped += summary.skipped;
            }
            Err(e) => {
                report_failure(Namespace::Cdx, pending, &e);
                report.dropped += pending;
            }
        }

        debug!("Flushed {:?}", report);
        report
    }
}

fn report_failure(ns: Namespace, records: usize, e: &StoreError) {
    error!(
        "Writing {} entries failed; dropping {} captures: {}",
        ns, records, e
    );
}

/// Queues captures and writes them to a store in batches.
pub struct Batcher {
    shared: Arc<Shared>,
    timer: Option<(JoinHandle<()>, Sender<()>)>,
}

impl Batcher {
    /// Start a batcher and its flush timer.
    pub fn start(store: Arc<dyn Store>, options: &BatchOptions) -> Result<Batcher, StoreError> {
        let shared = Arc::new(Shared {
            store,
            queue: Mutex::new(Vec::with_capacity(options.max_size)),
            writing: Mutex::new(()),
            totals: Mutex::new(FlushReport::default()),
            max_size: options.max_size.max(1),
        });

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let timer_shared = Arc::clone(&shared);
        let max_wait = options.max_wait;
        let handle = thread::Builder::new()
            .name("cdx-batch".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(max_wait) {
                    Err(RecvTimeoutError::Timeout) => {
                        timer_shared.flush();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Batcher {
            shared,
            timer: Some((handle, stop_tx)),
        })
    }

    /// Queue a capture's entries, flushing in the caller if the queue is full.
    pub fn push(&self, entries: Entries) -> Option<FlushReport> {
        let full = {
            let mut queue = lock(&self.shared.queue);
            queue.push(entries);
            queue.len() >= self.shared.max_size
        };
        if full {
            Some(self.shared.flush())
        } else {
            None
        }
    }

    /// Write everything queued so far.
    pub fn flush(&self) -> FlushReport {
        self.shared.flush()
    }

    /// Everything flushed since the batcher started, including flushes
    /// triggered by [`push`](Batcher::push) and the timer.
    pub fn totals(&self) -> FlushReport {
        *lock(&self.shared.totals)
    }

    /// Number of captures waiting to be flushed.
    pub fn pending(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Throw away everything queued, returning how many captures were discarded.
    pub fn discard(&self) -> usize {
        let _writing = lock(&self.shared.writing);
        mem::take(&mut *lock(&self.shared.queue)).len()
    }

    /// Stop the timer and flush the queue.
    ///
    /// Captures pushed after this are only written by an explicit [`flush`](Batcher::flush).
    pub fn stop(&mut self) -> FlushReport {
        let mut report = FlushReport::default();
        if let Some((handle, stop)) = self.timer.take() {
            let _ = stop.send(());
            if handle.join().is_err() {
                error!("Batch flush thread panicked");
            }
            report.merge(self.shared.flush());
            info!("Batcher stopped after final flush: {:?}", report);
        }
        report
    }
}

impl Drop for Batcher {
    fn drop(&mut self) {
        self.stop();
    }
}
