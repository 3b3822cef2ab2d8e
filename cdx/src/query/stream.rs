//! Streaming query results from a worker thread to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::QueryError;
use crate::record::CaptureRecord;

pub type QueryResult = Result<CaptureRecord, QueryError>;

/// Asks a running query to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Results of one search, in order.
///
/// A query stopped through its [`CancelToken`] ends with
/// `Err(QueryError::Cancelled)`; any other error is attached to the result it
/// affected. Dropping the stream cancels the query and waits for its worker.
pub struct ResultStream {
    rx: Receiver<QueryResult>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl ResultStream {
    pub(crate) fn new(rx: Receiver<QueryResult>, cancel: CancelToken, worker: JoinHandle<()>) -> Self {
        ResultStream {
            rx,
            cancel,
            worker: Some(worker),
        }
    }

    /// A token that cancels this query, usable from other threads.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Iterator for ResultStream {
    type Item = QueryResult;

    fn next(&mut self) -> Option<QueryResult> {
        self.rx.recv().ok()
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        // The worker may be blocked on a full channel.
        while self.rx.recv().is_ok() {}
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Query worker panicked");
            }
        }
    }
}

/// Whether a producer should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// The producing half of a [`ResultStream`], enforcing limit and cancellation.
pub(crate) struct Emitter {
    tx: SyncSender<QueryResult>,
    cancel: CancelToken,
    limit: Option<usize>,
    sent: usize,
    stopped: bool,
}

impl Emitter {
    pub(crate) fn new(tx: SyncSender<QueryResult>, cancel: CancelToken, limit: Option<usize>) -> Self {
        Emitter {
            tx,
            cancel,
            limit,
            sent: 0,
            stopped: limit == Some(0),
        }
    }

    /// Number of records emitted.
    pub(crate) fn sent(&self) -> usize {
        self.sent
    }

    /// Check for cancellation, sending the terminal marker the first time it is seen.
    pub(crate) fn check(&mut self) -> Flow {
        if self.stopped {
            return Flow::Stop;
        }
        if self.cancel.is_cancelled() {
            self.stopped = true;
            let _ = self.tx.send(Err(QueryError::Cancelled));
            return Flow::Stop;
        }
        Flow::Continue
    }

    pub(crate) fn token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Send a record.
    pub(crate) fn emit(&mut self, record: CaptureRecord) -> Flow {
        if self.check() == Flow::Stop {
            return Flow::Stop;
        }
        if self.tx.send(Ok(record)).is_err() {
            self.stopped = true;
            return Flow::Stop;
        }
        self.sent += 1;
        if self.limit.map_or(false, |limit| self.sent >= limit) {
            self.stopped = true;
            return Flow::Stop;
        }
        Flow::Continue
    }

    /// Send an error that concerns a single result; the query goes on.
    pub(crate) fn error(&mut self, error: QueryError) -> Flow {
        if self.check() == Flow::Stop {
            return Flow::Stop;
        }
        if self.tx.send(Err(error)).is_err() {
            self.stopped = true;
            return Flow::Stop;
        }
        Flow::Continue
    }

    /// Send a record or a per-record error.
    pub(crate) fn send(&mut self, result: QueryResult) -> Flow {
        match result {
            Ok(record) => self.emit(record),
            Err(e) => self.error(e),
        }
    }

    /// Send an error that ended the query.
    pub(crate) fn fail(&mut self, error: QueryError) {
        if !self.stopped {
            self.stopped = true;
            let _ = self.tx.send(Err(error));
        }
    }
}
