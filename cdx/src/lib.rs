//! A capture ("CDX") index for web archives.
//!
//! ## Background
//!
//! A web archive holds captures: the HTTP responses a crawler received for
//! each URL it fetched, stored in WARC files. Replaying or analyzing an archive
//! starts with finding captures, which a capture index makes possible without
//! reading the archive itself. The index answers questions such as "every
//! capture of this page", "everything under this path", "every page on this
//! domain", or "the capture of this page nearest to 1 March 2020".
//!
//! ## Keys
//!
//! URLs are canonicalized into [SSURT](ssurt) keys, which put the reversed
//! host name first so that byte order matches domain, host and path locality.
//! Each capture is stored under a key made of the SSURT host and path, the
//! capture time and the scheme:
//!
//! ```text
//! com,example,www,///about 20200301120000 443:https: response
//! ```
//!
//! Truncating such a key at different points yields every [match
//! type](matching::MatchType), and appending a timestamp to the URL part
//! gives a seek point for time-based lookups.
//!
//! ## Library structure
//!
//! [`CdxIndex`] is the entry point. It owns a [`Store`](store::Store) (one of
//! two interchangeable backends), a [`Batcher`](batch::Batcher) that queues
//! writes, and a [`Reclaimer`](reclaim::Reclaimer) that compacts the store in
//! the background. Searches run on worker threads and stream their results
//! back through a [`ResultStream`](query::ResultStream).
//!
//! ```no_run
//! use cdx::{CdxIndex, IndexOptions, SearchRequest};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let index = CdxIndex::open(IndexOptions::default())?;
//! for capture in index.search(&SearchRequest::new("http://example.com/"))? {
//!     let capture = capture?;
//!     println!("{} {}", capture.timestamp14(), capture.uri);
//! }
//! index.close()?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod batch;
mod index;
pub mod matching;
pub mod query;
pub mod reclaim;
pub mod record;
pub mod ssurt;
pub mod store;
pub mod timestamp;

pub use index::{CdxIndex, IndexOptions, WriteError};
pub use matching::MatchType;
pub use query::{QueryError, SearchRequest, Sort};
pub use record::{CaptureRecord, FileInfo, RecordType, RevisitLink};
pub use store::{Backend, Namespace, StoreError, StoreOptions};
