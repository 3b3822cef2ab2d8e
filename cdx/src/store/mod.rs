//! Sorted key-value storage for the three index namespaces.
//!
//! Two backends implement [`Store`]: [`LmdbStore`], an embedded
//! memory-mapped store, and [`RedbStore`], a transactional B-tree store. Both
//! give MVCC snapshots. Everything above this module works through the trait
//! and never needs to know which one it has.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

mod embedded;
mod transactional;

pub use embedded::LmdbStore;
pub use transactional::RedbStore;

/// The logical namespaces of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// WARC record id to storage reference.
    Id,
    /// File name to [`FileInfo`](crate::record::FileInfo).
    File,
    /// Capture key to capture record.
    Cdx,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Id, Namespace::File, Namespace::Cdx];

    /// Short tag naming the namespace on disk.
    pub fn tag(self) -> &'static str {
        match self {
            Namespace::Id => "i",
            Namespace::File => "f",
            Namespace::Cdx => "c",
        }
    }

    /// Physical tree or table name, optionally qualified by a database name.
    pub fn table_name(self, db_name: Option<&str>) -> String {
        match db_name {
            Some(db) if !db.is_empty() => format!("{}/{}", db, self.tag()),
            _ => self.tag().to_owned(),
        }
    }

    fn index(self) -> usize {
        match self {
            Namespace::Id => 0,
            Namespace::File => 1,
            Namespace::Cdx => 2,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Namespace::Id => "id",
            Namespace::File => "file",
            Namespace::Cdx => "cdx",
        })
    }
}

/// Which storage engine backs an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    #[default]
    Lmdb,
    Redb,
}

impl Backend {
    /// Largest key the backend accepts unless configured otherwise.
    pub fn default_max_key_size(self) -> usize {
        match self {
            // LMDB's compiled-in key limit.
            Backend::Lmdb => 511,
            Backend::Redb => 8192,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown storage backend {0:?} (expected lmdb or redb)")]
pub struct InvalidBackend(pub String);

impl FromStr for Backend {
    type Err = InvalidBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lmdb" => Ok(Backend::Lmdb),
            "redb" => Ok(Backend::Redb),
            _ => Err(InvalidBackend(s.to_owned())),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Lmdb => "lmdb",
            Backend::Redb => "redb",
        })
    }
}

/// Where and how to open a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub backend: Backend,
    /// Directory holding the store's files.
    pub path: PathBuf,
    /// Qualifies namespace names so several indexes can share one store.
    pub db_name: Option<String>,
    /// Overrides [`Backend::default_max_key_size`].
    pub max_key_size: Option<usize>,
    /// Remove the store's files when it is dropped.
    pub temporary: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            backend: Backend::default(),
            path: PathBuf::from("cdx-index"),
            db_name: None,
            max_key_size: None,
            temporary: false,
        }
    }
}

impl StoreOptions {
    pub fn max_key_size(&self) -> usize {
        self.max_key_size
            .unwrap_or_else(|| self.backend.default_max_key_size())
    }

    pub(crate) fn table_names(&self) -> [String; 3] {
        Namespace::ALL.map(|ns| ns.table_name(self.db_name.as_deref()))
    }
}

/// Open the store described by `options`.
pub fn open(options: &StoreOptions) -> Result<Arc<dyn Store>, StoreError> {
    info!(
        "Opening {} store at {}",
        options.backend,
        options.path.display()
    );
    Ok(match options.backend {
        Backend::Lmdb => Arc::new(LmdbStore::open(options)?),
        Backend::Redb => Arc::new(RedbStore::open(options)?),
    })
}

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("LMDB error")]
    Lmdb(#[from] heed::Error),
    #[error("redb error")]
    Redb(#[source] redb::Error),
    #[error("key of {size} bytes exceeds the {limit}-byte limit")]
    KeyTooLarge { size: usize, limit: usize },
    #[error("store lock poisoned by a panicked writer")]
    Poisoned,
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

macro_rules! redb_errors {
    ($($err:ty),*) => {
        $(
            impl From<$err> for StoreError {
                fn from(e: $err) -> Self {
                    StoreError::Redb(e.into())
                }
            }
        )*
    };
}

redb_errors!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
    redb::CompactionError
);

/// One key to write into a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Put {
    pub ns: Namespace,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Put {
    pub fn new(ns: Namespace, key: Vec<u8>, value: Vec<u8>) -> Self {
        Put { ns, key, value }
    }
}

/// Outcome of [`Store::write_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub written: usize,
    /// Entries left out because their key was too large.
    pub skipped: usize,
}

/// Iteration direction of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// The smallest key greater than every key starting with `prefix`.
///
/// Keys are UTF-8 text, which never contains 0xFF, so appending that byte
/// bounds a prefix from above in either scan direction.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = Vec::with_capacity(prefix.len() + 1);
    end.extend_from_slice(prefix);
    end.push(0xFF);
    end
}

/// A half-open key range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: Vec<u8>, end: Vec<u8>) -> Self {
        KeyRange { start, end }
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        KeyRange {
            start: prefix.to_vec(),
            end: prefix_end(prefix),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

type Item<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), StoreError>> + 'a>;

/// A position in an ordered scan.
///
/// A fresh cursor is already on its first entry, if there is one. Once the
/// cursor runs off the end of its range (or hits an error) it is no longer
/// [`valid`](Cursor::valid) and `key`/`value` return empty slices.
pub struct Cursor<'a> {
    inner: Item<'a>,
    current: Option<(Vec<u8>, Vec<u8>)>,
    error: Option<StoreError>,
}

impl<'a> Cursor<'a> {
    pub fn new<I>(inner: I) -> Self
    where
        I: Iterator<Item = Result<(Vec<u8>, Vec<u8>), StoreError>> + 'a,
    {
        let mut cursor = Cursor {
            inner: Box::new(inner),
            current: None,
            error: None,
        };
        cursor.advance();
        cursor
    }

    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(k, _)| k.as_slice()).unwrap_or(&[])
    }

    pub fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }

    /// Move to the next entry.
    pub fn advance(&mut self) {
        if self.error.is_some() {
            return;
        }
        self.current = match self.inner.next() {
            Some(Ok(kv)) => Some(kv),
            Some(Err(e)) => {
                self.error = Some(e);
                None
            }
            None => None,
        };
    }

    /// Take the error that stopped this cursor early, if any.
    pub fn take_error(&mut self) -> Option<StoreError> {
        self.error.take()
    }

    /// Release the cursor, reporting the error that stopped it early.
    pub fn close(mut self) -> Result<(), StoreError> {
        match self.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("key", &String::from_utf8_lossy(self.key()))
            .field("error", &self.error)
            .finish()
    }
}

/// A consistent read view of a store.
pub trait Snapshot {
    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn scan(&self, ns: Namespace, range: KeyRange, order: Order)
        -> Result<Cursor<'_>, StoreError>;

    fn scan_prefix(
        &self,
        ns: Namespace,
        prefix: &[u8],
        order: Order,
    ) -> Result<Cursor<'_>, StoreError> {
        self.scan(ns, KeyRange::prefix(prefix), order)
    }
}

/// Durable sorted storage of the index namespaces.
pub trait Store: Send + Sync {
    fn backend(&self) -> Backend;

    fn max_key_size(&self) -> usize;

    /// Write every put; those for one namespace are applied atomically.
    fn apply(&self, puts: &[Put]) -> Result<(), StoreError>;

    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Open a read view fixed at this point in time. Nothing written after
    /// this returns is visible through the view.
    fn snapshot(&self) -> Result<Box<dyn Snapshot + '_>, StoreError>;

    /// Remove every entry of a namespace.
    fn delete_all(&self, ns: Namespace) -> Result<(), StoreError>;

    /// Run one space-reclamation pass, returning whether space was reclaimed.
    ///
    /// `discard_ratio` is the fraction of obsolete space that makes reclaiming
    /// worthwhile; lower ratios reclaim more eagerly.
    fn reclaim(&self, discard_ratio: f64) -> Result<bool, StoreError>;

    /// Make every write durable and release resources that need it.
    fn close(&self) -> Result<(), StoreError>;

    fn put(&self, ns: Namespace, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let limit = self.max_key_size();
        if key.len() > limit {
            return Err(StoreError::KeyTooLarge {
                size: key.len(),
                limit,
            });
        }
        self.apply(&[Put::new(ns, key.to_vec(), value.to_vec())])
    }

    /// Write a batch, leaving out (and logging) entries whose key is too large.
    fn write_batch(&self, puts: Vec<Put>) -> Result<WriteSummary, StoreError> {
        let limit = self.max_key_size();
        let (puts, oversized): (Vec<Put>, Vec<Put>) =
            puts.into_iter().partition(|p| p.key.len() <= limit);
        for put in &oversized {
            warn!(
                "Skipping {} entry with {}-byte key (limit {}): {:.64}",
                put.ns,
                put.key.len(),
                limit,
                String::from_utf8_lossy(&put.key)
            );
        }

        if !puts.is_empty() {
            self.apply(&puts)?;
        }
        Ok(WriteSummary {
            written: puts.len(),
            skipped: oversized.len(),
        })
    }

    /// Number of entries in a namespace.
    fn count(&self, ns: Namespace) -> Result<usize, StoreError> {
        let snapshot = self.snapshot()?;
        let mut cursor = snapshot.scan(ns, KeyRange::prefix(b""), Order::Ascending)?;
        let mut n = 0;
        while cursor.valid() {
            n += 1;
            cursor.advance();
        }
        cursor.close()?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn namespace_tables() {
        assert_eq!(Namespace::Cdx.table_name(None), "c");
        assert_eq!(Namespace::Id.table_name(Some("crawl")), "crawl/i");
        assert_eq!(Namespace::File.table_name(Some("")), "f");
    }

    #[test]
    fn prefix_ranges() {
        let range = KeyRange::prefix(b"com,");
        assert_eq!(range.start, b"com,");
        assert_eq!(range.end, b"com,\xff");
        assert!(!range.is_empty());
        assert!(KeyRange::new(b"b".to_vec(), b"a".to_vec()).is_empty());
    }

    #[test]
    fn cursor_stops_at_errors() {
        let items = vec![
            Ok((b"a".to_vec(), b"1".to_vec())),
            Err(StoreError::Poisoned),
            Ok((b"c".to_vec(), b"3".to_vec())),
        ];
        let mut cursor = Cursor::new(items.into_iter());
        assert!(cursor.valid());
        assert_eq!(cursor.key(), b"a");
        assert_eq!(cursor.value(), b"1");
        cursor.advance();
        assert!(!cursor.valid());
        assert_eq!(cursor.key(), b"");
        cursor.advance();
        assert!(!cursor.valid());
        assert!(matches!(cursor.close(), Err(StoreError::Poisoned)));
    }

    #[test]
    fn parses_backends() {
        assert_eq!("REDB".parse::<Backend>(), Ok(Backend::Redb));
        assert_eq!(
            "rocks".parse::<Backend>(),
            Err(InvalidBackend("rocks".into()))
        );
        assert_eq!(Backend::Lmdb.default_max_key_size(), 511);
        assert_eq!(Backend::default(), Backend::Lmdb);
    }
}
