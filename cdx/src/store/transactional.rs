//! Transactional storage on `redb`.
//!
//! Every batch is one write transaction and every snapshot one read
//! transaction, so a query sees the index exactly as it was when it started.
//! Scans fetch entries a page at a time rather than holding a range iterator
//! open, the same way a client of a remote transactional store pages through
//! a range.

use std::collections::VecDeque;
use std::fs;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::RwLock;

use redb::{CompactionError, Database, ReadOnlyTable, ReadTransaction, TableDefinition};

use super::{
    Backend, Cursor, KeyRange, Namespace, Order, Put, Snapshot, Store, StoreError, StoreOptions,
};

const FILE_NAME: &str = "index.redb";

/// Entries fetched per scan round trip.
const PAGE_SIZE: usize = 512;

type Table = ReadOnlyTable<&'static [u8], &'static [u8]>;

pub struct RedbStore {
    // Compaction needs exclusive access; everything else shares.
    db: RwLock<Database>,
    names: [String; 3],
    max_key_size: usize,
    remove_on_drop: Option<PathBuf>,
}

impl RedbStore {
    pub fn open(options: &StoreOptions) -> Result<RedbStore, StoreError> {
        fs::create_dir_all(&options.path)?;
        let db = Database::create(options.path.join(FILE_NAME))?;

        let store = RedbStore {
            db: RwLock::new(db),
            names: options.table_names(),
            max_key_size: options.max_key_size(),
            remove_on_drop: options.temporary.then(|| options.path.clone()),
        };

        // Read transactions cannot open tables that were never created.
        {
            let db = store.db.read().map_err(|_| StoreError::Poisoned)?;
            let txn = db.begin_write()?;
            for ns in Namespace::ALL {
                txn.open_table(store.definition(ns))?;
            }
            txn.commit()?;
        }
        Ok(store)
    }

    fn definition(&self, ns: Namespace) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
        TableDefinition::new(&self.names[ns.index()])
    }

    fn fragmentation(&self, db: &Database) -> Result<f64, StoreError> {
        let txn = db.begin_write()?;
        let stats = txn.stats()?;
        txn.abort()?;

        let fragmented = stats.fragmented_bytes() as f64;
        let total = (stats.stored_bytes() + stats.metadata_bytes()) as f64 + fragmented;
        Ok(if total > 0.0 { fragmented / total } else { 0.0 })
    }
}

impl Store for RedbStore {
    fn backend(&self) -> Backend {
        Backend::Redb
    }

    fn max_key_size(&self) -> usize {
        self.max_key_size
    }

    fn apply(&self, puts: &[Put]) -> Result<(), StoreError> {
        let db = self.db.read().map_err(|_| StoreError::Poisoned)?;
        let txn = db.begin_write()?;
        for ns in Namespace::ALL {
            let mut puts = puts.iter().filter(|p| p.ns == ns).peekable();
            if puts.peek().is_none() {
                continue;
            }
            let mut table = txn.open_table(self.definition(ns))?;
            for put in puts {
                table.insert(put.key.as_slice(), put.value.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let db = self.db.read().map_err(|_| StoreError::Poisoned)?;
        let table = db.begin_read()?.open_table(self.definition(ns))?;
        let value = table.get(key)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    fn snapshot(&self) -> Result<Box<dyn Snapshot + '_>, StoreError> {
        let db = self.db.read().map_err(|_| StoreError::Poisoned)?;
        Ok(Box::new(RedbView {
            store: self,
            txn: db.begin_read()?,
        }))
    }

    fn delete_all(&self, ns: Namespace) -> Result<(), StoreError> {
        let db = self.db.read().map_err(|_| StoreError::Poisoned)?;
        let txn = db.begin_write()?;
        let definition = self.definition(ns);
        txn.delete_table(definition)?;
        txn.open_table(definition)?;
        txn.commit()?;
        info!("Cleared redb table {}", ns);
        Ok(())
    }

    fn reclaim(&self, discard_ratio: f64) -> Result<bool, StoreError> {
        let ratio = {
            let db = self.db.read().map_err(|_| StoreError::Poisoned)?;
            self.fragmentation(&db)?
        };
        if ratio < discard_ratio {
            debug!(
                "redb fragmentation {:.3} below {}; not compacting",
                ratio, discard_ratio
            );
            return Ok(false);
        }

        let mut db = self.db.write().map_err(|_| StoreError::Poisoned)?;
        match db.compact() {
            Ok(compacted) => {
                info!("Compacted redb store (fragmentation was {:.3})", ratio);
                Ok(compacted)
            }
            Err(CompactionError::TransactionInProgress) => {
                info!("Queries in progress; redb compaction deferred to next pass");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<(), StoreError> {
        // Commits are durable already.
        Ok(())
    }
}

impl Drop for RedbStore {
    fn drop(&mut self) {
        if let Some(path) = &self.remove_on_drop {
            if let Err(e) = fs::remove_file(path.join(FILE_NAME)) {
                warn!("Failed to remove temporary store {}: {}", path.display(), e);
            }
        }
    }
}

struct RedbView<'a> {
    store: &'a RedbStore,
    txn: ReadTransaction,
}

impl Snapshot for RedbView<'_> {
    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let table = self.txn.open_table(self.store.definition(ns))?;
        let value = table.get(key)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    fn scan(
        &self,
        ns: Namespace,
        range: KeyRange,
        order: Order,
    ) -> Result<Cursor<'_>, StoreError> {
        if range.is_empty() {
            return Ok(Cursor::empty());
        }
        let table = self.txn.open_table(self.store.definition(ns))?;
        Ok(Cursor::new(Pages {
            table,
            lower: Bound::Included(range.start),
            upper: Bound::Excluded(range.end),
            order,
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }
}

/// A range scan that reads [`PAGE_SIZE`] entries per table lookup.
struct Pages {
    table: Table,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    order: Order,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    exhausted: bool,
}

fn borrow(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_slice()),
        Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

impl Pages {
    fn fetch(&mut self) -> Result<(), StoreError> {
        let mut page = Vec::with_capacity(PAGE_SIZE);
        {
            let range = self
                .table
                .range::<&[u8]>((borrow(&self.lower), borrow(&self.upper)))?;
            let entries: Box<dyn Iterator<Item = _> + '_> = match self.order {
                Order::Ascending => Box::new(range),
                Order::Descending => Box::new(range.rev()),
            };
            for entry in entries.take(PAGE_SIZE) {
                let (k, v) = entry?;
                page.push((k.value().to_vec(), v.value().to_vec()));
            }
        }

        if page.len() < PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            match self.order {
                Order::Ascending => self.lower = Bound::Excluded(last.clone()),
                Order::Descending => self.upper = Bound::Excluded(last.clone()),
            }
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for Pages {
    type Item = Result<(Vec<u8>, Vec<u8>), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
