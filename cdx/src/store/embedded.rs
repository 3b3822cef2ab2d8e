//! Embedded memory-mapped storage on LMDB.
//!
//! Each namespace is one named LMDB database inside a single environment.
//! Writers are serialized by LMDB itself and every batch is one write
//! transaction; a snapshot is one read transaction, which sees the
//! environment exactly as it was when the transaction began no matter what
//! is committed afterwards.

use std::fs;
use std::ops::Bound;
use std::path::PathBuf;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};

use super::{
    Backend, Cursor, KeyRange, Namespace, Order, Put, Snapshot, Store, StoreError, StoreOptions,
};

/// Upper bound on the environment's size. The data file only grows as far
/// as it is written.
const MAP_SIZE: usize = 1 << 36;

/// Concurrent read transactions, one per running query worker.
const MAX_READERS: u32 = 512;

type Table = Database<Bytes, Bytes>;

pub struct LmdbStore {
    env: Env,
    tables: [Table; 3],
    max_key_size: usize,
    remove_on_drop: Option<PathBuf>,
}

impl LmdbStore {
    pub fn open(options: &StoreOptions) -> Result<LmdbStore, StoreError> {
        fs::create_dir_all(&options.path)?;
        // SAFETY: the environment is opened once per store and its files are
        // only modified through LMDB.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE)
                .max_dbs(Namespace::ALL.len() as u32)
                .max_readers(MAX_READERS)
                .open(&options.path)?
        };

        let [id, file, cdx] = options.table_names();
        let mut txn = env.write_txn()?;
        let tables = [
            env.create_database(&mut txn, Some(id.as_str()))?,
            env.create_database(&mut txn, Some(file.as_str()))?,
            env.create_database(&mut txn, Some(cdx.as_str()))?,
        ];
        txn.commit()?;
        debug!(
            "LMDB store at {} uses {} bytes on disk",
            options.path.display(),
            env.real_disk_size()?
        );

        let limit = Backend::Lmdb.default_max_key_size();
        let max_key_size = options.max_key_size();
        if max_key_size > limit {
            warn!(
                "LMDB keys are limited to {} bytes; ignoring max key size {}",
                limit, max_key_size
            );
        }

        Ok(LmdbStore {
            env,
            tables,
            max_key_size: max_key_size.min(limit),
            remove_on_drop: options.temporary.then(|| options.path.clone()),
        })
    }

    fn table(&self, ns: Namespace) -> Table {
        self.tables[ns.index()]
    }
}

impl Store for LmdbStore {
    fn backend(&self) -> Backend {
        Backend::Lmdb
    }

    fn max_key_size(&self) -> usize {
        self.max_key_size
    }

    fn apply(&self, puts: &[Put]) -> Result<(), StoreError> {
        let mut txn = self.env.write_txn()?;
        for put in puts {
            self.table(put.ns).put(&mut txn, put.key.as_slice(), put.value.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.env.read_txn()?;
        let value = self.table(ns).get(&txn, key)?.map(<[u8]>::to_vec);
        Ok(value)
    }

    fn snapshot(&self) -> Result<Box<dyn Snapshot + '_>, StoreError> {
        Ok(Box::new(LmdbView {
            store: self,
            txn: self.env.read_txn()?,
        }))
    }

    fn delete_all(&self, ns: Namespace) -> Result<(), StoreError> {
        let mut txn = self.env.write_txn()?;
        let table = self.table(ns);
        let cleared = table.len(&txn)?;
        table.clear(&mut txn)?;
        txn.commit()?;
        info!("Cleared {} entries from LMDB database {}", cleared, ns);
        Ok(())
    }

    fn reclaim(&self, discard_ratio: f64) -> Result<bool, StoreError> {
        // LMDB reuses free pages in place. They only become free once no
        // reader can still see them, so the lever is clearing reader slots
        // left behind by dead processes.
        let on_disk = self.env.real_disk_size()?;
        let used = self.env.non_free_pages_size()?;
        let free = if on_disk > 0 {
            1.0 - used as f64 / on_disk as f64
        } else {
            0.0
        };
        if free < discard_ratio {
            debug!("LMDB free share {:.3} below {}", free, discard_ratio);
            return Ok(false);
        }

        let stale = self.env.clear_stale_readers()?;
        self.env.force_sync()?;
        info!(
            "LMDB free share {:.3}: cleared {} stale readers",
            free, stale
        );
        Ok(stale > 0)
    }

    fn close(&self) -> Result<(), StoreError> {
        self.env.force_sync()?;
        Ok(())
    }

    fn count(&self, ns: Namespace) -> Result<usize, StoreError> {
        let txn = self.env.read_txn()?;
        Ok(self.table(ns).len(&txn)? as usize)
    }
}

impl Drop for LmdbStore {
    fn drop(&mut self) {
        if let Some(path) = &self.remove_on_drop {
            if let Err(e) = fs::remove_dir_all(path) {
                warn!("Failed to remove temporary store {}: {}", path.display(), e);
            }
        }
    }
}

struct LmdbView<'a> {
    store: &'a LmdbStore,
    txn: RoTxn<'a>,
}

impl Snapshot for LmdbView<'_> {
    fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.store.table(ns).get(&self.txn, key)?.map(<[u8]>::to_vec);
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
        let table = self.store.table(ns);
        let bounds = (
            Bound::Included(range.start.as_slice()),
            Bound::Excluded(range.end.as_slice()),
        );
        let convert = |item: heed::Result<(&[u8], &[u8])>| {
            item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(StoreError::from)
        };
        Ok(match order {
            Order::Ascending => Cursor::new(table.range(&self.txn, &bounds)?.map(convert)),
            Order::Descending => Cursor::new(table.rev_range(&self.txn, &bounds)?.map(convert)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn open(dir: &tempfile::TempDir) -> LmdbStore {
        LmdbStore::open(&StoreOptions {
            backend: Backend::Lmdb,
            path: dir.path().join("db"),
            db_name: Some("crawl".into()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn scans_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        store
            .apply(&[
                Put::new(Namespace::Cdx, b"a 1".to_vec(), b"1".to_vec()),
                Put::new(Namespace::Cdx, b"a 2".to_vec(), b"2".to_vec()),
                Put::new(Namespace::Cdx, b"b 1".to_vec(), b"3".to_vec()),
                Put::new(Namespace::Id, b"a 3".to_vec(), b"4".to_vec()),
            ])
            .unwrap();

        let snapshot = store.snapshot().unwrap();
        let keys = |order| {
            let mut cursor = snapshot.scan_prefix(Namespace::Cdx, b"a ", order).unwrap();
            let mut keys = Vec::new();
            while cursor.valid() {
                keys.push(String::from_utf8(cursor.key().to_vec()).unwrap());
                cursor.advance();
            }
            cursor.close().unwrap();
            keys
        };
        assert_eq!(keys(Order::Ascending), ["a 1", "a 2"]);
        assert_eq!(keys(Order::Descending), ["a 2", "a 1"]);
        assert_eq!(store.count(Namespace::Id).unwrap(), 1);
    }

    #[test]
    fn reopens_with_contents() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir);
            store.put(Namespace::File, b"crawl.warc", b"{}").unwrap();
            store.close().unwrap();
        }
        let store = open(&dir);
        assert_eq!(
            store.get(Namespace::File, b"crawl.warc").unwrap(),
            Some(b"{}".to_vec())
        );
        store.delete_all(Namespace::File).unwrap();
        assert_eq!(store.count(Namespace::File).unwrap(), 0);
    }
}
