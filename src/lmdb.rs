//! Memory-mapped B+tree engine.
//!
//! Cursors live inside one long-lived read transaction, so they observe the
//! store as of their creation. Each native cursor reads ahead a run of
//! entries; the next cursor is only opened once that run is used up. A pinned
//! snapshot serves reads and new cursors until it is unpinned.

use crate::batch::{Operation, PendingOps};
use crate::iterator::{BufferedIterator, Cursor, Direction, Domain};
use crate::options::StoreOptions;
use crate::{
    check_bounds, check_key, check_value, store_root, Batch, Error, KeyValueStore, StoreIterator,
};
use lmdb_zero::{
    self, Database, DatabaseOptions, EnvBuilder, Environment, Ignore, LmdbResultExt,
    ReadTransaction, WriteAccessor, WriteTransaction,
};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// max 1TB
const MAP_SIZE: usize = 1_099_511_627_776;
const DB_NAME: &str = "lmdb";
const READ_AHEAD: usize = 64;

pub struct Store {
    snapshot: Option<ReadTransaction<'static>>,
    db: Option<Arc<Database<'static>>>,
    env: Option<Arc<Environment>>,
    path: PathBuf,
    sync_writes: bool,
    relaxed_sync: bool,
    unsafe_mode: bool,
}

impl Store {
    pub fn open(name: &str, dir: &Path, options: &StoreOptions) -> Result<Self, Error> {
        let path = store_root(dir, name);
        fs::create_dir_all(&path)?;
        let path_str = path
            .to_str()
            .ok_or_else(|| Error::EngineFault(format!("lmdb: bad path {}", path.display())))?;

        let mut env_builder = EnvBuilder::new()?;
        env_builder.set_maxdbs(1)?;
        env_builder.set_mapsize(MAP_SIZE)?;
        // Commits never fsync on their own; durable writes sync the env explicitly.
        let env = unsafe {
            Arc::new(env_builder.open(
                path_str,
                lmdb_zero::open::NOSYNC | lmdb_zero::open::NOTLS,
                0o600,
            )?)
        };
        let db = Arc::new(Database::open(
            Arc::clone(&env),
            Some(DB_NAME),
            &DatabaseOptions::new(lmdb_zero::db::CREATE),
        )?);

        if options.disable_wal || options.disable_background {
            warn!("lmdb: WAL and background toggles have no effect");
        }
        let unsafe_mode = options.is_unsafe();
        if unsafe_mode {
            warn!("lmdb: {} opened in unsafe mode", path.display());
        }
        info!("lmdb: opened {}", path.display());

        let mut store = Self {
            snapshot: None,
            db: Some(db),
            env: Some(env),
            path,
            sync_writes: options.sync_writes,
            relaxed_sync: options.relaxed_sync,
            unsafe_mode,
        };
        if options.pin_snapshot {
            store.pin_snapshot()?;
        }
        Ok(store)
    }

    /// Freezes reads at the current state. Replaces any earlier snapshot.
    pub fn pin_snapshot(&mut self) -> Result<(), Error> {
        self.snapshot = None;
        let txn = ReadTransaction::new(Arc::clone(self.env()?))?;
        self.snapshot = Some(txn);
        debug!("lmdb: pinned snapshot of {}", self.path.display());
        Ok(())
    }

    pub fn unpin_snapshot(&mut self) {
        if self.snapshot.take().is_some() {
            debug!("lmdb: released snapshot of {}", self.path.display());
        }
    }

    /// Forces everything committed so far to disk, regardless of NOSYNC.
    pub fn checkpoint(&self) -> Result<(), Error> {
        self.env()?.sync(true)?;
        debug!("lmdb: checkpointed {}", self.path.display());
        Ok(())
    }

    /// Pages held by the tree against pages the map file has handed out.
    /// The gap is free-list and bookkeeping space.
    pub fn fragmentation_report(&self) -> Result<BTreeMap<String, String>, Error> {
        let env = self.env()?;
        let db = self.db()?;
        let txn = ReadTransaction::new(Arc::clone(env))?;
        let stat = txn.db_stat(db)?;
        let info = env.info()?;
        let used = stat.branch_pages + stat.leaf_pages + stat.overflow_pages;
        let allocated = info.last_pgno + 1;

        let mut report = BTreeMap::new();
        report.insert("page_size".to_string(), stat.psize.to_string());
        report.insert("used_pages".to_string(), used.to_string());
        report.insert("allocated_pages".to_string(), allocated.to_string());
        report.insert("overflow_pages".to_string(), stat.overflow_pages.to_string());
        let free = allocated.saturating_sub(used);
        report.insert("free_pages".to_string(), free.to_string());
        report.insert(
            "dead_ratio".to_string(),
            format!("{:.4}", free as f64 / allocated as f64),
        );
        Ok(report)
    }

    fn env(&self) -> Result<&Arc<Environment>, Error> {
        self.env.as_ref().ok_or(Error::StoreClosed)
    }

    fn db(&self) -> Result<&Arc<Database<'static>>, Error> {
        self.db.as_ref().ok_or(Error::StoreClosed)
    }

    fn read_txn(&self) -> Result<Txn<'_>, Error> {
        match &self.snapshot {
            Some(snapshot) => Ok(Txn::Pinned(snapshot)),
            None => Ok(Txn::Owned(ReadTransaction::new(Arc::clone(self.env()?))?)),
        }
    }

    fn write_txn<F>(&self, sync: bool, apply: F) -> Result<(), Error>
    where
        F: FnOnce(&mut WriteAccessor, &Database<'static>) -> Result<(), Error>,
    {
        let env = self.env()?;
        let db = self.db()?;
        let txn = WriteTransaction::new(Arc::clone(env))?;
        {
            let mut access = txn.access();
            apply(&mut access, db)?;
        }
        txn.commit()?;
        if (sync || self.sync_writes) && !self.relaxed_sync {
            env.sync(true)?;
        }
        Ok(())
    }

    fn put(&self, key: &[u8], value: Option<&[u8]>, sync: bool) -> Result<(), Error> {
        check_key(key)?;
        let value = check_value(value)?;
        self.write_txn(sync, |access, db| {
            access.put(db, key, value, lmdb_zero::put::Flags::empty())?;
            Ok(())
        })
    }

    fn remove(&self, key: &[u8], sync: bool) -> Result<(), Error> {
        check_key(key)?;
        self.write_txn(sync, |access, db| {
            access.del_key(db, key).to_opt()?;
            Ok(())
        })
    }

    fn open_iterator<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        direction: Direction,
    ) -> Result<Box<dyn StoreIterator + 'a>, Error> {
        check_bounds(start, end)?;
        let db = Arc::clone(self.db()?);
        let txn = self.read_txn()?;
        let domain = Domain::new(start, end, direction);
        let cursor = LmdbCursor {
            txn: Some(txn),
            db,
            run: Run::default(),
            opens: 0,
        };
        Ok(Box::new(BufferedIterator::new(cursor, domain)))
    }
}

enum Txn<'a> {
    Owned(ReadTransaction<'static>),
    Pinned(&'a ReadTransaction<'static>),
}

impl<'a> Txn<'a> {
    fn get(&self) -> &ReadTransaction<'static> {
        match self {
            Txn::Owned(txn) => txn,
            Txn::Pinned(txn) => txn,
        }
    }
}

impl KeyValueStore for Store {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        check_key(key)?;
        let db = self.db()?;
        let txn = self.read_txn()?;
        let access = txn.get().access();
        let value = access
            .get::<[u8], [u8]>(db, key)
            .to_opt()?
            .map(<[u8]>::to_vec);
        Ok(value)
    }

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        check_key(key)?;
        let db = self.db()?;
        let txn = self.read_txn()?;
        let access = txn.get().access();
        let result: lmdb_zero::error::Result<&Ignore> = access.get(db, key);
        let found = result.to_opt()?.is_some();
        Ok(found)
    }

    fn set(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        self.put(key, value, false)
    }

    fn set_sync(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        self.put(key, value, true)
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.remove(key, false)
    }

    fn delete_sync(&self, key: &[u8]) -> Result<(), Error> {
        self.remove(key, true)
    }

    fn iterator<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Box<dyn StoreIterator + 'a>, Error> {
        self.open_iterator(start, end, Direction::Forward)
    }

    fn reverse_iterator<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Box<dyn StoreIterator + 'a>, Error> {
        self.open_iterator(start, end, Direction::Reverse)
    }

    fn new_batch_with_size(&self, size: usize) -> Box<dyn Batch + '_> {
        Box::new(LmdbBatch {
            store: self,
            ops: PendingOps::for_store(self.db.is_some(), size),
        })
    }

    fn close(&mut self) -> Result<(), Error> {
        self.snapshot = None;
        self.db = None;
        if let Some(env) = self.env.take() {
            env.sync(true)?;
            info!("lmdb: closed {}", self.path.display());
        }
        Ok(())
    }

    fn stats(&self) -> BTreeMap<String, String> {
        let mut stats = BTreeMap::new();
        if let (Some(env), Some(db)) = (&self.env, &self.db) {
            if let Ok(txn) = ReadTransaction::new(Arc::clone(env)) {
                if let Ok(stat) = txn.db_stat(db) {
                    let pages = stat.branch_pages + stat.leaf_pages + stat.overflow_pages;
                    stats.insert("key_count".to_string(), stat.entries.to_string());
                    stats.insert(
                        "data_size".to_string(),
                        (stat.psize as usize * pages).to_string(),
                    );
                    stats.insert("depth".to_string(), stat.depth.to_string());
                }
            }
            stats.insert("capacity".to_string(), MAP_SIZE.to_string());
            stats.insert(
                "snapshot_pinned".to_string(),
                self.snapshot.is_some().to_string(),
            );
            stats.insert("unsafe".to_string(), self.unsafe_mode.to_string());
        }
        stats
    }
}

struct LmdbCursor<'a> {
    txn: Option<Txn<'a>>,
    db: Arc<Database<'static>>,
    run: Run,
    opens: usize,
}

/// Entries copied out of one native cursor, laid out back to back.
#[derive(Default)]
struct Run {
    data: Vec<u8>,
    // (start, key end, value end) into `data`
    spans: Vec<(usize, usize, usize)>,
    pos: usize,
    done: bool,
}

impl Run {
    fn clear(&mut self) {
        self.data.clear();
        self.spans.clear();
        self.pos = 0;
        self.done = false;
    }

    fn push(&mut self, key: &[u8], value: &[u8]) {
        let start = self.data.len();
        self.data.extend_from_slice(key);
        self.data.extend_from_slice(value);
        self.spans.push((start, start + key.len(), self.data.len()));
    }

    fn entry(&self, i: usize) -> (&[u8], &[u8]) {
        let (start, mid, end) = self.spans[i];
        (&self.data[start..mid], &self.data[mid..end])
    }

    /// True when `from` is the entry served last, so the run can go on.
    fn follows(&self, from: Option<&[u8]>) -> bool {
        match from {
            Some(from) if self.pos > 0 => self.entry(self.pos - 1).0 == from,
            _ => false,
        }
    }

    fn fill(
        &mut self,
        txn: &ReadTransaction<'static>,
        db: &Arc<Database<'static>>,
        domain: &Domain,
        from: Option<&[u8]>,
    ) -> Result<(), Error> {
        self.clear();
        let access = txn.access();
        let mut cursor = txn.cursor(Arc::clone(db))?;
        let mut entry = match domain.direction() {
            Direction::Forward => match from.or(domain.start()) {
                None => cursor.first::<[u8], [u8]>(&access).to_opt()?,
                Some(target) => match cursor.seek_range_k::<[u8], [u8]>(&access, target).to_opt()? {
                    Some((k, _)) if from.is_some() && k == target => {
                        cursor.next::<[u8], [u8]>(&access).to_opt()?
                    }
                    found => found,
                },
            },
            Direction::Reverse => match from.or(domain.end()) {
                None => cursor.last::<[u8], [u8]>(&access).to_opt()?,
                Some(target) => match cursor.seek_range_k::<[u8], [u8]>(&access, target).to_opt()? {
                    Some(_) => cursor.prev::<[u8], [u8]>(&access).to_opt()?,
                    None => cursor.last::<[u8], [u8]>(&access).to_opt()?,
                },
            },
        };
        while let Some((k, v)) = entry {
            if !domain.contains(k) {
                break;
            }
            self.push(k, v);
            if self.spans.len() == READ_AHEAD {
                return Ok(());
            }
            entry = match domain.direction() {
                Direction::Forward => cursor.next::<[u8], [u8]>(&access).to_opt()?,
                Direction::Reverse => cursor.prev::<[u8], [u8]>(&access).to_opt()?,
            };
        }
        self.done = true;
        Ok(())
    }
}

impl<'a> Cursor for LmdbCursor<'a> {
    fn seek(
        &mut self,
        domain: &Domain,
        from: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<bool, Error> {
        let txn = match &self.txn {
            Some(txn) => txn.get(),
            None => return Ok(false),
        };
        let exhausted = self.run.pos == self.run.spans.len();
        if !self.run.follows(from) || (exhausted && !self.run.done) {
            self.run.fill(txn, &self.db, domain, from)?;
            self.opens += 1;
        }
        if self.run.pos == self.run.spans.len() {
            return Ok(false);
        }
        let (k, v) = self.run.entry(self.run.pos);
        visit(k, v);
        self.run.pos += 1;
        Ok(true)
    }

    fn release(&mut self) {
        self.txn = None;
        self.run = Run::default();
    }
}

pub struct LmdbBatch<'a> {
    store: &'a Store,
    ops: PendingOps,
}

impl<'a> LmdbBatch<'a> {
    fn commit(&mut self, sync: bool) -> Result<(), Error> {
        let ops = self.ops.take()?;
        self.store.write_txn(sync, |access, db| {
            for op in ops {
                match op {
                    Operation::Set(key, value) => {
                        access.put(db, &key[..], &value[..], lmdb_zero::put::Flags::empty())?;
                    }
                    Operation::Delete(key) => {
                        access.del_key(db, &key[..]).to_opt()?;
                    }
                }
            }
            Ok(())
        })
    }
}

impl<'a> Batch for LmdbBatch<'a> {
    fn set(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        self.ops.set(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.ops.delete(key)
    }

    fn write(&mut self) -> Result<(), Error> {
        self.commit(false)
    }

    fn write_sync(&mut self) -> Result<(), Error> {
        self.commit(true)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.ops.close()
    }

    fn byte_size(&self) -> Result<usize, Error> {
        self.ops.byte_size()
    }
}

impl From<lmdb_zero::error::Error> for Error {
    fn from(e: lmdb_zero::error::Error) -> Error {
        Error::EngineFault(format!("lmdb: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::Standard;
    use rand::{thread_rng, Rng};

    fn open() -> (tempfile::TempDir, Box<dyn KeyValueStore>) {
        let tmp_dir = tempfile::Builder::new().prefix("lmdb").tempdir().unwrap();
        let store = Store::open("test", tmp_dir.path(), &StoreOptions::default()).unwrap();
        (tmp_dir, Box::new(store))
    }

    store_contract_tests!(open);

    #[test]
    fn put_and_get() {
        let tmp_dir = tempfile::Builder::new()
            .prefix("put_and_get")
            .tempdir()
            .unwrap();
        let store = Store::open("test", tmp_dir.path(), &StoreOptions::default()).unwrap();
        let mut batch = store.new_batch();
        batch.set(&[0, 0], Some(&[0, 0, 0][..])).unwrap();
        batch.set(&[1, 1], Some(&[1, 1, 1][..])).unwrap();
        let mut rng = thread_rng();
        // max key size 511 bytes
        let key: Vec<u8> = (&mut rng).sample_iter(&Standard).take(511).collect();
        let value: Vec<u8> = rng.sample_iter(&Standard).take(1024 * 1024).collect();
        batch.set(&key, Some(value.as_slice())).unwrap();
        batch.write().unwrap();

        assert_eq!(Some(vec![0, 0, 0]), store.get(&[0, 0]).unwrap());
        assert_eq!(Some(vec![1, 1, 1]), store.get(&[1, 1]).unwrap());
        assert_eq!(Some(value), store.get(&key).unwrap());
        assert_eq!(None, store.get(&[2, 2]).unwrap());
    }

    #[test]
    fn pinned_snapshot_hides_later_writes() {
        let tmp_dir = tempfile::Builder::new().prefix("pinned").tempdir().unwrap();
        let mut store = Store::open("test", tmp_dir.path(), &StoreOptions::default()).unwrap();
        store.set(b"a", Some(&b"1"[..])).unwrap();
        store.pin_snapshot().unwrap();
        store.set(b"b", Some(&b"2"[..])).unwrap();

        assert!(store.has(b"a").unwrap());
        assert_eq!(None, store.get(b"b").unwrap());
        {
            let it = store.iterator(None, None).unwrap();
            assert!(it.valid());
            assert_eq!(b"a", it.key());
        }
        assert_eq!("true", store.stats()["snapshot_pinned"]);

        store.unpin_snapshot();
        assert_eq!(Some(b"2".to_vec()), store.get(b"b").unwrap());
        assert_eq!("false", store.stats()["snapshot_pinned"]);
    }

    #[test]
    fn pin_on_open() {
        let tmp_dir = tempfile::Builder::new().prefix("pin_open").tempdir().unwrap();
        let options = StoreOptions {
            pin_snapshot: true,
            ..StoreOptions::default()
        };
        let mut store = Store::open("test", tmp_dir.path(), &options).unwrap();
        store.set(b"k", Some(&b"v"[..])).unwrap();
        assert_eq!(None, store.get(b"k").unwrap());
        store.pin_snapshot().unwrap();
        assert_eq!(Some(b"v".to_vec()), store.get(b"k").unwrap());
        store.close().unwrap();
    }

    #[test]
    fn checkpoint_and_fragmentation() {
        let tmp_dir = tempfile::Builder::new().prefix("checkpoint").tempdir().unwrap();
        let mut store = Store::open("test", tmp_dir.path(), &StoreOptions::default()).unwrap();
        for i in 0..100u32 {
            store.set(&i.to_be_bytes(), Some(&[1u8; 100][..])).unwrap();
        }
        store.checkpoint().unwrap();

        let report = store.fragmentation_report().unwrap();
        let used: usize = report["used_pages"].parse().unwrap();
        let allocated: usize = report["allocated_pages"].parse().unwrap();
        assert!(used > 0);
        assert!(allocated >= used);
        assert!(report.contains_key("dead_ratio"));

        store.close().unwrap();
        assert_eq!(Err(Error::StoreClosed), store.checkpoint());
        assert_eq!(Some(Error::StoreClosed), store.fragmentation_report().err());
    }

    fn walk(cursor: &mut LmdbCursor, domain: &Domain) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = Vec::new();
        loop {
            let from = keys.last().cloned();
            let mut step = None;
            let found = cursor
                .seek(domain, from.as_deref(), &mut |k: &[u8], _: &[u8]| step = Some(k.to_vec()))
                .unwrap();
            match step {
                Some(k) if found => keys.push(k),
                _ => return keys,
            }
        }
    }

    #[test]
    fn cursor_reads_ahead_in_runs() {
        let tmp_dir = tempfile::Builder::new().prefix("read_ahead").tempdir().unwrap();
        let store = Store::open("test", tmp_dir.path(), &StoreOptions::default()).unwrap();
        let mut batch = store.new_batch();
        for i in 0..200u16 {
            batch.set(&i.to_be_bytes(), Some(&b"v"[..])).unwrap();
        }
        batch.write().unwrap();

        let mut cursor = LmdbCursor {
            txn: Some(store.read_txn().unwrap()),
            db: Arc::clone(store.db().unwrap()),
            run: Run::default(),
            opens: 0,
        };
        let forward = Domain::new(None, None, Direction::Forward);
        let keys = walk(&mut cursor, &forward);
        let expected: Vec<Vec<u8>> = (0..200u16).map(|i| i.to_be_bytes().to_vec()).collect();
        assert_eq!(expected, keys);
        assert_eq!((200 + READ_AHEAD - 1) / READ_AHEAD, cursor.opens);

        cursor.opens = 0;
        let start = 10u16.to_be_bytes();
        let end = 150u16.to_be_bytes();
        let reverse = Domain::new(Some(&start[..]), Some(&end[..]), Direction::Reverse);
        let keys = walk(&mut cursor, &reverse);
        let expected: Vec<Vec<u8>> = (10..150u16)
            .rev()
            .map(|i| i.to_be_bytes().to_vec())
            .collect();
        assert_eq!(expected, keys);
        assert_eq!((140 + READ_AHEAD - 1) / READ_AHEAD, cursor.opens);
    }

    #[test]
    fn reopen_keeps_writes() {
        let tmp_dir = tempfile::Builder::new().prefix("reopen").tempdir().unwrap();
        let mut store = Store::open("test", tmp_dir.path(), &StoreOptions::default()).unwrap();
        store.set(b"a", Some(&b"1"[..])).unwrap();
        store.set_sync(b"b", Some(&b"2"[..])).unwrap();
        store.close().unwrap();

        let store = Store::open("test", tmp_dir.path(), &StoreOptions::default()).unwrap();
        assert_eq!(Some(b"1".to_vec()), store.get(b"a").unwrap());
        assert_eq!("2", store.stats()["key_count"]);
    }
}
