use crate::batch::BatchStatus;
use crate::iterator::{Direction, Domain};
use crate::options::{Mode, StoreOptions};
use crate::{
    check_bounds, check_key, check_value, store_root, Batch, Error, KeyValueStore, StoreIterator,
};
use log::{info, warn};
use sled::{Db, IVec};
use std::collections::BTreeMap;
use std::mem;
use std::ops::Bound;
use std::path::{Path, PathBuf};

const FLUSH_EVERY_MS: u64 = 500;

pub struct Store {
    db: Option<Db>,
    path: PathBuf,
    sync_writes: bool,
    unsafe_mode: bool,
}

impl Store {
    pub fn open(name: &str, dir: &Path, options: &StoreOptions) -> Result<Self, Error> {
        let path = store_root(dir, name);
        let mode = match options.mode {
            Mode::Cached => sled::Mode::HighThroughput,
            Mode::Raw => sled::Mode::LowSpace,
        };
        let flush_every = if options.disable_background {
            None
        } else {
            Some(FLUSH_EVERY_MS)
        };
        let db = sled::Config::new()
            .path(&path)
            .cache_capacity(options.cache_bytes as u64)
            .mode(mode)
            .flush_every_ms(flush_every)
            .open()?;

        if options.pin_snapshot || options.disable_wal {
            warn!("sled: snapshot pinning and WAL toggles are not supported");
        }
        let unsafe_mode = options.is_unsafe();
        if unsafe_mode {
            warn!("sled: {} opened in unsafe mode", path.display());
        }
        info!("sled: opened {}", path.display());
        Ok(Self {
            db: Some(db),
            path,
            sync_writes: options.sync_writes,
            unsafe_mode,
        })
    }

    fn db(&self) -> Result<&Db, Error> {
        self.db.as_ref().ok_or(Error::StoreClosed)
    }

    fn settle(&self, db: &Db, sync: bool) -> Result<(), Error> {
        if sync || self.sync_writes {
            db.flush()?;
        }
        Ok(())
    }

    fn put(&self, key: &[u8], value: Option<&[u8]>, sync: bool) -> Result<(), Error> {
        check_key(key)?;
        let value = check_value(value)?;
        let db = self.db()?;
        db.insert(key, value)?;
        self.settle(db, sync)
    }

    fn remove(&self, key: &[u8], sync: bool) -> Result<(), Error> {
        check_key(key)?;
        let db = self.db()?;
        db.remove(key)?;
        self.settle(db, sync)
    }

    fn open_iterator<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        direction: Direction,
    ) -> Result<Box<dyn StoreIterator + 'a>, Error> {
        check_bounds(start, end)?;
        let db = self.db()?;
        let domain = Domain::new(start, end, direction);
        let range = if domain.is_empty() {
            None
        } else {
            let lower = start.map_or(Bound::Unbounded, |k| Bound::Included(IVec::from(k)));
            let upper = end.map_or(Bound::Unbounded, |k| Bound::Excluded(IVec::from(k)));
            Some(db.range::<IVec, _>((lower, upper)))
        };
        let mut it = SledIterator {
            range,
            current: None,
            domain,
            error: None,
        };
        it.advance();
        Ok(Box::new(it))
    }
}

impl KeyValueStore for Store {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        check_key(key)?;
        self.db()?
            .get(key)
            .map(|v| v.map(|vi| vi.to_vec()))
            .map_err(Into::into)
    }

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        check_key(key)?;
        self.db()?.contains_key(key).map_err(Into::into)
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

    fn new_batch_with_size(&self, _size: usize) -> Box<dyn Batch + '_> {
        Box::new(SledBatch {
            store: self,
            batch: sled::Batch::default(),
            status: BatchStatus::for_store(self.db.is_some()),
        })
    }

    fn close(&mut self) -> Result<(), Error> {
        if let Some(db) = self.db.take() {
            db.flush()?;
            info!("sled: closed {}", self.path.display());
        }
        Ok(())
    }

    fn stats(&self) -> BTreeMap<String, String> {
        let mut stats = BTreeMap::new();
        if let Some(db) = &self.db {
            stats.insert("key_count".to_string(), db.len().to_string());
            if let Ok(size) = db.size_on_disk() {
                stats.insert("data_size".to_string(), size.to_string());
            }
            stats.insert("unsafe".to_string(), self.unsafe_mode.to_string());
        }
        stats
    }
}

pub struct SledBatch<'a> {
    store: &'a Store,
    batch: sled::Batch,
    status: BatchStatus,
}

impl<'a> SledBatch<'a> {
    fn commit(&mut self, sync: bool) -> Result<(), Error> {
        self.status.begin_commit()?;
        let db = self.store.db()?;
        db.apply_batch(mem::take(&mut self.batch))?;
        self.store.settle(db, sync)
    }
}

impl<'a> Batch for SledBatch<'a> {
    fn set(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        let value = self.status.record_set(key, value)?;
        self.batch.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.status.record_delete(key)?;
        self.batch.remove(key);
        Ok(())
    }

    fn write(&mut self) -> Result<(), Error> {
        self.commit(false)
    }

    fn write_sync(&mut self) -> Result<(), Error> {
        self.commit(true)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.status.close()?;
        self.batch = sled::Batch::default();
        Ok(())
    }

    fn byte_size(&self) -> Result<usize, Error> {
        self.status.byte_size()
    }
}

/// Walks a native range, holding the current pair as reference-counted
/// buffers.
pub struct SledIterator {
    range: Option<sled::Iter>,
    current: Option<(IVec, IVec)>,
    domain: Domain,
    error: Option<Error>,
}

impl SledIterator {
    fn advance(&mut self) {
        let range = match self.range.as_mut() {
            Some(range) => range,
            None => return,
        };
        let step = match self.domain.direction() {
            Direction::Forward => range.next(),
            Direction::Reverse => range.next_back(),
        };
        match step {
            Some(Ok(pair)) => self.current = Some(pair),
            Some(Err(e)) => {
                self.current = None;
                self.error = Some(e.into());
            }
            None => self.current = None,
        }
    }

    fn current(&self) -> &(IVec, IVec) {
        match &self.current {
            Some(pair) => pair,
            None => panic!("iterator is invalid"),
        }
    }
}

impl StoreIterator for SledIterator {
    fn domain(&self) -> (Option<&[u8]>, Option<&[u8]>) {
        (self.domain.start(), self.domain.end())
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn next(&mut self) {
        self.current();
        self.advance();
    }

    fn key(&self) -> &[u8] {
        &self.current().0
    }

    fn value(&self) -> &[u8] {
        &self.current().1
    }

    fn error(&self) -> Result<(), Error> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.range = None;
        self.current = None;
        Ok(())
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Error {
        Error::EngineFault(format!("sled: {}", e))
    }
}
