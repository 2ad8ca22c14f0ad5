use crate::batch::BatchStatus;
use crate::iterator::{Direction, Domain};
use crate::options::{CompressionKind, Mode, StoreOptions};
use crate::{
    check_bounds, check_key, check_value, store_root, Batch, Error, KeyValueStore, StoreIterator,
};
use log::{debug, info, warn};
use rocksdb::{
    self, BlockBasedOptions, Cache, DBCompressionType, DBRawIterator, Options, ReadOptions,
    WriteBatch, WriteOptions, DB,
};
use std::collections::BTreeMap;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};

const RATE_LIMITER_REFILL_MICROS: i64 = 100_000;
const RATE_LIMITER_FAIRNESS: i32 = 10;

pub struct Store {
    db: Option<DB>,
    path: PathBuf,
    options: StoreOptions,
    write_opts: WriteOptions,
    sync_opts: WriteOptions,
}

impl Store {
    pub fn open(name: &str, dir: &Path, options: &StoreOptions) -> Result<Self, Error> {
        let path = store_root(dir, name);
        fs::create_dir_all(&path)?;
        let db = DB::open(&engine_options(options), &path)?;

        if options.pin_snapshot {
            warn!("rocksdb: snapshot pinning is not supported, reads stay live");
        }
        if options.compression.has_thresholds() {
            warn!(
                "rocksdb: compression min bytes ({}) and min savings ({}) are ignored",
                options.compression.min_bytes, options.compression.min_savings
            );
        }
        if options.is_unsafe() {
            warn!("rocksdb: {} opened in unsafe mode", path.display());
        }
        info!("rocksdb: opened {}", path.display());

        // A WAL-less write cannot be fsynced; durable writes flush memtables instead.
        let mut write_opts = WriteOptions::default();
        write_opts.disable_wal(options.disable_wal);
        write_opts.set_sync(options.sync_writes && !options.disable_wal && !options.relaxed_sync);
        let mut sync_opts = WriteOptions::default();
        sync_opts.disable_wal(options.disable_wal);
        sync_opts.set_sync(!options.disable_wal && !options.relaxed_sync);

        Ok(Self {
            db: Some(db),
            path,
            options: options.clone(),
            write_opts,
            sync_opts,
        })
    }

    fn db(&self) -> Result<&DB, Error> {
        self.db.as_ref().ok_or(Error::StoreClosed)
    }

    /// Flushes memtables to table files and, when the WAL is on, syncs it.
    pub fn checkpoint(&self) -> Result<(), Error> {
        let db = self.db()?;
        db.flush()?;
        if !self.options.disable_wal {
            db.flush_wal(true)?;
        }
        debug!("rocksdb: checkpointed {}", self.path.display());
        Ok(())
    }

    /// Live versus on-disk bytes, as estimated by the engine.
    pub fn fragmentation_report(&self) -> Result<BTreeMap<String, String>, Error> {
        let db = self.db()?;
        let mut report = BTreeMap::new();
        let live = db.property_int_value("rocksdb.estimate-live-data-size")?;
        let total = db.property_int_value("rocksdb.total-sst-files-size")?;
        let pending = db.property_int_value("rocksdb.estimate-pending-compaction-bytes")?;
        if let Some(live) = live {
            report.insert("live_bytes".to_string(), live.to_string());
        }
        if let Some(total) = total {
            report.insert("file_bytes".to_string(), total.to_string());
        }
        if let Some(pending) = pending {
            report.insert("pending_compaction_bytes".to_string(), pending.to_string());
        }
        if let (Some(live), Some(total)) = (live, total) {
            if total > 0 {
                let dead = total.saturating_sub(live) as f64 / total as f64;
                report.insert("dead_ratio".to_string(), format!("{:.4}", dead));
            }
        }
        Ok(report)
    }

    fn read_opts(&self) -> ReadOptions {
        let mut opts = ReadOptions::default();
        opts.set_verify_checksums(!self.options.disable_read_checksum);
        opts
    }

    fn durable(&self, sync: bool) -> bool {
        sync || self.options.sync_writes
    }

    fn write_opts(&self, sync: bool) -> &WriteOptions {
        if self.durable(sync) {
            &self.sync_opts
        } else {
            &self.write_opts
        }
    }

    /// With the WAL off, the only way to make a write durable is a memtable flush.
    fn settle(&self, db: &DB, sync: bool) -> Result<(), Error> {
        if self.durable(sync) && self.options.disable_wal && !self.options.relaxed_sync {
            db.flush()?;
        }
        Ok(())
    }

    fn put(&self, key: &[u8], value: Option<&[u8]>, sync: bool) -> Result<(), Error> {
        check_key(key)?;
        let value = check_value(value)?;
        let db = self.db()?;
        db.put_opt(key, value, self.write_opts(sync))?;
        self.settle(db, sync)
    }

    fn remove(&self, key: &[u8], sync: bool) -> Result<(), Error> {
        check_key(key)?;
        let db = self.db()?;
        db.delete_opt(key, self.write_opts(sync))?;
        self.settle(db, sync)
    }

    fn write_batch(&self, wb: WriteBatch, sync: bool) -> Result<(), Error> {
        let db = self.db()?;
        db.write_opt(wb, self.write_opts(sync))?;
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
        let mut opts = self.read_opts();
        if let Some(start) = start {
            opts.set_iterate_lower_bound(start.to_vec());
        }
        if let Some(end) = end {
            opts.set_iterate_upper_bound(end.to_vec());
        }
        let mut raw = db.raw_iterator_opt(opts);
        if !domain.is_empty() {
            match direction {
                Direction::Forward => raw.seek_to_first(),
                Direction::Reverse => raw.seek_to_last(),
            }
        }
        Ok(Box::new(RocksdbIterator {
            raw: Some(raw),
            domain,
        }))
    }
}

fn compression_type(kind: CompressionKind) -> DBCompressionType {
    match kind {
        CompressionKind::None => DBCompressionType::None,
        CompressionKind::Snappy => DBCompressionType::Snappy,
        CompressionKind::Lz4 => DBCompressionType::Lz4,
        CompressionKind::Zstd => DBCompressionType::Zstd,
    }
}

fn engine_options(options: &StoreOptions) -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_paranoid_checks(!options.disable_read_checksum);

    let compression = compression_type(options.compression.kind);
    opts.set_compression_type(compression);
    if options.compression.kind != CompressionKind::None {
        opts.set_compression_options(
            -14,
            options.compression.level,
            0,
            options.compression.max_dict_bytes,
        );
    }

    if !options.disable_value_log {
        opts.set_enable_blob_files(true);
        let threshold = if options.force_value_pointers {
            0
        } else {
            options.value_log_threshold
        };
        opts.set_min_blob_size(threshold);
        opts.set_blob_compression_type(compression);
        opts.set_enable_blob_gc(true);
    }

    let mut table = BlockBasedOptions::default();
    match options.mode {
        Mode::Cached => table.set_block_cache(&Cache::new_lru_cache(options.cache_bytes)),
        Mode::Raw => table.set_no_block_cache(),
    }
    opts.set_block_based_table_factory(&table);

    if options.disable_background {
        opts.set_disable_auto_compactions(true);
    }
    if options.disable_index_vacuum {
        opts.set_periodic_compaction_seconds(0);
    } else if let Some(interval) = options.compaction.interval {
        opts.set_periodic_compaction_seconds(interval.as_secs());
    }
    if let Some(rate) = options.compaction.rate_bytes_per_sec {
        opts.set_ratelimiter(rate, RATE_LIMITER_REFILL_MICROS, RATE_LIMITER_FAIRNESS);
    }
    if let Some(burst) = options.compaction.burst_bytes {
        opts.set_max_compaction_bytes(burst);
    }
    opts
}

impl KeyValueStore for Store {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        check_key(key)?;
        let db = self.db()?;
        let opts = self.read_opts();
        if self.options.reuse_reads {
            return db
                .get_pinned_opt(key, &opts)
                .map(|v| v.map(|vi| vi.to_vec()))
                .map_err(Into::into);
        }
        db.get_opt(key, &opts).map_err(Into::into)
    }

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        check_key(key)?;
        self.db()?
            .get_pinned_opt(key, &self.read_opts())
            .map(|v| v.is_some())
            .map_err(Into::into)
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
        Box::new(RocksdbBatch {
            store: self,
            wb: WriteBatch::default(),
            status: BatchStatus::for_store(self.db.is_some()),
        })
    }

    fn close(&mut self) -> Result<(), Error> {
        if let Some(db) = self.db.take() {
            if self.options.disable_wal {
                db.flush()?;
            }
            info!("rocksdb: closed {}", self.path.display());
        }
        Ok(())
    }

    fn stats(&self) -> BTreeMap<String, String> {
        let mut stats = BTreeMap::new();
        let db = match &self.db {
            Some(db) => db,
            None => return stats,
        };
        let properties = [
            ("key_count", "rocksdb.estimate-num-keys"),
            ("data_size", "rocksdb.total-sst-files-size"),
            ("memtable_size", "rocksdb.cur-size-all-mem-tables"),
            ("segments", "rocksdb.num-files-at-level0"),
            ("value_log_size", "rocksdb.total-blob-file-size"),
        ];
        for (name, property) in properties {
            if let Ok(Some(value)) = db.property_int_value(property) {
                stats.insert(name.to_string(), value.to_string());
            }
        }
        stats.insert("unsafe".to_string(), self.options.is_unsafe().to_string());
        stats
    }
}

pub struct RocksdbBatch<'a> {
    store: &'a Store,
    wb: WriteBatch,
    status: BatchStatus,
}

impl<'a> RocksdbBatch<'a> {
    fn commit(&mut self, sync: bool) -> Result<(), Error> {
        self.status.begin_commit()?;
        self.store.write_batch(mem::take(&mut self.wb), sync)
    }
}

impl<'a> Batch for RocksdbBatch<'a> {
    fn set(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        let value = self.status.record_set(key, value)?;
        self.wb.put(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.status.record_delete(key)?;
        self.wb.delete(key);
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
        self.wb = WriteBatch::default();
        Ok(())
    }

    fn byte_size(&self) -> Result<usize, Error> {
        self.status.byte_size()
    }
}

/// Bounds are pushed down into the native iterator, which pins the current
/// entry itself, so no arena copy is needed.
pub struct RocksdbIterator<'a> {
    raw: Option<DBRawIterator<'a>>,
    domain: Domain,
}

impl<'a> RocksdbIterator<'a> {
    fn current(&self) -> &DBRawIterator<'a> {
        match &self.raw {
            Some(raw) if raw.valid() => raw,
            _ => panic!("iterator is invalid"),
        }
    }
}

impl<'a> StoreIterator for RocksdbIterator<'a> {
    fn domain(&self) -> (Option<&[u8]>, Option<&[u8]>) {
        (self.domain.start(), self.domain.end())
    }

    fn valid(&self) -> bool {
        self.raw.as_ref().map_or(false, |raw| raw.valid())
    }

    fn next(&mut self) {
        self.current();
        if let Some(raw) = self.raw.as_mut() {
            match self.domain.direction() {
                Direction::Forward => raw.next(),
                Direction::Reverse => raw.prev(),
            }
        }
    }

    fn key(&self) -> &[u8] {
        self.current().key().unwrap_or_default()
    }

    fn value(&self) -> &[u8] {
        self.current().value().unwrap_or_default()
    }

    fn error(&self) -> Result<(), Error> {
        match &self.raw {
            Some(raw) => raw.status().map_err(Into::into),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.raw = None;
        Ok(())
    }
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Error {
        Error::EngineFault(format!("rocksdb: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, Box<dyn KeyValueStore>) {
        let tmp_dir = tempfile::Builder::new().prefix("rocksdb").tempdir().unwrap();
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
        batch.write().unwrap();

        assert_eq!(Some(vec![0, 0, 0]), store.get(&[0, 0]).unwrap());
        assert_eq!(Some(vec![1, 1, 1]), store.get(&[1, 1]).unwrap());
        assert_eq!(None, store.get(&[2, 2]).unwrap());
    }

    #[test]
    fn root_uses_db_suffix() {
        let tmp_dir = tempfile::Builder::new().prefix("suffix").tempdir().unwrap();
        let _store = Store::open("bench", tmp_dir.path(), &StoreOptions::default()).unwrap();
        assert!(tmp_dir.path().join("bench.db").is_dir());
    }

    #[test]
    fn walless_sync_writes_survive_reopen() {
        let tmp_dir = tempfile::Builder::new().prefix("nowal").tempdir().unwrap();
        let options = StoreOptions {
            disable_wal: true,
            ..StoreOptions::default()
        };
        let mut store = Store::open("test", tmp_dir.path(), &options).unwrap();
        store.set_sync(b"k", Some(&b"v"[..])).unwrap();
        store.set(b"j", Some(&b"w"[..])).unwrap();
        assert_eq!("true", store.stats()["unsafe"]);
        store.close().unwrap();

        let store = Store::open("test", tmp_dir.path(), &options).unwrap();
        assert_eq!(Some(b"v".to_vec()), store.get(b"k").unwrap());
        assert_eq!(Some(b"w".to_vec()), store.get(b"j").unwrap());
    }

    #[test]
    fn value_log_round_trip() {
        let tmp_dir = tempfile::Builder::new().prefix("blob").tempdir().unwrap();
        let options = StoreOptions {
            force_value_pointers: true,
            reuse_reads: true,
            ..StoreOptions::default()
        };
        let store = Store::open("test", tmp_dir.path(), &options).unwrap();
        let value = vec![42u8; 4096];
        store.set_sync(b"big", Some(value.as_slice())).unwrap();
        store.db().unwrap().flush().unwrap();
        assert_eq!(Some(value), store.get(b"big").unwrap());
        assert_eq!("false", store.stats()["unsafe"]);
    }

    #[test]
    fn checkpoint_writes_table_files() {
        let tmp_dir = tempfile::Builder::new().prefix("checkpoint").tempdir().unwrap();
        let mut store = Store::open("test", tmp_dir.path(), &StoreOptions::default()).unwrap();
        store.set(b"k", Some(&b"v"[..])).unwrap();
        store.checkpoint().unwrap();
        assert_ne!("0", store.stats()["data_size"]);

        let report = store.fragmentation_report().unwrap();
        assert_ne!("0", report["file_bytes"]);
        assert!(report.contains_key("live_bytes"));

        store.close().unwrap();
        assert_eq!(Err(Error::StoreClosed), store.checkpoint());
        assert_eq!(Some(Error::StoreClosed), store.fragmentation_report().err());
    }

    #[test]
    fn compression_thresholds_are_accepted() {
        let tmp_dir = tempfile::Builder::new().prefix("thresholds").tempdir().unwrap();
        let mut options = StoreOptions::default();
        options.compression.min_bytes = 1024;
        options.compression.min_savings = 128;
        let store = Store::open("test", tmp_dir.path(), &options).unwrap();
        store.set(b"k", Some(&b"v"[..])).unwrap();
        assert_eq!(Some(b"v".to_vec()), store.get(b"k").unwrap());
    }

    #[test]
    fn raw_mode_without_value_log() {
        let tmp_dir = tempfile::Builder::new().prefix("raw").tempdir().unwrap();
        let options = StoreOptions {
            mode: Mode::Raw,
            disable_value_log: true,
            disable_background: true,
            compression: crate::options::Compression {
                kind: CompressionKind::None,
                ..Default::default()
            },
            ..StoreOptions::default()
        };
        let store = Store::open("test", tmp_dir.path(), &options).unwrap();
        store.set(b"k", Some(&b"v"[..])).unwrap();
        assert!(store.has(b"k").unwrap());
    }
}
