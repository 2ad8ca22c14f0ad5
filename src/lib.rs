#[cfg(test)]
#[macro_use]
mod testsuite;

pub mod arena;
pub mod batch;
pub mod hashdb;
pub mod iterator;
#[cfg(feature = "lmdb")]
pub mod lmdb;
pub mod memdb;
pub mod options;
pub mod registry;
#[cfg(feature = "rocksdb")]
pub mod rocksdb;
#[cfg(feature = "sled")]
pub mod sled;
pub mod workload;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Suffix appended to an instance name to form the on-disk root of a store.
pub const DB_FILE_SUFFIX: &str = ".db";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("key cannot be empty")]
    KeyEmpty,
    #[error("value cannot be nil")]
    ValueNil,
    #[error("batch has been written or closed")]
    BatchClosed,
    #[error("store is closed")]
    StoreClosed,
    #[error("unknown backend `{0}`")]
    UnknownBackend(String),
    #[error("engine fault: {0}")]
    EngineFault(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::EngineFault(format!("io: {}", e))
    }
}

/// The uniform contract every engine adapter implements.
///
/// Reads never report a missing key as an error: `get` returns `Ok(None)`.
/// Iterators and batches borrow the store, so a store cannot be closed while
/// either is still alive.
pub trait KeyValueStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        self.get(key).map(|v| v.is_some())
    }

    /// Writes `value` under `key`. Durability may be deferred to the engine.
    fn set(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error>;

    /// Like `set`, but returns only once the write is durable.
    fn set_sync(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error>;

    /// Removes `key`. Deleting an absent key succeeds.
    fn delete(&self, key: &[u8]) -> Result<(), Error>;

    fn delete_sync(&self, key: &[u8]) -> Result<(), Error>;

    /// Forward cursor over `[start, end)`; `None` leaves that side unbounded.
    fn iterator<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Box<dyn StoreIterator + 'a>, Error>;

    /// Reverse cursor over `[start, end)`, positioned at the last key.
    fn reverse_iterator<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Box<dyn StoreIterator + 'a>, Error>;

    fn new_batch(&self) -> Box<dyn Batch + '_> {
        self.new_batch_with_size(0)
    }

    /// `size` only preallocates; it never changes batch semantics.
    fn new_batch_with_size(&self, size: usize) -> Box<dyn Batch + '_>;

    /// Releases the engine. Idempotent; every later call fails with `StoreClosed`.
    fn close(&mut self) -> Result<(), Error>;

    /// Dumps every pair to stdout as hex.
    fn print(&self) -> Result<(), Error> {
        let mut it = self.iterator(None, None)?;
        while it.valid() {
            println!("[{}]:\t[{}]", hex(it.key()), hex(it.value()));
            it.next();
        }
        let status = it.error();
        it.close()?;
        status
    }

    /// Engine-reported diagnostic counters. No key is guaranteed to be present.
    fn stats(&self) -> BTreeMap<String, String>;
}

pub trait Batch {
    fn set(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error>;
    fn delete(&mut self, key: &[u8]) -> Result<(), Error>;
    /// Applies every buffered operation atomically, then releases the batch.
    fn write(&mut self) -> Result<(), Error>;
    fn write_sync(&mut self) -> Result<(), Error>;
    /// Discards the batch without applying it.
    fn close(&mut self) -> Result<(), Error>;
    /// Running sum of key and value lengths buffered so far.
    fn byte_size(&self) -> Result<usize, Error>;
}

/// A cursor over a key range.
///
/// `key`, `value` and `next` panic when the cursor is no longer valid. Slices
/// returned by `key` and `value` live until the cursor moves or closes.
pub trait StoreIterator {
    fn domain(&self) -> (Option<&[u8]>, Option<&[u8]>);
    fn valid(&self) -> bool;
    fn next(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    /// Fault hit while iterating, if any. Check it after the last step.
    fn error(&self) -> Result<(), Error>;
    /// Releases engine-side resources. Dropping the cursor does the same.
    fn close(&mut self) -> Result<(), Error>;
}

pub(crate) fn check_key(key: &[u8]) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::KeyEmpty);
    }
    Ok(())
}

pub(crate) fn check_value(value: Option<&[u8]>) -> Result<&[u8], Error> {
    value.ok_or(Error::ValueNil)
}

pub(crate) fn check_bounds(start: Option<&[u8]>, end: Option<&[u8]>) -> Result<(), Error> {
    if start.map_or(false, <[u8]>::is_empty) || end.map_or(false, <[u8]>::is_empty) {
        return Err(Error::KeyEmpty);
    }
    Ok(())
}

pub(crate) fn store_root(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}{}", name, DB_FILE_SUFFIX))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}
