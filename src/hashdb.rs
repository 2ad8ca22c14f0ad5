//! Hash-indexed engine with an ordering overlay.
//!
//! Point lookups go through a `HashMap`; a `BTreeSet` of keys supplies the
//! ordering cursors need. Every mutation is appended to a single record log
//! which is replayed on open:
//!
//! ```text
//! | header crc (4) | kind (1) | key len (4) | value len (4) | body crc (4) | key | value |
//! ```
//!
//! The header checksum covers the next 13 bytes and the body checksum covers
//! key and value. Integers are little endian. Only a record whose header
//! checks out and whose body runs past the end of the file counts as a torn
//! tail; anything else that fails to verify is an `EngineFault`.
//!
//! Overwrites and deletes leave dead records behind. Once they make up
//! enough of the log it is rewritten with only the live entries.

use crate::batch::{Operation, PendingOps};
use crate::iterator::{BufferedIterator, Cursor, Direction, Domain};
use crate::options::StoreOptions;
use crate::{
    check_bounds, check_key, check_value, store_root, Batch, Error, KeyValueStore, StoreIterator,
};
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

pub const LOG_FILE_NAME: &str = "data.log";
const COMPACT_FILE_NAME: &str = "data.log.compact";

const HEADER_LEN: usize = 17;
const HEADER_CRC_LEN: usize = 4;
// Reclaimable share of the log that triggers an automatic compaction.
const COMPACT_RATIO: f64 = 0.5;
const COMPACT_MIN_BYTES: u64 = 4 << 20;
const KIND_SET: u8 = 1;
const KIND_DELETE: u8 = 2;

pub struct Store {
    inner: Option<RwLock<Inner>>,
    path: PathBuf,
    sync_writes: bool,
}

struct Inner {
    values: HashMap<Vec<u8>, Vec<u8>>,
    order: BTreeSet<Vec<u8>>,
    log: BufWriter<File>,
    log_path: PathBuf,
    log_size: u64,
    reclaim_size: u64,
    scratch: Vec<u8>,
}

impl Store {
    pub fn open(name: &str, dir: &Path, options: &StoreOptions) -> Result<Self, Error> {
        let root = store_root(dir, name);
        fs::create_dir_all(&root)?;
        let path = root.join(LOG_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let (values, order, valid_len) = replay(&data)?;
        let live: u64 = values
            .iter()
            .map(|(k, v)| record_len(k, v) as u64)
            .sum();
        if valid_len < data.len() {
            warn!(
                "{}: discarding {} bytes of truncated record",
                path.display(),
                data.len() - valid_len
            );
            file.set_len(valid_len as u64)?;
        }
        debug!("{}: replayed {} keys", path.display(), values.len());
        if options.pin_snapshot {
            warn!("hashdb: snapshot pinning is not supported");
        }

        Ok(Store {
            inner: Some(RwLock::new(Inner {
                values,
                order,
                log: BufWriter::new(file),
                log_path: path.clone(),
                log_size: valid_len as u64,
                reclaim_size: (valid_len as u64).saturating_sub(live),
                scratch: Vec::new(),
            })),
            path,
            sync_writes: options.sync_writes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the log with only the live entries. A no-op when nothing
    /// can be reclaimed.
    pub fn compact(&self) -> Result<(), Error> {
        let mut inner = self.inner()?.write();
        if inner.reclaim_size == 0 {
            return Ok(());
        }
        inner.compact()
    }

    fn inner(&self) -> Result<&RwLock<Inner>, Error> {
        self.inner.as_ref().ok_or(Error::StoreClosed)
    }

    fn write(&self, kind: u8, key: &[u8], value: &[u8], sync: bool) -> Result<(), Error> {
        let mut inner = self.inner()?.write();
        inner.apply(kind, key, value)?;
        if sync || self.sync_writes {
            inner.sync()?;
        }
        inner.maybe_compact()
    }

    fn open_iterator<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        direction: Direction,
    ) -> Result<Box<dyn StoreIterator + 'a>, Error> {
        check_bounds(start, end)?;
        let inner = self.inner()?;
        let domain = Domain::new(start, end, direction);
        Ok(Box::new(BufferedIterator::new(HashCursor { inner }, domain)))
    }
}

impl Inner {
    /// Logs the mutation, then makes it visible.
    fn apply(&mut self, kind: u8, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if kind == KIND_DELETE && !self.values.contains_key(key) {
            return Ok(());
        }
        self.scratch.clear();
        encode_record(kind, key, value, &mut self.scratch);
        self.log.write_all(&self.scratch)?;
        let written = self.scratch.len() as u64;
        self.log_size += written;

        match kind {
            KIND_SET => match self.values.insert(key.to_vec(), value.to_vec()) {
                Some(old) => self.reclaim_size += record_len(key, &old) as u64,
                None => {
                    self.order.insert(key.to_vec());
                }
            },
            _ => {
                if let Some(old) = self.values.remove(key) {
                    self.reclaim_size += record_len(key, &old) as u64;
                }
                self.order.remove(key);
                // The tombstone itself is dead once applied.
                self.reclaim_size += written;
            }
        }
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<(), Error> {
        if self.log_size < COMPACT_MIN_BYTES
            || (self.reclaim_size as f64) < self.log_size as f64 * COMPACT_RATIO
        {
            return Ok(());
        }
        self.compact()
    }

    /// Writes the live entries in key order to a side file, syncs it and
    /// renames it over the log.
    fn compact(&mut self) -> Result<(), Error> {
        self.log.flush()?;
        let compact_path = self.log_path.with_file_name(COMPACT_FILE_NAME);
        let mut out = BufWriter::new(File::create(&compact_path)?);
        let mut written = 0u64;
        for key in &self.order {
            let value = self.values.get(key).ok_or_else(|| {
                Error::EngineFault("ordering index references a missing key".to_string())
            })?;
            self.scratch.clear();
            encode_record(KIND_SET, key, value, &mut self.scratch);
            out.write_all(&self.scratch)?;
            written += self.scratch.len() as u64;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);
        fs::rename(&compact_path, &self.log_path)?;

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.log_path)?;
        debug!(
            "{}: compacted {} -> {} bytes",
            self.log_path.display(),
            self.log_size,
            written
        );
        self.log = BufWriter::new(file);
        self.log_size = written;
        self.reclaim_size = 0;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.log.flush()?;
        self.log.get_ref().sync_data()?;
        Ok(())
    }
}

impl KeyValueStore for Store {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        check_key(key)?;
        Ok(self.inner()?.read().values.get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        check_key(key)?;
        Ok(self.inner()?.read().values.contains_key(key))
    }

    fn set(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        check_key(key)?;
        let value = check_value(value)?;
        self.write(KIND_SET, key, value, false)
    }

    fn set_sync(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        check_key(key)?;
        let value = check_value(value)?;
        self.write(KIND_SET, key, value, true)
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        check_key(key)?;
        self.write(KIND_DELETE, key, &[], false)
    }

    fn delete_sync(&self, key: &[u8]) -> Result<(), Error> {
        check_key(key)?;
        self.write(KIND_DELETE, key, &[], true)
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
        Box::new(HashBatch {
            store: self,
            ops: PendingOps::for_store(self.inner.is_some(), size),
        })
    }

    fn close(&mut self) -> Result<(), Error> {
        if let Some(inner) = self.inner.take() {
            let mut inner = inner.into_inner();
            inner.log.flush()?;
            inner.log.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn stats(&self) -> BTreeMap<String, String> {
        let mut stats = BTreeMap::new();
        if let Some(inner) = &self.inner {
            let inner = inner.read();
            stats.insert("key_count".to_string(), inner.values.len().to_string());
            stats.insert("data_size".to_string(), inner.log_size.to_string());
            stats.insert("reclaimable".to_string(), inner.reclaim_size.to_string());
            stats.insert("capacity".to_string(), inner.values.capacity().to_string());
            stats.insert("segments".to_string(), "1".to_string());
        }
        stats
    }
}

struct HashCursor<'a> {
    inner: &'a RwLock<Inner>,
}

impl<'a> Cursor for HashCursor<'a> {
    fn seek(
        &mut self,
        domain: &Domain,
        from: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<bool, Error> {
        let inner = self.inner.read();
        let key = match domain.direction() {
            Direction::Forward => {
                let lower = match from {
                    Some(k) => Bound::Excluded(k),
                    None => domain.start().map_or(Bound::Unbounded, Bound::Included),
                };
                inner.order.range::<[u8], _>((lower, Bound::Unbounded)).next()
            }
            Direction::Reverse => {
                let upper = match from {
                    Some(k) => Bound::Excluded(k),
                    None => domain.end().map_or(Bound::Unbounded, Bound::Excluded),
                };
                inner
                    .order
                    .range::<[u8], _>((Bound::Unbounded, upper))
                    .next_back()
            }
        };
        let key = match key {
            Some(k) if domain.contains(k) => k,
            _ => return Ok(false),
        };
        match inner.values.get(key) {
            Some(value) => {
                visit(key, value);
                Ok(true)
            }
            None => Err(Error::EngineFault(
                "ordering index references a missing key".to_string(),
            )),
        }
    }
}

pub struct HashBatch<'a> {
    store: &'a Store,
    ops: PendingOps,
}

impl<'a> HashBatch<'a> {
    fn commit(&mut self, sync: bool) -> Result<(), Error> {
        let ops = self.ops.take()?;
        let mut inner = self.store.inner()?.write();
        for op in ops {
            match op {
                Operation::Set(key, value) => inner.apply(KIND_SET, &key, &value)?,
                Operation::Delete(key) => inner.apply(KIND_DELETE, &key, &[])?,
            }
        }
        if sync || self.store.sync_writes {
            inner.sync()?;
        }
        inner.maybe_compact()
    }
}

impl<'a> Batch for HashBatch<'a> {
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

fn record_len(key: &[u8], value: &[u8]) -> usize {
    HEADER_LEN + key.len() + value.len()
}

fn encode_record(kind: u8, key: &[u8], value: &[u8], buf: &mut Vec<u8>) {
    let base = buf.len();
    let mut body = crc32fast::Hasher::new();
    body.update(key);
    body.update(value);
    buf.extend_from_slice(&[0; HEADER_CRC_LEN]);
    buf.push(kind);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body.finalize().to_le_bytes());
    let header_crc = crc32fast::hash(&buf[base + HEADER_CRC_LEN..base + HEADER_LEN]);
    buf[base..base + HEADER_CRC_LEN].copy_from_slice(&header_crc.to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Decodes the record at the head of `data`. `Ok(None)` means the record is
/// cut short: either the header itself is incomplete, or a verified header
/// declares more bytes than remain.
fn decode_record(data: &[u8]) -> Result<Option<(Operation, usize)>, Error> {
    if data.len() < HEADER_LEN {
        return Ok(None);
    }
    let header = &data[..HEADER_LEN];
    if crc32fast::hash(&header[HEADER_CRC_LEN..]) != le_u32(header) {
        return Err(Error::EngineFault(
            "record header checksum mismatch".to_string(),
        ));
    }
    let kind = header[4];
    let key_len = le_u32(&header[5..]) as usize;
    let value_len = le_u32(&header[9..]) as usize;
    let body_crc = le_u32(&header[13..]);
    let len = HEADER_LEN + key_len + value_len;
    if data.len() < len {
        return Ok(None);
    }
    let body = &data[HEADER_LEN..len];
    if crc32fast::hash(body) != body_crc {
        return Err(Error::EngineFault("record body checksum mismatch".to_string()));
    }
    let key = body[..key_len].to_vec();
    let op = match kind {
        KIND_SET => Operation::Set(key, body[key_len..].to_vec()),
        KIND_DELETE => Operation::Delete(key),
        other => {
            return Err(Error::EngineFault(format!("unknown record kind {}", other)));
        }
    };
    Ok(Some((op, len)))
}

type Replayed = (HashMap<Vec<u8>, Vec<u8>>, BTreeSet<Vec<u8>>, usize);

fn replay(data: &[u8]) -> Result<Replayed, Error> {
    let mut values = HashMap::new();
    let mut order = BTreeSet::new();
    let mut offset = 0;
    while offset < data.len() {
        let (op, len) = match decode_record(&data[offset..]) {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(Error::EngineFault(msg)) => {
                return Err(Error::EngineFault(format!("{} at offset {}", msg, offset)))
            }
            Err(e) => return Err(e),
        };
        match op {
            Operation::Set(key, value) => {
                order.insert(key.clone());
                values.insert(key, value);
            }
            Operation::Delete(key) => {
                order.remove(&key);
                values.remove(&key);
            }
        }
        offset += len;
    }
    Ok((values, order, offset))
}
