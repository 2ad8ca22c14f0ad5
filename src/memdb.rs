//! Ordered in-memory engine. Nothing is persisted, so the `*_sync` variants
//! are plain writes.

use crate::batch::{Operation, PendingOps};
use crate::iterator::{BufferedIterator, Cursor, Direction, Domain};
use crate::{
    check_bounds, check_key, check_value, Batch, Error, KeyValueStore, StoreIterator,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

pub struct Store {
    tree: Option<RwLock<Tree>>,
}

impl Store {
    pub fn new() -> Self {
        Store {
            tree: Some(RwLock::new(BTreeMap::new())),
        }
    }

    fn tree(&self) -> Result<&RwLock<Tree>, Error> {
        self.tree.as_ref().ok_or(Error::StoreClosed)
    }

    fn open_iterator<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        direction: Direction,
    ) -> Result<Box<dyn StoreIterator + 'a>, Error> {
        check_bounds(start, end)?;
        let tree = self.tree()?;
        let domain = Domain::new(start, end, direction);
        Ok(Box::new(BufferedIterator::new(MemCursor { tree }, domain)))
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for Store {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        check_key(key)?;
        Ok(self.tree()?.read().get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        check_key(key)?;
        Ok(self.tree()?.read().contains_key(key))
    }

    fn set(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        check_key(key)?;
        let value = check_value(value)?;
        self.tree()?.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn set_sync(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        self.set(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        check_key(key)?;
        self.tree()?.write().remove(key);
        Ok(())
    }

    fn delete_sync(&self, key: &[u8]) -> Result<(), Error> {
        self.delete(key)
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
        Box::new(MemBatch {
            store: self,
            ops: PendingOps::for_store(self.tree.is_some(), size),
        })
    }

    fn close(&mut self) -> Result<(), Error> {
        self.tree = None;
        Ok(())
    }

    fn stats(&self) -> BTreeMap<String, String> {
        let mut stats = BTreeMap::new();
        if let Some(tree) = &self.tree {
            let tree = tree.read();
            let data_size: usize = tree.iter().map(|(k, v)| k.len() + v.len()).sum();
            stats.insert("key_count".to_string(), tree.len().to_string());
            stats.insert("data_size".to_string(), data_size.to_string());
        }
        stats
    }
}

struct MemCursor<'a> {
    tree: &'a RwLock<Tree>,
}

impl<'a> Cursor for MemCursor<'a> {
    fn seek(
        &mut self,
        domain: &Domain,
        from: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<bool, Error> {
        let tree = self.tree.read();
        let entry = match domain.direction() {
            Direction::Forward => {
                let lower = match from {
                    Some(k) => Bound::Excluded(k),
                    None => domain.start().map_or(Bound::Unbounded, Bound::Included),
                };
                tree.range::<[u8], _>((lower, Bound::Unbounded)).next()
            }
            Direction::Reverse => {
                let upper = match from {
                    Some(k) => Bound::Excluded(k),
                    None => domain.end().map_or(Bound::Unbounded, Bound::Excluded),
                };
                tree.range::<[u8], _>((Bound::Unbounded, upper)).next_back()
            }
        };
        match entry {
            Some((k, v)) if domain.contains(k) => {
                visit(k, v);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub struct MemBatch<'a> {
    store: &'a Store,
    ops: PendingOps,
}

impl<'a> MemBatch<'a> {
    fn apply(&mut self) -> Result<(), Error> {
        let ops = self.ops.take()?;
        let mut tree = self.store.tree()?.write();
        for op in ops {
            match op {
                Operation::Set(key, value) => {
                    tree.insert(key, value);
                }
                Operation::Delete(key) => {
                    tree.remove(&key);
                }
            }
        }
        Ok(())
    }
}

impl<'a> Batch for MemBatch<'a> {
    fn set(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), Error> {
        self.ops.set(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.ops.delete(key)
    }

    fn write(&mut self) -> Result<(), Error> {
        self.apply()
    }

    fn write_sync(&mut self) -> Result<(), Error> {
        self.apply()
    }

    fn close(&mut self) -> Result<(), Error> {
        self.ops.close()
    }

    fn byte_size(&self) -> Result<usize, Error> {
        self.ops.byte_size()
    }
}
