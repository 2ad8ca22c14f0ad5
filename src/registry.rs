//! Name to constructor mapping for the engines compiled into this build.

use crate::options::StoreOptions;
use crate::{hashdb, memdb, Error, KeyValueStore};
use log::debug;
use std::collections::BTreeMap;
use std::path::Path;

/// Opens instance `name` of a backend inside `dir`.
pub type Constructor =
    fn(name: &str, dir: &Path, options: &StoreOptions) -> Result<Box<dyn KeyValueStore>, Error>;

#[derive(Clone)]
pub struct BackendDescriptor {
    pub name: String,
    pub constructor: Constructor,
    /// Whether a batch write is all-or-nothing even when the engine fails
    /// halfway through applying it.
    pub atomic_batch: bool,
}

#[derive(Clone, Default)]
pub struct Registry {
    backends: BTreeMap<String, BackendDescriptor>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every engine enabled at compile time.
    pub fn with_default_backends() -> Self {
        let mut registry = Self::new();
        registry.register("memdb", open_memdb, true);
        registry.register("hashdb", open_hashdb, false);
        #[cfg(feature = "rocksdb")]
        registry.register("rocksdb", open_rocksdb, true);
        #[cfg(feature = "sled")]
        registry.register("sled", open_sled, true);
        #[cfg(feature = "lmdb")]
        registry.register("lmdb", open_lmdb, true);
        registry
    }

    /// Adds a backend. A later registration under the same name replaces the
    /// earlier one.
    pub fn register(&mut self, name: &str, constructor: Constructor, atomic_batch: bool) {
        debug!("registering backend {}", name);
        self.backends.insert(
            name.to_string(),
            BackendDescriptor {
                name: name.to_string(),
                constructor,
                atomic_batch,
            },
        );
    }

    pub fn open(
        &self,
        backend: &str,
        name: &str,
        dir: &Path,
        options: &StoreOptions,
    ) -> Result<Box<dyn KeyValueStore>, Error> {
        let descriptor = self
            .descriptor(backend)
            .ok_or_else(|| Error::UnknownBackend(backend.to_string()))?;
        (descriptor.constructor)(name, dir, options)
    }

    pub fn descriptor(&self, backend: &str) -> Option<&BackendDescriptor> {
        self.backends.get(backend)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }
}

fn open_memdb(
    _name: &str,
    _dir: &Path,
    _options: &StoreOptions,
) -> Result<Box<dyn KeyValueStore>, Error> {
    Ok(Box::new(memdb::Store::new()))
}

fn open_hashdb(
    name: &str,
    dir: &Path,
    options: &StoreOptions,
) -> Result<Box<dyn KeyValueStore>, Error> {
    Ok(Box::new(hashdb::Store::open(name, dir, options)?))
}

#[cfg(feature = "rocksdb")]
fn open_rocksdb(
    name: &str,
    dir: &Path,
    options: &StoreOptions,
) -> Result<Box<dyn KeyValueStore>, Error> {
    Ok(Box::new(crate::rocksdb::Store::open(name, dir, options)?))
}

#[cfg(feature = "sled")]
fn open_sled(
    name: &str,
    dir: &Path,
    options: &StoreOptions,
) -> Result<Box<dyn KeyValueStore>, Error> {
    Ok(Box::new(crate::sled::Store::open(name, dir, options)?))
}

#[cfg(feature = "lmdb")]
fn open_lmdb(
    name: &str,
    dir: &Path,
    options: &StoreOptions,
) -> Result<Box<dyn KeyValueStore>, Error> {
    Ok(Box::new(crate::lmdb::Store::open(name, dir, options)?))
}
