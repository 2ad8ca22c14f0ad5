use crate::arena::{Arena, Slot, KEY_ARENA_CAPACITY, VALUE_ARENA_CAPACITY};
use crate::{Error, StoreIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// The `[start, end)` key range of a cursor plus its walking direction.
#[derive(Debug, Clone)]
pub struct Domain {
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    direction: Direction,
}

impl Domain {
    pub fn new(start: Option<&[u8]>, end: Option<&[u8]>, direction: Direction) -> Self {
        Domain {
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            direction,
        }
    }

    pub fn start(&self) -> Option<&[u8]> {
        self.start.as_deref()
    }

    pub fn end(&self) -> Option<&[u8]> {
        self.end.as_deref()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.start().map_or(true, |s| key >= s) && self.end().map_or(true, |e| key < e)
    }

    /// True when no key can satisfy both bounds.
    pub fn is_empty(&self) -> bool {
        matches!((self.start(), self.end()), (Some(s), Some(e)) if s >= e)
    }
}

/// Engine hook for cursors that re-seek on every step.
pub trait Cursor {
    /// Finds the entry next to `from` (exclusive) in the domain's direction,
    /// or the first entry of the domain when `from` is `None`, and hands it to
    /// `visit`. Returns `false` once the domain has no more entries.
    fn seek(
        &mut self,
        domain: &Domain,
        from: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<bool, Error>;

    /// Drops whatever the engine pins for this cursor.
    fn release(&mut self) {}
}

/// A `StoreIterator` over any `Cursor`, copying each entry into private arenas.
pub struct BufferedIterator<C: Cursor> {
    cursor: C,
    domain: Domain,
    keys: Arena,
    values: Arena,
    key: Slot,
    value: Slot,
    prev: Vec<u8>,
    valid: bool,
    closed: bool,
    error: Option<Error>,
}

impl<C: Cursor> BufferedIterator<C> {
    /// Builds the iterator and positions it on the first entry of `domain`.
    pub fn new(cursor: C, domain: Domain) -> Self {
        let mut it = BufferedIterator {
            cursor,
            domain,
            keys: Arena::new(KEY_ARENA_CAPACITY),
            values: Arena::new(VALUE_ARENA_CAPACITY),
            key: Slot::Empty,
            value: Slot::Empty,
            prev: Vec::new(),
            valid: false,
            closed: false,
            error: None,
        };
        if !it.domain.is_empty() {
            it.step(false);
        }
        it
    }

    fn step(&mut self, started: bool) {
        let BufferedIterator {
            cursor,
            domain,
            keys,
            values,
            key,
            value,
            prev,
            ..
        } = self;
        let from = if started { Some(prev.as_slice()) } else { None };
        let mut visit = |k: &[u8], v: &[u8]| {
            keys.reset();
            values.reset();
            *key = keys.store(k);
            *value = values.store(v);
        };
        match cursor.seek(domain, from, &mut visit) {
            Ok(found) => self.valid = found,
            Err(e) => {
                self.valid = false;
                self.error = Some(e);
            }
        }
        if !self.valid {
            self.key = Slot::Empty;
            self.value = Slot::Empty;
        }
    }

    fn assert_valid(&self) {
        assert!(self.valid, "iterator is invalid");
    }
}

impl<C: Cursor> StoreIterator for BufferedIterator<C> {
    fn domain(&self) -> (Option<&[u8]>, Option<&[u8]>) {
        (self.domain.start(), self.domain.end())
    }

    fn valid(&self) -> bool {
        self.valid
    }

    fn next(&mut self) {
        self.assert_valid();
        self.prev.clear();
        self.prev.extend_from_slice(self.key.resolve(&self.keys));
        self.step(true);
    }

    fn key(&self) -> &[u8] {
        self.assert_valid();
        self.key.resolve(&self.keys)
    }

    fn value(&self) -> &[u8] {
        self.assert_valid();
        self.value.resolve(&self.values)
    }

    fn error(&self) -> Result<(), Error> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        if !self.closed {
            self.closed = true;
            self.valid = false;
            self.key = Slot::Empty;
            self.value = Slot::Empty;
            self.keys.reset();
            self.values.reset();
            self.cursor.release();
        }
        Ok(())
    }
}

impl<C: Cursor> Drop for BufferedIterator<C> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
