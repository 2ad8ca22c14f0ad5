//! Append-only scratch buffer for iterator keys and values.
//!
//! The buffer is allocated once at a fixed capacity and never grows, so a
//! range handed out earlier always stays addressable. When the remaining room
//! is too small the caller gets a heap copy instead.

use std::ops::Range;

pub const KEY_ARENA_CAPACITY: usize = 64 * 1024;
pub const VALUE_ARENA_CAPACITY: usize = 256 * 1024;

#[derive(Debug)]
pub struct Arena {
    buf: Vec<u8>,
    capacity: usize,
}

/// Where the bytes of one copied entry live.
#[derive(Debug, Default)]
pub enum Slot {
    #[default]
    Empty,
    Arena(Range<usize>),
    Heap(Vec<u8>),
}

impl Arena {
    /// The buffer itself is allocated on first use.
    pub fn new(capacity: usize) -> Self {
        Arena {
            buf: Vec::new(),
            capacity,
        }
    }

    /// Appends `bytes` and returns their position, or `None` if they do not fit.
    pub fn copy(&mut self, bytes: &[u8]) -> Option<Range<usize>> {
        if self.buf.capacity() == 0 && self.capacity > 0 {
            self.buf = Vec::with_capacity(self.capacity);
        }
        if bytes.len() > self.capacity.saturating_sub(self.buf.len()) {
            return None;
        }
        let off = self.buf.len();
        self.buf.extend_from_slice(bytes);
        Some(off..off + bytes.len())
    }

    /// Copies into the arena when there is room, onto the heap otherwise.
    pub fn store(&mut self, bytes: &[u8]) -> Slot {
        match self.copy(bytes) {
            Some(range) => Slot::Arena(range),
            None => Slot::Heap(bytes.to_vec()),
        }
    }

    pub fn get(&self, range: Range<usize>) -> &[u8] {
        &self.buf[range]
    }

    pub fn used(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

impl Slot {
    pub fn resolve<'a>(&'a self, arena: &'a Arena) -> &'a [u8] {
        match self {
            Slot::Empty => &[],
            Slot::Arena(range) => arena.get(range.clone()),
            Slot::Heap(bytes) => bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_until_full_then_falls_back() {
        let mut arena = Arena::new(8);
        assert_eq!(0, arena.used());

        let a = arena.store(b"abcd");
        let b = arena.store(b"efg");
        let c = arena.store(b"hij");
        assert!(matches!(a, Slot::Arena(_)));
        assert!(matches!(b, Slot::Arena(_)));
        assert!(matches!(c, Slot::Heap(_)));

        assert_eq!(b"abcd", a.resolve(&arena));
        assert_eq!(b"efg", b.resolve(&arena));
        assert_eq!(b"hij", c.resolve(&arena));
        assert_eq!(7, arena.used());
    }

    #[test]
    fn exact_fit_stays_in_arena() {
        let mut arena = Arena::new(4);
        assert_eq!(Some(0..4), arena.copy(b"1234"));
        assert_eq!(None, arena.copy(b"5"));
        assert_eq!(Some(4..4), arena.copy(b""));
    }

    #[test]
    fn reset_reclaims_space() {
        let mut arena = Arena::new(4);
        arena.copy(b"1234").unwrap();
        arena.reset();
        assert_eq!(Some(0..2), arena.copy(b"56"));
    }

    #[test]
    fn zero_capacity_always_falls_back() {
        let mut arena = Arena::new(0);
        assert!(matches!(arena.store(b"k"), Slot::Heap(_)));
        assert_eq!(b"", Slot::Empty.resolve(&arena));
    }
}
