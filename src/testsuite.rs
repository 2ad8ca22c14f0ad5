//! Behaviour every `KeyValueStore` must share, checked against each engine.

use crate::{Error, KeyValueStore, StoreIterator};

/// Expands to one `#[test]` per contract check. `$open` must name a function
/// returning `(tempfile::TempDir, Box<dyn KeyValueStore>)`.
macro_rules! store_contract_tests {
    ($open:path) => {
        store_contract_tests!(@each $open;
            set_then_get,
            delete_then_get,
            has_tracks_writes,
            sync_variants,
            empty_value_is_present,
            empty_key_rejected,
            nil_value_rejected,
            iterates_loaded_keys,
            bounded_iteration_mirrors,
            empty_range_starts_exhausted,
            iteration_sees_latest_state,
            large_values_iterate,
            batch_last_writer_wins,
            batch_applies_together,
            batch_rejects_after_write,
            batch_rejects_after_close,
            batch_tracks_byte_size,
            print_dumps_store,
        );

        #[test]
        fn contract_closed_store_rejects() {
            let (_dir, mut store) = $open();
            $crate::testsuite::closed_store_rejects(&mut *store);
        }

        #[test]
        #[should_panic(expected = "iterator is invalid")]
        fn contract_exhausted_iterator_panics() {
            let (_dir, store) = $open();
            $crate::testsuite::exhausted_iterator_panics(&*store);
        }
    };
    (@each $open:path; $($check:ident),* $(,)?) => {
        $(
            #[test]
            fn $check() {
                let (_dir, store) = $open();
                $crate::testsuite::$check(&*store);
            }
        )*
    };
}

fn v(bytes: &[u8]) -> Option<&[u8]> {
    Some(bytes)
}

fn drain(it: &mut dyn StoreIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut pairs = Vec::new();
    while it.valid() {
        pairs.push((it.key().to_vec(), it.value().to_vec()));
        it.next();
    }
    it.error().unwrap();
    pairs
}

fn keys_of(
    store: &dyn KeyValueStore,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
    reverse: bool,
) -> Vec<Vec<u8>> {
    let mut it = if reverse {
        store.reverse_iterator(start, end).unwrap()
    } else {
        store.iterator(start, end).unwrap()
    };
    let keys = drain(&mut *it).into_iter().map(|(k, _)| k).collect();
    it.close().unwrap();
    keys
}

pub fn set_then_get(store: &dyn KeyValueStore) {
    store.set(b"alpha", v(b"1")).unwrap();
    store.set(b"bravo", v(b"2")).unwrap();
    assert_eq!(Some(b"1".to_vec()), store.get(b"alpha").unwrap());
    assert_eq!(Some(b"2".to_vec()), store.get(b"bravo").unwrap());
    assert_eq!(None, store.get(b"charlie").unwrap());

    store.set(b"alpha", v(b"one")).unwrap();
    assert_eq!(Some(b"one".to_vec()), store.get(b"alpha").unwrap());
}

pub fn delete_then_get(store: &dyn KeyValueStore) {
    store.set(b"k", v(b"v")).unwrap();
    store.delete(b"k").unwrap();
    assert_eq!(None, store.get(b"k").unwrap());

    store.delete(b"never-written").unwrap();
    assert_eq!(None, store.get(b"never-written").unwrap());
}

pub fn has_tracks_writes(store: &dyn KeyValueStore) {
    assert!(!store.has(b"k").unwrap());
    store.set(b"k", v(b"v")).unwrap();
    assert!(store.has(b"k").unwrap());
    store.delete(b"k").unwrap();
    assert!(!store.has(b"k").unwrap());
}

pub fn sync_variants(store: &dyn KeyValueStore) {
    store.set_sync(b"k", v(b"v")).unwrap();
    assert_eq!(Some(b"v".to_vec()), store.get(b"k").unwrap());
    store.delete_sync(b"k").unwrap();
    assert!(!store.has(b"k").unwrap());
}

pub fn empty_value_is_present(store: &dyn KeyValueStore) {
    store.set(b"k", v(b"")).unwrap();
    assert_eq!(Some(Vec::new()), store.get(b"k").unwrap());
    assert!(store.has(b"k").unwrap());
}

pub fn empty_key_rejected(store: &dyn KeyValueStore) {
    assert_eq!(Err(Error::KeyEmpty), store.get(b""));
    assert_eq!(Err(Error::KeyEmpty), store.has(b""));
    assert_eq!(Err(Error::KeyEmpty), store.set(b"", v(b"v")));
    assert_eq!(Err(Error::KeyEmpty), store.set_sync(b"", v(b"v")));
    assert_eq!(Err(Error::KeyEmpty), store.delete(b""));
    assert_eq!(Err(Error::KeyEmpty), store.delete_sync(b""));

    let empty: Option<&[u8]> = Some(&b""[..]);
    assert_eq!(Some(Error::KeyEmpty), store.iterator(empty, None).err());
    assert_eq!(Some(Error::KeyEmpty), store.iterator(None, empty).err());
    assert_eq!(Some(Error::KeyEmpty), store.reverse_iterator(empty, None).err());
    assert_eq!(Some(Error::KeyEmpty), store.reverse_iterator(None, empty).err());

    let mut batch = store.new_batch();
    assert_eq!(Err(Error::KeyEmpty), batch.set(b"", v(b"v")));
    assert_eq!(Err(Error::KeyEmpty), batch.delete(b""));
}

pub fn nil_value_rejected(store: &dyn KeyValueStore) {
    assert_eq!(Err(Error::ValueNil), store.set(b"k", None));
    assert_eq!(Err(Error::ValueNil), store.set_sync(b"k", None));
    let mut batch = store.new_batch();
    assert_eq!(Err(Error::ValueNil), batch.set(b"k", None));
    assert!(!store.has(b"k").unwrap());
}

pub fn iterates_loaded_keys(store: &dyn KeyValueStore) {
    let keys: Vec<&[u8]> = vec![&b"k-00000000"[..], b"k-00000001", b"k-00000002"];
    for key in &keys {
        store.set(key, v(b"x")).unwrap();
    }

    let mut it = store.iterator(None, None).unwrap();
    assert_eq!((None, None), it.domain());
    let pairs = drain(&mut *it);
    it.close().unwrap();
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        keys.iter().map(|k| (k.to_vec(), b"x".to_vec())).collect();
    assert_eq!(expected, pairs);

    let mut reversed: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
    reversed.reverse();
    assert_eq!(reversed, keys_of(store, None, None, true));
}

pub fn bounded_iteration_mirrors(store: &dyn KeyValueStore) {
    for key in [&b"a"[..], b"b", b"ba", b"c", b"d", b"e"] {
        store.set(key, v(key)).unwrap();
    }
    let start: Option<&[u8]> = Some(&b"b"[..]);
    let end: Option<&[u8]> = Some(&b"d"[..]);

    let forward = keys_of(store, start, end, false);
    assert_eq!(vec![b"b".to_vec(), b"ba".to_vec(), b"c".to_vec()], forward);

    let mut reverse = keys_of(store, start, end, true);
    reverse.reverse();
    assert_eq!(forward, reverse);

    let it = store.reverse_iterator(start, end).unwrap();
    assert_eq!((start, end), it.domain());

    assert_eq!(
        vec![b"d".to_vec(), b"e".to_vec()],
        keys_of(store, Some(&b"cz"[..]), None, false)
    );
    assert_eq!(
        vec![b"ba".to_vec(), b"b".to_vec(), b"a".to_vec()],
        keys_of(store, None, Some(&b"bb"[..]), true)
    );
}

pub fn empty_range_starts_exhausted(store: &dyn KeyValueStore) {
    for key in [&b"a"[..], b"b", b"c"] {
        store.set(key, v(b"v")).unwrap();
    }
    let ranges: [(&[u8], &[u8]); 3] = [
        (&b"b"[..], &b"b"[..]),
        (&b"c"[..], &b"a"[..]),
        (&b"bb"[..], &b"bc"[..]),
    ];
    for (start, end) in ranges {
        assert!(!store.iterator(Some(start), Some(end)).unwrap().valid());
        assert!(!store.reverse_iterator(Some(start), Some(end)).unwrap().valid());
    }
    assert!(!store.iterator(Some(&b"z"[..]), None).unwrap().valid());
    assert!(!store.reverse_iterator(None, Some(&b"a"[..])).unwrap().valid());
}

pub fn iteration_sees_latest_state(store: &dyn KeyValueStore) {
    store.set(b"a", v(b"1")).unwrap();
    store.set(b"b", v(b"2")).unwrap();
    store.set(b"c", v(b"3")).unwrap();
    store.delete(b"b").unwrap();
    store.set(b"c", v(b"33")).unwrap();

    let mut it = store.iterator(None, None).unwrap();
    let pairs = drain(&mut *it);
    assert_eq!(
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"c".to_vec(), b"33".to_vec())
        ],
        pairs
    );
}

pub fn large_values_iterate(store: &dyn KeyValueStore) {
    let value = vec![7u8; 120_000];
    for key in [&b"k1"[..], b"k2", b"k3", b"k4"] {
        store.set(key, Some(value.as_slice())).unwrap();
    }
    let mut it = store.iterator(None, None).unwrap();
    let pairs = drain(&mut *it);
    assert_eq!(4, pairs.len());
    assert!(pairs.iter().all(|(_, v)| *v == value));
}

pub fn batch_last_writer_wins(store: &dyn KeyValueStore) {
    let mut batch = store.new_batch();
    batch.set(b"k", v(b"v1")).unwrap();
    batch.set(b"k", v(b"v2")).unwrap();
    batch.delete(b"k").unwrap();
    batch.write().unwrap();
    drop(batch);
    assert_eq!(None, store.get(b"k").unwrap());

    let mut batch = store.new_batch_with_size(2);
    batch.delete(b"j").unwrap();
    batch.set(b"j", v(b"back")).unwrap();
    batch.write().unwrap();
    drop(batch);
    assert_eq!(Some(b"back".to_vec()), store.get(b"j").unwrap());
}

pub fn batch_applies_together(store: &dyn KeyValueStore) {
    store.set(b"k2", v(b"old")).unwrap();

    let mut batch = store.new_batch();
    batch.set(b"k", v(b"v1")).unwrap();
    batch.delete(b"k2").unwrap();
    assert_eq!(None, store.get(b"k").unwrap());
    assert_eq!(Some(b"old".to_vec()), store.get(b"k2").unwrap());

    batch.write_sync().unwrap();
    drop(batch);
    assert_eq!(Some(b"v1".to_vec()), store.get(b"k").unwrap());
    assert_eq!(None, store.get(b"k2").unwrap());
}

pub fn batch_rejects_after_write(store: &dyn KeyValueStore) {
    let mut batch = store.new_batch();
    batch.set(b"k", v(b"v")).unwrap();
    batch.write().unwrap();
    assert_eq!(Err(Error::BatchClosed), batch.set(b"k", v(b"v")));
    assert_eq!(Err(Error::BatchClosed), batch.delete(b"k"));
    assert_eq!(Err(Error::BatchClosed), batch.write());
    assert_eq!(Err(Error::BatchClosed), batch.write_sync());
    assert_eq!(Err(Error::BatchClosed), batch.byte_size());
    assert_eq!(Err(Error::BatchClosed), batch.close());
}

pub fn batch_rejects_after_close(store: &dyn KeyValueStore) {
    let mut batch = store.new_batch();
    batch.set(b"k", v(b"v")).unwrap();
    batch.close().unwrap();
    assert_eq!(Err(Error::BatchClosed), batch.set(b"k", v(b"v")));
    assert_eq!(Err(Error::BatchClosed), batch.write());
    assert_eq!(Err(Error::BatchClosed), batch.byte_size());
    drop(batch);
    assert_eq!(None, store.get(b"k").unwrap());
}

pub fn batch_tracks_byte_size(store: &dyn KeyValueStore) {
    let mut batch = store.new_batch_with_size(8);
    assert_eq!(Ok(0), batch.byte_size());
    batch.set(b"key", v(b"value")).unwrap();
    batch.delete(b"gone").unwrap();
    assert_eq!(Ok(12), batch.byte_size());
}

pub fn print_dumps_store(store: &dyn KeyValueStore) {
    store.set(b"k", v(b"v")).unwrap();
    store.print().unwrap();
}

pub fn closed_store_rejects(store: &mut dyn KeyValueStore) {
    store.set(b"k", v(b"v")).unwrap();
    store.close().unwrap();
    store.close().unwrap();

    assert_eq!(Err(Error::StoreClosed), store.get(b"k"));
    assert_eq!(Err(Error::StoreClosed), store.has(b"k"));
    assert_eq!(Err(Error::StoreClosed), store.set(b"k", v(b"v")));
    assert_eq!(Err(Error::StoreClosed), store.set_sync(b"k", v(b"v")));
    assert_eq!(Err(Error::StoreClosed), store.delete(b"k"));
    assert_eq!(Err(Error::StoreClosed), store.delete_sync(b"k"));
    assert_eq!(Some(Error::StoreClosed), store.iterator(None, None).err());
    assert_eq!(Some(Error::StoreClosed), store.reverse_iterator(None, None).err());

    let mut batch = store.new_batch_with_size(4);
    assert_eq!(Err(Error::KeyEmpty), batch.set(b"", v(b"v")));
    assert_eq!(Err(Error::StoreClosed), batch.set(b"k", v(b"v")));
    assert_eq!(Err(Error::StoreClosed), batch.delete(b"k"));
    assert_eq!(Err(Error::StoreClosed), batch.byte_size());
    assert_eq!(Err(Error::StoreClosed), batch.write());
    assert_eq!(Err(Error::StoreClosed), batch.write_sync());
    assert_eq!(Err(Error::StoreClosed), batch.close());
}

pub fn exhausted_iterator_panics(store: &dyn KeyValueStore) {
    store.set(b"k", v(b"v")).unwrap();
    let mut it = store.iterator(None, None).unwrap();
    it.next();
    assert!(!it.valid());
    it.key();
}
