//! End-to-end tests over real backing files.

use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use rand::Rng;
use tempfile::TempDir;

use mmcache::{Cache, CacheError, CacheOptions, ExpungeMode, WriteOutcome};

const HEADER_SIZE: u64 = 64;
const WORD: u64 = 8;
const ENTRY_HEADER: u64 = 48;

fn round(len: u64) -> u64 {
    (len + WORD - 1) & !(WORD - 1)
}

fn open_with(dir: &TempDir, f: impl FnOnce(&mut CacheOptions)) -> Cache {
    let mut opts = CacheOptions::new(dir.path().join("cache.shm"));
    f(&mut opts);
    Cache::new(opts).unwrap()
}

fn open(dir: &TempDir) -> Cache {
    open_with(dir, |_| {})
}

/// Lock/write/unlock one key.
fn put(cache: &mut Cache, key: &[u8], val: &[u8]) {
    let (page, intra) = cache.hash(key);
    cache.lock(page).unwrap();
    assert!(cache.write(intra, key, val, 0, 0).unwrap().is_stored());
    cache.unlock().unwrap();
}

/// Lock/read/unlock one key, copying the value out.
fn get(cache: &mut Cache, key: &[u8]) -> Option<Vec<u8>> {
    let (page, intra) = cache.hash(key);
    cache.lock(page).unwrap();
    let hit = cache.read(intra, key).unwrap().map(|(v, _)| v.to_vec());
    cache.unlock().unwrap();
    hit
}

/// Generate `count` distinct keys that all hash to `page`.
fn keys_for_page(cache: &Cache, page: usize, count: usize) -> Vec<Vec<u8>> {
    let mut keys = Vec::new();
    let mut i = 0u64;
    while keys.len() < count {
        let k = format!("key-{i}");
        if cache.hash(k.as_bytes()).0 == page {
            keys.push(k.into_bytes());
        }
        i += 1;
    }
    keys
}

#[test]
fn empty_key_roundtrip() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    let (page, intra) = cache.hash(b"");
    cache.lock(page).unwrap();
    assert!(cache.write(intra, b"", b"abc", 60, 0).unwrap().is_stored());
    let (val, _) = cache.read(intra, b"").unwrap().unwrap();
    assert_eq!(val, b"abc");
    assert_eq!(val.len(), 3);
    cache.unlock().unwrap();
}

#[test]
fn zero_length_value() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);
    put(&mut cache, b"k", b"");
    assert_eq!(get(&mut cache, b"k").unwrap(), b"");
}

#[test]
fn flags_roundtrip() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    let (page, intra) = cache.hash(b"flagged");
    cache.lock(page).unwrap();
    assert!(cache
        .write(intra, b"flagged", b"v", 0, 0xdead_beef)
        .unwrap()
        .is_stored());
    let (_, flags) = cache.read(intra, b"flagged").unwrap().unwrap();
    assert_eq!(flags, 0xdead_beef);
    let deleted_flags = cache.delete(intra, b"flagged").unwrap().unwrap();
    assert_eq!(deleted_flags, 0xdead_beef);
    cache.unlock().unwrap();
}

#[test]
fn overwrite_keeps_latest_and_tombstones_old() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    let (page, intra) = cache.hash(b"k");
    cache.lock(page).unwrap();
    assert!(cache.write(intra, b"k", b"yy", 0, 0).unwrap().is_stored());
    let before = cache.page_stats().unwrap();
    assert!(cache.write(intra, b"k", b"zzzz", 0, 0).unwrap().is_stored());
    let after = cache.page_stats().unwrap();
    assert_eq!(after.old_slots, before.old_slots + 1);

    let (val, _) = cache.read(intra, b"k").unwrap().unwrap();
    assert_eq!(val, b"zzzz");
    assert_eq!(val.len(), 4);
    cache.unlock().unwrap();
}

#[test]
fn delete_then_read_misses() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    put(&mut cache, b"gone", b"value");
    let (page, intra) = cache.hash(b"gone");
    cache.lock(page).unwrap();
    assert!(cache.delete(intra, b"gone").unwrap().is_some());
    assert!(cache.read(intra, b"gone").unwrap().is_none());

    // A second delete misses and leaves the header untouched.
    let before = cache.page_stats().unwrap();
    assert!(cache.delete(intra, b"gone").unwrap().is_none());
    let after = cache.page_stats().unwrap();
    assert_eq!(before.free_slots, after.free_slots);
    assert_eq!(before.old_slots, after.old_slots);
    assert_eq!(before.free_data, after.free_data);
    cache.unlock().unwrap();
}

#[test]
fn oversized_write_rejected() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    let key = vec![b' '; 1024];
    let val = vec![b' '; 65536];
    let (page, intra) = cache.hash(&key);
    cache.lock(page).unwrap();
    assert_eq!(
        cache.write(intra, &key, &val, 0, 0).unwrap(),
        WriteOutcome::NotStored
    );
    assert!(cache.read(intra, &key).unwrap().is_none());
    cache.unlock().unwrap();
}

#[test]
fn expiry_is_strict_and_tombstones() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    let (page, intra) = cache.hash(b"short-lived");
    cache.lock(page).unwrap();
    assert!(cache
        .write(intra, b"short-lived", b"v", 1, 0)
        .unwrap()
        .is_stored());
    let before = cache.page_stats().unwrap();
    cache.unlock().unwrap();

    std::thread::sleep(Duration::from_secs(2));

    cache.lock(page).unwrap();
    assert!(cache.read(intra, b"short-lived").unwrap().is_none());
    let after = cache.page_stats().unwrap();
    assert_eq!(after.free_slots, before.free_slots + 1);
    assert_eq!(after.old_slots, before.old_slots + 1);
    cache.unlock().unwrap();
}

#[test]
fn make_room_expunge_grows_slot_table() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    let page = cache.hash(b"anchor").0;
    let keys = keys_for_page(&cache, page, 65);

    cache.lock(page).unwrap();
    for key in &keys {
        let (_, intra) = cache.hash(key);
        assert!(cache.write(intra, key, b"v", 0, 0).unwrap().is_stored());
    }

    let plan = cache
        .calc_expunge(ExpungeMode::MakeRoom, Some(0))
        .unwrap()
        .expect("page is crowded enough that there is work to do");
    assert_eq!(plan.new_num_slots, 2 * 89 + 1);
    assert_eq!(plan.evicted, 0);
    assert_eq!(plan.keep.len(), keys.len());

    cache.do_expunge(plan).unwrap();
    cache.verify_page().unwrap();

    for key in &keys {
        let (_, intra) = cache.hash(key);
        assert!(cache.read(intra, key).unwrap().is_some(), "lost {key:?}");
    }
    cache.unlock().unwrap();
}

#[test]
fn expunge_short_circuits_on_roomy_page() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    let page = cache.hash(b"anchor").0;
    let keys = keys_for_page(&cache, page, 3);
    cache.lock(page).unwrap();
    for key in &keys {
        let (_, intra) = cache.hash(key);
        assert!(cache.write(intra, key, b"v", 0, 0).unwrap().is_stored());
    }
    assert!(cache
        .calc_expunge(ExpungeMode::MakeRoom, Some(10))
        .unwrap()
        .is_none());
    cache.unlock().unwrap();
}

#[test]
fn expired_only_expunge_compacts_survivors() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    let page = cache.hash(b"anchor").0;
    let keys = keys_for_page(&cache, page, 2);
    let (keeper, dying) = (&keys[0], &keys[1]);

    cache.lock(page).unwrap();
    let (_, keeper_intra) = cache.hash(keeper);
    let (_, dying_intra) = cache.hash(dying);
    assert!(cache
        .write(keeper_intra, keeper, b"stays", 0, 0)
        .unwrap()
        .is_stored());
    assert!(cache
        .write(dying_intra, dying, b"goes", 1, 0)
        .unwrap()
        .is_stored());
    cache.unlock().unwrap();

    std::thread::sleep(Duration::from_secs(2));

    cache.lock(page).unwrap();
    let plan = cache
        .calc_expunge(ExpungeMode::Expired, None)
        .unwrap()
        .unwrap();
    assert_eq!(plan.evicted, 1);
    assert_eq!(plan.keep.len(), 1);
    assert_eq!(plan.new_num_slots, 89);
    let view = cache.entry_details(plan.keep[0]).unwrap();
    assert_eq!(view.key, keeper.as_slice());
    assert_eq!(view.value, b"stays");

    cache.do_expunge(plan).unwrap();
    cache.verify_page().unwrap();

    // Survivor sits compacted at the bottom of the arena.
    let stats = cache.page_stats().unwrap();
    let expected = HEADER_SIZE
        + 89 * WORD
        + round(ENTRY_HEADER + keeper.len() as u64 + b"stays".len() as u64);
    assert_eq!(stats.free_data, expected);

    assert!(cache.read(keeper_intra, keeper).unwrap().is_some());
    assert!(cache.read(dying_intra, dying).unwrap().is_none());
    cache.unlock().unwrap();
}

#[test]
fn expunge_all_empties_the_page() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    let page = cache.hash(b"anchor").0;
    let keys = keys_for_page(&cache, page, 5);
    cache.lock(page).unwrap();
    for key in &keys {
        let (_, intra) = cache.hash(key);
        assert!(cache.write(intra, key, b"v", 0, 0).unwrap().is_stored());
    }
    let plan = cache.calc_expunge(ExpungeMode::All, None).unwrap().unwrap();
    assert_eq!(plan.evicted, keys.len());
    assert!(plan.keep.is_empty());
    cache.do_expunge(plan).unwrap();
    cache.verify_page().unwrap();

    let stats = cache.page_stats().unwrap();
    assert_eq!(stats.free_slots, stats.num_slots);
    for key in &keys {
        let (_, intra) = cache.hash(key);
        assert!(cache.read(intra, key).unwrap().is_none());
    }
    cache.unlock().unwrap();
}

#[test]
fn full_slot_table_rejects_then_reuses_tombstone() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    let page = cache.hash(b"anchor").0;
    let keys = keys_for_page(&cache, page, 90);

    cache.lock(page).unwrap();
    for key in &keys[..89] {
        let (_, intra) = cache.hash(key);
        assert!(cache.write(intra, key, b"v", 0, 0).unwrap().is_stored());
    }
    let stats = cache.page_stats().unwrap();
    assert_eq!(stats.free_slots, 0);

    // Every slot taken: the 90th key cannot land anywhere.
    let last = &keys[89];
    let (_, last_intra) = cache.hash(last);
    assert_eq!(
        cache.write(last_intra, last, b"v", 0, 0).unwrap(),
        WriteOutcome::NotStored
    );

    // Deleting one entry leaves a tombstone the write can take over.
    let (_, victim_intra) = cache.hash(&keys[0]);
    assert!(cache.delete(victim_intra, &keys[0]).unwrap().is_some());
    assert_eq!(cache.page_stats().unwrap().old_slots, 1);
    assert!(cache.write(last_intra, last, b"v", 0, 0).unwrap().is_stored());
    assert_eq!(cache.page_stats().unwrap().old_slots, 0);

    cache.verify_page().unwrap();
    cache.unlock().unwrap();
}

#[test]
fn iterator_visits_every_live_entry_once() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    let mut expected: Vec<Vec<u8>> = Vec::new();
    for i in 0..40 {
        let key = format!("iter-key-{i}").into_bytes();
        put(&mut cache, &key, &key);
        expected.push(key);
    }

    let mut seen: Vec<Vec<u8>> = Vec::new();
    let mut it = cache.iter().unwrap();
    while let Some(entry) = it.next_entry().unwrap() {
        assert_eq!(entry.key, entry.value);
        seen.push(entry.key.to_vec());
    }
    it.close().unwrap();

    seen.sort();
    expected.sort();
    assert_eq!(seen, expected);
    assert!(!cache.is_locked());
}

#[test]
fn iterator_skips_expired_entries() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    put(&mut cache, b"lasting", b"v");
    let (page, intra) = cache.hash(b"fleeting");
    cache.lock(page).unwrap();
    assert!(cache
        .write(intra, b"fleeting", b"v", 1, 0)
        .unwrap()
        .is_stored());
    cache.unlock().unwrap();

    std::thread::sleep(Duration::from_secs(2));

    let mut seen = Vec::new();
    let mut it = cache.iter().unwrap();
    while let Some(entry) = it.next_entry().unwrap() {
        seen.push(entry.key.to_vec());
    }
    drop(it);
    assert_eq!(seen, vec![b"lasting".to_vec()]);
}

#[test]
fn usage_errors_are_reported_and_recorded() {
    let dir = TempDir::new().unwrap();
    let mut cache = open(&dir);

    assert!(matches!(
        cache.read(0, b"k"),
        Err(CacheError::Usage(_))
    ));
    assert!(cache.last_error().is_some());

    assert!(matches!(cache.unlock(), Err(CacheError::Usage(_))));
    assert!(matches!(cache.lock(1000), Err(CacheError::Usage(_))));

    cache.lock(0).unwrap();
    assert!(matches!(cache.lock(1), Err(CacheError::Usage(_))));
    assert!(matches!(cache.iter().map(|_| ()), Err(CacheError::Usage(_))));
    cache.unlock().unwrap();
}

#[test]
fn contents_survive_reopen_but_not_geometry_change() {
    let dir = TempDir::new().unwrap();
    {
        let mut cache = open(&dir);
        put(&mut cache, b"durable", b"value");
    }
    {
        let mut cache = open(&dir);
        assert_eq!(get(&mut cache, b"durable").unwrap(), b"value");
    }
    {
        // Different page size, different file size: rebuilt from scratch.
        let mut cache = open_with(&dir, |o| o.page_size = 32768);
        assert!(get(&mut cache, b"durable").is_none());
    }
}

#[test]
fn corrupt_page_surfaces_and_reformat_recovers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.shm");
    let page;
    {
        let mut cache = open(&dir);
        put(&mut cache, b"x", b"v");
        page = cache.hash(b"x").0;
    }

    // Stomp the page's magic word.
    let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    f.seek(SeekFrom::Start(page as u64 * 65536)).unwrap();
    f.write_all(&[0xff; 8]).unwrap();
    drop(f);

    let mut cache = open(&dir);
    assert!(matches!(
        cache.lock(page),
        Err(CacheError::CorruptPage { .. })
    ));
    assert!(!cache.is_locked());

    cache.reformat_page(page).unwrap();
    cache.lock(page).unwrap();
    cache.verify_page().unwrap();
    assert!(cache.read(cache.hash(b"x").1, b"x").unwrap().is_none());
    cache.unlock().unwrap();
}

#[test]
fn test_file_reinitializes_only_the_bad_page() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.shm");

    let (bad_page, other_key) = {
        let mut cache = open(&dir);
        put(&mut cache, b"victim", b"v1");
        let bad_page = cache.hash(b"victim").0;
        // A second key on some other page.
        let mut i = 0;
        let other = loop {
            let k = format!("other-{i}").into_bytes();
            if cache.hash(&k).0 != bad_page {
                break k;
            }
            i += 1;
        };
        put(&mut cache, &other, b"v2");
        (bad_page, other)
    };

    let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    f.seek(SeekFrom::Start(bad_page as u64 * 65536)).unwrap();
    f.write_all(&[0xff; 8]).unwrap();
    drop(f);

    let mut cache = open_with(&dir, |o| o.test_file = true);
    assert!(get(&mut cache, b"victim").is_none());
    assert_eq!(get(&mut cache, &other_key).unwrap(), b"v2");
}

#[test]
fn stats_count_reads_and_hits() {
    let dir = TempDir::new().unwrap();
    let mut cache = open_with(&dir, |o| o.enable_stats = true);

    let (page, intra) = cache.hash(b"counted");
    cache.lock(page).unwrap();
    assert!(cache.write(intra, b"counted", b"v", 0, 0).unwrap().is_stored());
    assert!(cache.read(intra, b"counted").unwrap().is_some());
    assert!(cache.read(intra, b"counted").unwrap().is_some());
    assert!(cache.read(intra, b"no such key").unwrap().is_none());
    cache.unlock().unwrap();

    // Counters persist in the page header across lock cycles.
    cache.lock(page).unwrap();
    let stats = cache.page_stats().unwrap();
    assert_eq!(stats.n_reads, 3);
    assert_eq!(stats.n_read_hits, 2);

    cache.reset_page_stats().unwrap();
    cache.unlock().unwrap();
    cache.lock(page).unwrap();
    let stats = cache.page_stats().unwrap();
    assert_eq!(stats.n_reads, 0);
    assert_eq!(stats.n_read_hits, 0);
    cache.unlock().unwrap();
}

/// Write through the cache with an expunge-and-retry on `NotStored`, the way
/// a client wrapper would. Returns whether the value ended up stored.
fn store_with_retry(cache: &mut Cache, key: &[u8], val: &[u8]) -> bool {
    let (_, intra) = cache.hash(key);
    if cache.write(intra, key, val, 0, 0).unwrap().is_stored() {
        return true;
    }
    if let Some(plan) = cache
        .calc_expunge(ExpungeMode::MakeRoom, Some(key.len() + val.len()))
        .unwrap()
    {
        cache.do_expunge(plan).unwrap();
    }
    cache.write(intra, key, val, 0, 0).unwrap().is_stored()
}

#[test]
fn randomized_ops_match_model_and_keep_pages_valid() {
    let dir = TempDir::new().unwrap();
    // Small geometry so eviction pressure is real.
    let mut cache = open_with(&dir, |o| {
        o.num_pages = 3;
        o.page_size = 4096;
    });

    let keys: Vec<Vec<u8>> = (0..150).map(|i| format!("key-{i}").into_bytes()).collect();
    let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    let mut rng = rand::thread_rng();

    for _ in 0..2500 {
        let key = &keys[rng.gen_range(0..keys.len())];
        let (page, intra) = cache.hash(key);
        cache.lock(page).unwrap();
        match rng.gen_range(0..10) {
            0..=4 => {
                let val: Vec<u8> = (0..rng.gen_range(0..120)).map(|_| rng.gen()).collect();
                if store_with_retry(&mut cache, key, &val) {
                    model.insert(key.clone(), val);
                } else {
                    model.remove(key);
                }
            }
            5..=8 => {
                if let Some((val, _)) = cache.read(intra, key).unwrap() {
                    // A hit must return the last stored value; misses are
                    // fine (the cache is lossy).
                    assert_eq!(Some(&val.to_vec()), model.get(key));
                }
            }
            _ => {
                cache.delete(intra, key).unwrap();
                model.remove(key);
            }
        }
        cache.unlock().unwrap();
    }

    for page in 0..3 {
        cache.lock(page).unwrap();
        cache.verify_page().unwrap();
        cache.unlock().unwrap();
    }
}

#[test]
fn threads_sharing_a_handle_stay_consistent() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(parking_lot::Mutex::new(open(&dir)));

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let cache = Arc::clone(&cache);
        handles.push(std::thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for i in 0..300u64 {
                let key = format!("t-{}", (t * 31 + i * 7) % 50).into_bytes();
                let mut cache = cache.lock();
                let (page, intra) = cache.hash(&key);
                cache.lock(page).unwrap();
                if rng.gen_bool(0.5) {
                    let _ = cache.read(intra, &key).unwrap();
                } else {
                    store_with_retry(&mut cache, &key, b"shared value");
                }
                cache.unlock().unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let mut cache = cache.lock();
    for page in 0..89 {
        cache.lock(page).unwrap();
        cache.verify_page().unwrap();
        cache.unlock().unwrap();
    }
}
