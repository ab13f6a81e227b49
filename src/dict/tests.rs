use super::*;
use std::collections::HashSet;

#[derive(Clone, Copy, Default)]
struct ConstBuildHasher;
struct ConstHasher;
impl BuildHasher for ConstBuildHasher {
    type Hasher = ConstHasher;
    fn build_hasher(&self) -> Self::Hasher {
        ConstHasher
    }
}
impl core::hash::Hasher for ConstHasher {
    fn write(&mut self, _bytes: &[u8]) {}
    fn finish(&self) -> u64 {
        0
    } // force all keys into the same bucket
}

/// Records hook calls and vetoes resizes on demand.
struct Recorder {
    hasher: RandomState,
    allow: bool,
    bucket_total: i64,
    started: usize,
    completed: usize,
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            hasher: RandomState::new(),
            allow: true,
            bucket_total: 0,
            started: 0,
            completed: 0,
        }
    }
}

impl DictType for Recorder {
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        self.hasher.hash_one(key)
    }
    fn resize_allowed(&self, _more_mem: usize, _used_ratio: f64) -> bool {
        self.allow
    }
    fn rehashing_started(&mut self, _from: usize, _to: usize) {
        self.started += 1;
    }
    fn rehashing_completed(&mut self, _from: usize, _to: usize) {
        self.completed += 1;
    }
    fn bucket_count_changed(&mut self, delta: i64) {
        self.bucket_total += delta;
    }
}

fn filled(n: u64) -> Dict<u64, u64> {
    let mut d = Dict::new();
    for i in 0..n {
        d.add(i, i * 10).unwrap();
    }
    d
}

/// Invariant: add/find/delete agree; a duplicate add is rejected and hands
/// back the pair without touching the stored value.
#[test]
fn add_find_delete_and_duplicate() {
    let mut d: Dict<String, i32> = Dict::new();
    let h = d.add("a".to_string(), 1).unwrap();
    assert_eq!(d.len(), 1);
    assert_eq!(h.value(&d), Some(&1));

    let occ = d.add("a".to_string(), 2).unwrap_err();
    assert_eq!(occ.existing, h);
    assert_eq!(occ.key, "a");
    assert_eq!(occ.value, 2);
    assert_eq!(d.get("a"), Some(&1));

    assert_eq!(d.find("a"), Some(h));
    assert_eq!(d.delete("a"), Some(("a".to_string(), 1)));
    assert!(d.find("a").is_none());
    assert!(d.delete("a").is_none());
    assert!(d.is_empty());
}

/// Invariant: a set is a table of unit values; its entries are no larger
/// than the key and chain bookkeeping, and it goes through the same paths.
#[test]
fn unit_valued_set() {
    assert!(
        std::mem::size_of::<Entry<u64, ()>>() + std::mem::size_of::<u64>()
            <= std::mem::size_of::<Entry<u64, u64>>()
    );
    let mut d: Dict<Vec<u8>, ()> = Dict::new();
    for i in 0..300u32 {
        d.add(i.to_le_bytes().to_vec(), ()).unwrap();
    }
    assert!(d.add(7u32.to_le_bytes().to_vec(), ()).is_err());
    assert!(d.contains_key(&5u32.to_le_bytes()[..]));
    assert_eq!(d.delete(&5u32.to_le_bytes()[..]), Some((5u32.to_le_bytes().to_vec(), ())));
    assert!(!d.rehash_to_completion());
    assert_eq!(d.len(), 299);
}

/// Invariant: every inserted key stays reachable through an incremental
/// rehash, whichever table it currently lives in.
#[test]
fn keys_reachable_while_rehashing() {
    let mut d: Dict<u64, u64> = Dict::new();
    let mut saw_rehash = false;
    for i in 0..500 {
        d.add(i, i).unwrap();
        saw_rehash |= d.is_rehashing();
        for j in (0..=i).step_by(7) {
            assert_eq!(d.get(&j), Some(&j), "key {j} lost after inserting {i}");
        }
    }
    assert!(saw_rehash);
    assert!(!d.rehash_to_completion());
    assert_eq!(d.len(), 500);
    assert!(d.buckets().is_power_of_two());
}

/// Invariant: the first allocation is INITIAL_SIZE and the fifth insert
/// starts an incremental grow to 8 buckets.
#[test]
fn grows_from_initial_size() {
    let mut d = filled(4);
    assert_eq!(d.buckets(), INITIAL_SIZE);
    assert!(!d.is_rehashing());
    d.add(4, 40).unwrap();
    assert_eq!(d.rehashing_info(), Some((4, 8)));
    assert!(!d.rehash_to_completion());
    assert_eq!(d.buckets(), 8);
    for i in 0..5 {
        assert_eq!(d.get(&i), Some(&(i * 10)));
    }
}

/// Invariant: expand on an unallocated dict completes immediately; no-op
/// and too-small requests are refused without side effects.
#[test]
fn expand_rules() {
    let mut d: Dict<u64, u64> = Dict::new();
    d.expand(100).unwrap();
    assert_eq!(d.buckets(), 128);
    assert!(!d.is_rehashing());
    assert_eq!(
        d.expand(100),
        Err(DictError::Unchanged {
            requested: 100,
            buckets: 128
        })
    );

    let mut d = filled(5);
    assert!(d.is_rehashing());
    assert_eq!(d.expand(1024), Err(DictError::Rehashing));
    d.rehash_to_completion();
    assert_eq!(
        d.expand(2),
        Err(DictError::InvalidSize {
            requested: 2,
            used: 5
        })
    );
    assert!(d.try_expand(1000).is_ok());
    assert_eq!(d.rehashing_info(), Some((8, 1024)));
}

/// Invariant: an impossible allocation is reported, not attempted.
#[test]
fn try_expand_reports_alloc_failure() {
    let mut d: Dict<u64, u64> = Dict::new();
    assert!(matches!(
        d.try_expand(usize::MAX),
        Err(DictError::AllocFailed { .. })
    ));
    assert_eq!(d.buckets(), 0);
}

/// Invariant: an explicit shrink rehashes into the smaller table and keeps
/// every key.
#[test]
fn shrink_keeps_keys() {
    let mut d: Dict<u64, u64> = Dict::new();
    d.expand(64).unwrap();
    for i in 0..4 {
        d.add(i, i).unwrap();
    }
    assert_eq!(
        d.shrink(2),
        Err(DictError::InvalidSize {
            requested: 2,
            used: 4
        })
    );
    d.shrink(4).unwrap();
    assert_eq!(d.rehashing_info(), Some((64, 4)));
    d.rehash_to_completion();
    assert_eq!(d.buckets(), 4);
    for i in 0..4 {
        assert_eq!(d.get(&i), Some(&i));
    }
}

/// Invariant: deleting most keys shrinks the table automatically.
#[test]
fn auto_shrink_after_deletes() {
    let mut d = filled(256);
    d.rehash_to_completion();
    let grown = d.buckets();
    for i in 0..250 {
        assert!(d.delete(&i).is_some());
    }
    d.rehash_to_completion();
    assert!(d.buckets() < grown);
    for i in 250..256 {
        assert_eq!(d.get(&i), Some(&(i * 10)));
    }
}

/// Invariant: a vetoed resize leaves the table as is and lookups keep
/// working on the overloaded table.
#[test]
fn resize_veto_is_respected() {
    let mut d: Dict<u64, u64, Recorder> = Dict::with_type(Recorder::default());
    d.add(0, 0).unwrap();
    d.dict_type_mut().allow = false;
    for i in 1..40 {
        d.add(i, i).unwrap();
    }
    assert_eq!(d.buckets(), INITIAL_SIZE);
    assert!(!d.is_rehashing());
    for i in 0..40 {
        assert_eq!(d.get(&i), Some(&i));
    }
    d.dict_type_mut().allow = true;
    d.add(40, 40).unwrap();
    assert!(d.is_rehashing());
}

/// Invariant: Forbid never resizes; Avoid resizes only past the forced ratio.
#[test]
fn resize_policies() {
    let mut d: Dict<u64, u64> = Dict::new();
    d.set_resize_policy(ResizePolicy::Forbid);
    for i in 0..40 {
        d.add(i, i).unwrap();
    }
    assert_eq!(d.buckets(), INITIAL_SIZE);

    let mut d: Dict<u64, u64> = Dict::new();
    d.set_resize_policy(ResizePolicy::Avoid);
    for i in 0..16 {
        d.add(i, i).unwrap();
    }
    assert_eq!(d.buckets(), INITIAL_SIZE);
    assert!(!d.is_rehashing());
    d.add(16, 16).unwrap();
    assert_eq!(d.rehashing_info(), Some((4, 32)));
}

/// Invariant: under Avoid, a rehash below the forced ratio does not
/// progress; switching back to Enable lets it finish.
#[test]
fn avoid_blocks_mild_rehash() {
    let mut d = filled(5);
    assert_eq!(d.rehashing_info(), Some((4, 8)));
    d.set_resize_policy(ResizePolicy::Avoid);
    assert!(d.rehash(10));
    assert_eq!(d.rehash_microseconds(1000), 0);
    assert!(d.rehash_to_completion());
    assert_eq!(d.rehashing_info(), Some((4, 8)));
    d.set_resize_policy(ResizePolicy::Enable);
    assert!(!d.rehash_to_completion());
    assert_eq!(d.buckets(), 8);
}

/// Invariant: rehash_microseconds does nothing when no rehash is pending,
/// and finishes a pending one given enough budget.
#[test]
fn rehash_microseconds_idempotent() {
    let mut d = filled(3);
    assert_eq!(d.rehash_microseconds(1000), 0);
    let mut d = filled(5);
    d.rehash_microseconds(1_000_000);
    assert!(!d.is_rehashing());
    let before = d.buckets();
    assert_eq!(d.rehash_microseconds(1000), 0);
    assert_eq!(d.buckets(), before);
}

/// Invariant: a paused rehash is not advanced by lookups or timed steps.
#[test]
fn paused_rehash_does_not_progress() {
    let mut d = filled(5);
    d.pause_rehashing();
    assert!(d.is_rehashing_paused());
    for i in 0..5 {
        assert!(d.find(&i).is_some());
    }
    assert_eq!(d.rehash_microseconds(1000), 0);
    assert_eq!(d.rehashing_info(), Some((4, 8)));
    d.resume_rehashing();
    assert!(!d.rehash_to_completion());
}

/// Invariant: with auto-resize paused the table only gets its first
/// allocation; resuming re-enables growth on the next insert.
#[test]
fn pause_auto_resize_defers_growth() {
    let mut d: Dict<u64, u64> = Dict::new();
    d.pause_auto_resize();
    for i in 0..64 {
        d.add(i, i).unwrap();
    }
    assert_eq!(d.buckets(), INITIAL_SIZE);
    assert_eq!(d.len(), 64);
    d.resume_auto_resize();
    d.add(64, 64).unwrap();
    assert!(d.is_rehashing());
}

/// Invariant: an unlinked entry is invisible to lookups but readable via
/// its handle until freed.
#[test]
fn unlink_then_free() {
    let mut d = filled(10);
    let h = d.unlink(&3).unwrap();
    assert!(d.get(&3).is_none());
    assert_eq!(d.len(), 9);
    assert_eq!(d.unlinked_len(), 1);
    assert_eq!(h.key(&d), Some(&3));
    assert_eq!(h.value(&d), Some(&30));
    assert_eq!(d.free_unlinked(h), Some((3, 30)));
    assert_eq!(d.unlinked_len(), 0);
    assert!(h.key(&d).is_none());
    assert!(d.free_unlinked(h).is_none());
}

#[test]
#[should_panic(expected = "free_unlinked called on a linked entry")]
fn free_linked_entry_panics() {
    let mut d = filled(2);
    let h = d.find(&1).unwrap();
    d.free_unlinked(h);
}

/// Invariant: replace reports insert vs overwrite and stores the new value.
#[test]
fn replace_and_add_raw() {
    let mut d: Dict<u64, String> = Dict::new();
    assert!(d.replace(1, "a".into()));
    assert!(!d.replace(1, "b".into()));
    assert_eq!(d.get(&1).map(String::as_str), Some("b"));

    let mut called = false;
    let r = d.add_raw(1, || {
        called = true;
        "c".into()
    });
    assert!(!r.is_inserted());
    assert!(!called);
    let r = d.add_raw(2, || "d".into());
    assert!(r.is_inserted());
    assert_eq!(r.handle().value(&d).map(String::as_str), Some("d"));
    let h = d.add_or_find(2, || unreachable!());
    assert_eq!(h, r.handle());
}

/// Invariant: set_value and set_key swap in place and return the old data.
#[test]
fn set_value_and_key() {
    let mut d: Dict<String, u64> = Dict::new();
    let h = d.add("k".to_string(), 1).unwrap();
    assert_eq!(d.set_value(h, 2), Some(1));
    assert_eq!(d.get("k"), Some(&2));
    let old = d.set_key(h, String::from("k")).unwrap();
    assert_eq!(old, "k");
    assert_eq!(d.get("k"), Some(&2));
}

#[test]
#[should_panic(expected = "set_key must not change key identity")]
fn set_key_rejects_different_key() {
    let mut d: Dict<String, u64> = Dict::new();
    let h = d.add("k".to_string(), 1).unwrap();
    d.set_key(h, "other".to_string());
}

/// Invariant: all keys in one bucket still resolve individually.
#[test]
fn full_collision_chain() {
    let mut d: Dict<String, usize, DefaultType<ConstBuildHasher>> =
        Dict::with_type(DefaultType::with_hasher(ConstBuildHasher));
    for i in 0..50 {
        d.add(format!("k{i}"), i).unwrap();
    }
    d.rehash_to_completion();
    for i in (0..50).step_by(2) {
        assert_eq!(d.delete(format!("k{i}").as_str()), Some((format!("k{i}"), i)));
    }
    for i in 0..50 {
        let expect = if i % 2 == 0 { None } else { Some(&i) };
        assert_eq!(d.get(format!("k{i}").as_str()), expect);
    }
    d.rehash_to_completion();
    let s = d.stats(true);
    assert_eq!(s.main.non_empty_buckets, 1);
    assert_eq!(s.main.max_chain_len, 25);
}

/// Invariant: a safe iterator tolerates deleting the entry it just
/// returned and visits every entry exactly once.
#[test]
fn safe_iter_allows_deletes() {
    let mut d = filled(100);
    let mut it = d.safe_iter();
    let mut seen = Vec::new();
    while let Some(h) = it.next(&d) {
        let k = *h.key(&d).unwrap();
        seen.push(k);
        d.delete(&k).unwrap();
    }
    it.release(&mut d);
    assert!(!d.is_rehashing_paused());
    seen.sort_unstable();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
    assert!(d.is_empty());
}

/// Invariant: an unsafe iterator over an untouched dict releases cleanly.
#[test]
fn unsafe_iter_read_only() {
    let mut d = filled(20);
    d.rehash_to_completion();
    let mut it = d.unsafe_iter();
    let mut n = 0;
    while it.next(&d).is_some() {
        n += 1;
    }
    it.release(&d);
    assert_eq!(n, 20);
}

#[test]
#[should_panic(expected = "dict mutated during unsafe iteration")]
fn unsafe_iter_detects_mutation() {
    let mut d = filled(20);
    let mut it = d.unsafe_iter();
    it.next(&d);
    d.add(1000, 0).unwrap();
    it.release(&d);
}

#[test]
#[should_panic(expected = "SafeIter dropped without release")]
fn safe_iter_must_be_released() {
    let mut d = filled(3);
    let _it = d.safe_iter();
}

/// Invariant: borrowing iterators yield only linked entries.
#[test]
fn borrowing_iterators() {
    let mut d = filled(10);
    let h = d.unlink(&0).unwrap();
    assert_eq!(d.iter().count(), 9);
    for (_, _, v) in d.iter_mut() {
        *v += 1;
    }
    assert_eq!(d.get(&5), Some(&51));
    let mut keys: Vec<u64> = d.keys().copied().collect();
    keys.sort_unstable();
    assert_eq!(keys, (1..10).collect::<Vec<_>>());
    d.free_unlinked(h);
}

/// Invariant: a full scan reports every key present for its whole
/// duration, even while the table grows underneath it.
#[test]
fn scan_survives_growth() {
    let mut d = filled(1000);
    let mut seen = HashSet::new();
    let mut cursor = 0;
    let mut calls = 0u64;
    let mut next_key = 1000;
    loop {
        cursor = d.scan(cursor, |k, _| {
            seen.insert(*k);
        });
        calls += 1;
        if calls % 50 == 0 && next_key < 5000 {
            for _ in 0..200 {
                d.add(next_key, 0).unwrap();
                next_key += 1;
            }
        }
        if cursor == 0 {
            break;
        }
        assert!(calls < 1_000_000, "scan did not terminate");
    }
    for i in 0..1000 {
        assert!(seen.contains(&i), "scan missed {i}");
    }
}

/// Invariant: a scan that spans a shrink still reports surviving keys.
#[test]
fn scan_survives_shrink() {
    let mut d = filled(2000);
    d.rehash_to_completion();
    let mut seen = HashSet::new();
    let mut cursor = 0;
    let mut calls = 0;
    let mut deleted = 0u64;
    loop {
        cursor = d.scan(cursor, |k, _| {
            seen.insert(*k);
        });
        calls += 1;
        if calls % 20 == 0 && deleted < 1900 {
            for _ in 0..100 {
                d.delete(&(1999 - deleted)).unwrap();
                deleted += 1;
            }
        }
        if cursor == 0 {
            break;
        }
    }
    for i in 0..100 {
        assert!(seen.contains(&i), "scan missed {i}");
    }
}

#[test]
fn scan_empty_returns_zero() {
    let mut d: Dict<u64, u64> = Dict::new();
    assert_eq!(d.scan(0, |_, _| panic!("no entries")), 0);
    assert_eq!(d.scan(12345, |_, _| panic!("no entries")), 0);
}

struct CountingDefrag {
    keys: usize,
    vals: usize,
    visited: usize,
}

impl DictDefragFns<u64, Vec<u8>> for CountingDefrag {
    fn defrag_key(&mut self, _key: &mut u64) {
        self.keys += 1;
    }
    fn defrag_val(&mut self, val: &mut Vec<u8>) {
        self.vals += 1;
        *val = val.clone();
    }
    fn visit(&mut self, _key: &u64, _val: &mut Vec<u8>) {
        self.visited += 1;
    }
}

/// Invariant: scan_defrag offers every entry to the hooks and the values
/// survive relocation.
#[test]
fn scan_defrag_visits_all() {
    let mut d: Dict<u64, Vec<u8>> = Dict::new();
    for i in 0..300u64 {
        d.add(i, vec![i as u8; 8]).unwrap();
    }
    d.rehash_to_completion();
    let mut fns = CountingDefrag {
        keys: 0,
        vals: 0,
        visited: 0,
    };
    let mut cursor = 0;
    loop {
        cursor = d.scan_defrag(cursor, &mut fns);
        if cursor == 0 {
            break;
        }
    }
    assert_eq!(fns.visited, 300);
    assert_eq!(fns.keys, 300);
    assert_eq!(fns.vals, 300);
    assert_eq!(d.get(&7), Some(&vec![7u8; 8]));
}

/// Invariant: moving bucket arrays changes the fingerprint but not content.
#[test]
fn defrag_tables_moves_arrays() {
    let mut d = filled(50);
    d.rehash_to_completion();
    let before = d.fingerprint();
    assert_eq!(d.defrag_tables(|_| true), 1);
    assert_ne!(d.fingerprint(), before);
    assert_eq!(d.defrag_tables(|_| false), 0);
    for i in 0..50 {
        assert_eq!(d.get(&i), Some(&(i * 10)));
    }
}

/// Invariant: random sampling returns live entries, or nothing when empty.
#[test]
fn random_sampling() {
    let mut d: Dict<u64, u64> = Dict::new();
    assert!(d.random_key().is_none());
    assert!(d.fair_random_key().is_none());
    assert!(d.some_keys(5).is_empty());

    let mut d = filled(100);
    for _ in 0..50 {
        let h = d.random_key().unwrap();
        assert!(*h.key(&d).unwrap() < 100);
        let h = d.fair_random_key().unwrap();
        assert!(*h.key(&d).unwrap() < 100);
    }
    let sample = d.some_keys(10);
    assert!(sample.len() <= 10);
    for h in sample {
        assert!(h.key(&d).is_some());
    }
    assert!(d.some_keys(1000).len() <= 100);
}

/// Invariant: hook notifications account for every allocated bucket and
/// pair up started/completed.
#[test]
fn hooks_track_buckets() {
    let mut d: Dict<u64, u64, Recorder> = Dict::with_type(Recorder::default());
    for i in 0..300 {
        d.add(i, i).unwrap();
        assert_eq!(d.dict_type().bucket_total, d.buckets() as i64);
    }
    d.rehash_to_completion();
    assert_eq!(d.dict_type().started, d.dict_type().completed);
    for i in 0..300 {
        d.delete(&i);
        assert_eq!(d.dict_type().bucket_total, d.buckets() as i64);
    }
    d.clear();
    assert_eq!(d.dict_type().bucket_total, 0);
    assert_eq!(d.dict_type().started, d.dict_type().completed);
}

/// Invariant: empty frees everything and calls back at least once for a
/// non-empty table.
#[test]
fn empty_with_callback() {
    let mut d = filled(5);
    assert!(d.is_rehashing());
    d.pause_rehashing();
    let mut calls = 0;
    d.empty(|| calls += 1);
    assert!(calls >= 1);
    assert!(d.is_empty());
    assert_eq!(d.buckets(), 0);
    assert!(!d.is_rehashing());
    assert!(!d.is_rehashing_paused());
    d.add(1, 1).unwrap();
    assert_eq!(d.get(&1), Some(&1));
}

/// Invariant: stats report table shape; the summary omits chain details.
#[test]
fn stats_report() {
    let d: Dict<u64, u64> = Dict::new();
    assert_eq!(
        d.stats(false).to_string(),
        "No stats available for empty dictionaries\n"
    );

    let mut d = filled(3);
    let s = d.stats(false);
    assert_eq!(s.main.buckets, 4);
    assert_eq!(s.main.used, 3);
    assert!(s.rehashing.is_none());
    assert!(!s.to_string().contains("max chain length"));

    let full = d.stats(true);
    assert_eq!(full.main.chain_len_histogram.iter().sum::<usize>(), 4);
    let text = full.to_string();
    assert!(text.starts_with("Hash table 0 stats (main hash table):"));
    assert!(text.contains(" number of elements: 3"));
    assert!(text.contains("Chain length distribution"));

    d.add(3, 0).unwrap();
    d.add(4, 0).unwrap();
    let s = d.stats(false);
    assert!(s.rehashing.is_some());
    assert!(s.to_string().contains("rehashing target"));
    assert!(d.mem_usage() > 0);
}

/// Invariant: degenerate ratios are rejected by validation.
#[test]
fn config_validation() {
    assert!(DictConfig::default().validate().is_ok());
    let bad = DictConfig {
        min_fill: 1,
        ..DictConfig::default()
    };
    assert!(bad.validate().is_err());
    let bad = DictConfig {
        force_resize_ratio: 0,
        ..DictConfig::default()
    };
    assert_eq!(
        bad.validate().unwrap_err().message(),
        "force_resize_ratio must be at least 2"
    );
}
