#![cfg(test)]

// Property tests for Dict kept inside the crate so they can reach the
// table internals when a check fails.

use crate::dict::{Dict, ResizePolicy};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

// Pool-indexed operations: indices shrink towards earlier keys.
#[derive(Clone, Debug)]
enum Op {
    Add(usize, i32),
    Replace(usize, i32),
    Delete(usize),
    UnlinkFree(usize),
    Find(usize),
    Rehash(usize),
    Expand(usize),
    Policy(u8),
    FullScan,
}

fn arb_scenario() -> impl Strategy<Value = (Vec<u32>, Vec<Op>)> {
    proptest::collection::vec(any::<u32>(), 1..=64).prop_flat_map(|pool| {
        let idx = 0..pool.len();
        let op = prop_oneof![
            4 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Add(i, v)),
            2 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Replace(i, v)),
            2 => idx.clone().prop_map(Op::Delete),
            1 => idx.clone().prop_map(Op::UnlinkFree),
            2 => idx.clone().prop_map(Op::Find),
            1 => (0usize..8).prop_map(Op::Rehash),
            1 => (0usize..256).prop_map(Op::Expand),
            1 => (0u8..3).prop_map(Op::Policy),
            1 => Just(Op::FullScan),
        ];
        proptest::collection::vec(op, 1..200).prop_map(move |ops| (pool.clone(), ops))
    })
}

// Property: state-machine equivalence against std::collections::HashMap.
// - add rejects duplicates and never overwrites; replace always stores.
// - delete and unlink+free return the model's pair.
// - A full scan reports every live key.
// - Bucket counts stay powers of two and the table never loses an entry,
//   under any resize policy and any interleaving of explicit rehash steps.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        let mut sut: Dict<u32, i32> = Dict::new();
        let mut model: HashMap<u32, i32> = HashMap::new();

        for op in ops {
            match op {
                Op::Add(i, v) => {
                    let k = pool[i];
                    let res = sut.add(k, v);
                    if let std::collections::hash_map::Entry::Vacant(e) = model.entry(k) {
                        prop_assert!(res.is_ok());
                        e.insert(v);
                    } else {
                        let occ = res.unwrap_err();
                        prop_assert_eq!(occ.key, k);
                        prop_assert_eq!(occ.existing.value(&sut), model.get(&k));
                    }
                }
                Op::Replace(i, v) => {
                    let k = pool[i];
                    let inserted = sut.replace(k, v);
                    prop_assert_eq!(inserted, model.insert(k, v).is_none());
                }
                Op::Delete(i) => {
                    let k = pool[i];
                    prop_assert_eq!(sut.delete(&k), model.remove(&k).map(|v| (k, v)));
                }
                Op::UnlinkFree(i) => {
                    let k = pool[i];
                    match sut.unlink(&k) {
                        Some(h) => {
                            prop_assert!(!sut.contains_key(&k));
                            let pair = sut.free_unlinked(h);
                            prop_assert_eq!(pair, model.remove(&k).map(|v| (k, v)));
                        }
                        None => prop_assert!(!model.contains_key(&k)),
                    }
                }
                Op::Find(i) => {
                    let k = pool[i];
                    let h = sut.find(&k);
                    prop_assert_eq!(h.and_then(|h| h.value(&sut)), model.get(&k));
                }
                Op::Rehash(n) => {
                    sut.rehash(n);
                }
                Op::Expand(n) => {
                    // Refusals are fine; the table must stay intact either way.
                    let _ = sut.expand(n);
                }
                Op::Policy(p) => {
                    sut.set_resize_policy(match p {
                        0 => ResizePolicy::Enable,
                        1 => ResizePolicy::Avoid,
                        _ => ResizePolicy::Forbid,
                    });
                }
                Op::FullScan => {
                    let mut seen = HashSet::new();
                    let mut cursor = 0;
                    loop {
                        cursor = sut.scan(cursor, |k, _| {
                            seen.insert(*k);
                        });
                        if cursor == 0 {
                            break;
                        }
                    }
                    let expect: HashSet<u32> = model.keys().copied().collect();
                    prop_assert_eq!(seen, expect);
                }
            }

            prop_assert_eq!(sut.len(), model.len());
            prop_assert_eq!(sut.is_empty(), model.is_empty());
            for (k, v) in &model {
                prop_assert_eq!(sut.get(k), Some(v));
            }
            if let Some((from, to)) = sut.rehashing_info() {
                prop_assert!(from.is_power_of_two() || from == 0);
                prop_assert!(to.is_power_of_two());
            } else if sut.buckets() > 0 {
                prop_assert!(sut.buckets().is_power_of_two());
            }
        }

        sut.set_resize_policy(ResizePolicy::Enable);
        prop_assert!(!sut.rehash_to_completion());
        let mut keys: Vec<u32> = sut.keys().copied().collect();
        keys.sort_unstable();
        let mut expect: Vec<u32> = model.keys().copied().collect();
        expect.sort_unstable();
        prop_assert_eq!(keys, expect);
    }
}
