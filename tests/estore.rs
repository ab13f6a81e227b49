// Estore integration tests.
//
// Items live in a caller-owned table and carry their own ExpireMeta; the
// estore only indexes ids by time. Invariants exercised:
// - Meta consistency: an item is tracked iff the estore indexes it, and its
//   meta time equals the indexed time, across add/update/remove/sweep.
// - Sweep contract: Remove deletes, Update reschedules, Stop ends the sweep
//   and leaves the item due.
// - Boundary: only times strictly before `now` are due.
use rehashkv::ebuckets::EXPIRE_TIME_MAX;
use rehashkv::{EItem, Estore, ExpireAction, ExpireInfo, ExpireMeta};
use std::collections::HashMap;

#[derive(Debug)]
struct Session {
    id: u32,
    renewals: u32,
    meta: ExpireMeta,
}

impl Session {
    fn new(id: u32, renewals: u32) -> Self {
        Self {
            id,
            renewals,
            meta: ExpireMeta::new(),
        }
    }
}

impl EItem for Session {
    type Id = u32;

    fn id(&self) -> u32 {
        self.id
    }

    fn expire_meta(&self) -> &ExpireMeta {
        &self.meta
    }

    fn expire_meta_mut(&mut self) -> &mut ExpireMeta {
        &mut self.meta
    }
}

fn bucket_of(id: u32) -> usize {
    (id % 4) as usize
}

/// Sweeps every non-empty bucket once, renewing sessions that still have
/// renewals left and deleting the rest.
fn sweep(es: &mut Estore<Session>, table: &mut HashMap<u32, Session>, now: u64) -> usize {
    let mut expired = 0;
    let mut cur = es.first_non_empty_bucket();
    while let Some(eidx) = cur {
        let mut info = ExpireInfo::new(now, 1000);
        es.active_expire(eidx, &mut info, |id| {
            let Some(s) = table.get_mut(id) else {
                return ExpireAction::Remove;
            };
            if s.renewals > 0 {
                s.renewals -= 1;
                let when = now + 100;
                s.meta.reschedule(when);
                ExpireAction::Update(when)
            } else {
                table.remove(id);
                ExpireAction::Remove
            }
        });
        expired += info.items_expired;
        cur = es.next_non_empty_bucket(eidx);
    }
    expired
}

fn assert_consistent(es: &Estore<Session>, table: &HashMap<u32, Session>) {
    let mut indexed = HashMap::new();
    for eidx in 0..es.num_buckets() {
        for (when, id) in es.bucket(eidx).iter() {
            assert_eq!(bucket_of(*id) % es.num_buckets(), eidx);
            assert!(indexed.insert(*id, when).is_none(), "id {id} indexed twice");
        }
    }
    let tracked = table.values().filter(|s| s.meta.is_tracked()).count();
    assert_eq!(indexed.len(), tracked);
    assert_eq!(es.len(), tracked);
    for s in table.values() {
        assert_eq!(s.meta.when(), indexed.get(&s.id).copied());
    }
}

// Test: a renewal workload.
// Verifies: Update keeps items alive and rescheduled, Remove drops them,
// and the index and metas agree after every sweep.
#[test]
fn renewals_then_expiry() {
    let mut es: Estore<Session> = Estore::new(2);
    let mut table = HashMap::new();
    for id in 0..40u32 {
        let mut s = Session::new(id, id % 3);
        es.add(bucket_of(id), &mut s, 1000 + id as u64).unwrap();
        table.insert(id, s);
    }
    assert_consistent(&es, &table);
    assert_eq!(es.min_expire_time(), Some(1000));

    let mut now = 2000;
    let mut rounds = 0;
    while !es.is_empty() {
        sweep(&mut es, &mut table, now);
        assert_consistent(&es, &table);
        now += 200;
        rounds += 1;
        assert!(rounds <= 4);
    }
    assert!(table.is_empty());
    assert_eq!(es.first_non_empty_bucket(), None);
    assert_eq!(es.min_expire_time(), None);
}

// Test: strict boundary across buckets.
// Verifies: times 1023 and 2047 are due at now=2048, 2048 and 4095 are not.
#[test]
fn due_is_strictly_before_now() {
    let mut es: Estore<Session> = Estore::new(2);
    let mut table = HashMap::new();
    for (id, when) in [(1u32, 1023u64), (2, 2047), (3, 2048), (4, 4095)] {
        let mut s = Session::new(id, 0);
        es.add(bucket_of(id), &mut s, when).unwrap();
        table.insert(id, s);
    }
    assert_eq!(sweep(&mut es, &mut table, 2048), 2);
    let mut left: Vec<u32> = table.keys().copied().collect();
    left.sort_unstable();
    assert_eq!(left, [3, 4]);
    assert_eq!(es.min_expire_time(), Some(2048));
    assert_consistent(&es, &table);
}

// Test: Stop leaves the item due.
// Verifies: a stopped sweep processes nothing further and the stopped item
// is still indexed at its old time.
#[test]
fn stop_keeps_item() {
    let mut es: Estore<Session> = Estore::new(0);
    let mut table = HashMap::new();
    for id in 0..5u32 {
        let mut s = Session::new(id, 0);
        es.add(0, &mut s, 10 + id as u64).unwrap();
        table.insert(id, s);
    }
    let mut info = ExpireInfo::new(100, 10);
    let mut calls = 0;
    es.active_expire(0, &mut info, |id| {
        calls += 1;
        if calls == 3 {
            return ExpireAction::Stop;
        }
        table.remove(id);
        ExpireAction::Remove
    });
    assert_eq!(info.items_expired, 2);
    assert_eq!(es.len(), 3);
    assert_eq!(info.next_expire_time, Some(12));
    assert_consistent(&es, &table);
}

// Test: defrag walk of every bucket.
// Verifies: defrag_bucket offers each indexed id once across resumed calls
// and leaves counts untouched.
#[test]
fn defrag_bucket_offers_every_id() {
    let mut es: Estore<Session> = Estore::new(1);
    let mut table = HashMap::new();
    for id in 0..300u32 {
        let mut s = Session::new(id, 0);
        es.add((id % 2) as usize, &mut s, 5000 + (id / 2) as u64).unwrap();
        table.insert(id, s);
    }
    let mut offered = Vec::new();
    for eidx in 0..es.num_buckets() {
        let mut cursor = 0;
        loop {
            cursor = es.defrag_bucket(eidx, cursor, 16, |id| offered.push(*id));
            if cursor == 0 {
                break;
            }
        }
    }
    offered.sort_unstable();
    assert_eq!(offered, (0..300).collect::<Vec<_>>());
    assert_eq!(es.len(), 300);
    assert_eq!(es.bucket_len(0), 150);
}

// Test: renewal past the largest storable time.
// Verifies: the meta records the clamped time the index stores, so the item
// is still found and removed afterwards.
#[test]
fn renewal_past_time_bound_stays_removable() {
    let mut es: Estore<Session> = Estore::new(1);
    let mut s = Session::new(7, 1);
    es.add(bucket_of(7) % es.num_buckets(), &mut s, 10).unwrap();
    let eidx = es.first_non_empty_bucket().unwrap();
    let mut info = ExpireInfo::new(100, 10);
    es.active_expire(eidx, &mut info, |_| {
        s.meta.reschedule(EXPIRE_TIME_MAX + 5);
        ExpireAction::Update(EXPIRE_TIME_MAX + 5)
    });
    assert_eq!(s.meta.when(), Some(EXPIRE_TIME_MAX));
    assert_eq!(es.min_expire_time(), Some(EXPIRE_TIME_MAX));
    assert_eq!(es.remove(eidx, &mut s), Some(EXPIRE_TIME_MAX));
    assert_eq!(es.len(), 0);
    assert!(!s.meta.is_tracked());
}
