//! EBuckets: items ordered by expiration time.
//!
//! Items are identified by an id the owner chooses (a key, a field name)
//! and carry an embedded `ExpireMeta` recording whether they are tracked
//! and at what time. The index and the metas must agree: the index looks an
//! item up by the time in its meta, so owners change a tracked item's time
//! only through `update`.
//!
//! Ids sharing a time sit in an ordered set, so removal is logarithmic no
//! matter how many items share one time.

use crate::error::ExpireError;
use std::collections::{BTreeMap, BTreeSet};

/// Largest expiration time that can be stored (ms, 48 bits).
pub const EXPIRE_TIME_MAX: u64 = (1 << 48) - 1;

/// Time recorded in the meta of an untracked item.
pub const EXPIRE_TIME_INVALID: u64 = 1 << 48;

/// Expiration bookkeeping embedded in a tracked item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpireMeta {
    when: u64,
    tracked: bool,
}

impl Default for ExpireMeta {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpireMeta {
    pub const fn new() -> Self {
        Self {
            when: EXPIRE_TIME_INVALID,
            tracked: false,
        }
    }

    /// Expiration time if the item is tracked.
    pub fn when(&self) -> Option<u64> {
        self.tracked.then_some(self.when)
    }

    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    /// Marks the item untracked. Used by `active_expire` callbacks that keep
    /// an item alive but drop its expiration.
    pub fn untrack(&mut self) {
        *self = Self::new();
    }

    /// Records a new time for an item an `active_expire` callback is about
    /// to return as `ExpireAction::Update(when)`.
    /// Times past `EXPIRE_TIME_MAX` are clamped to it.
    pub fn reschedule(&mut self, when: u64) {
        self.when = when.min(EXPIRE_TIME_MAX);
        self.tracked = true;
    }
}

/// An item that knows its own id and carries its own meta.
pub trait EItem {
    type Id: Ord + Clone;

    fn id(&self) -> Self::Id;
    fn expire_meta(&self) -> &ExpireMeta;
    fn expire_meta_mut(&mut self) -> &mut ExpireMeta;
}

/// Verdict of an `active_expire` callback on one due item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpireAction {
    /// The item was deleted or untracked by the callback.
    Remove,
    /// The item stays, due again at the given time.
    Update(u64),
    /// Leave this item in place and end the sweep.
    Stop,
}

/// Parameters and results of one expiration sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpireInfo {
    pub max_to_expire: usize,
    /// Items with a time strictly below `now` are due.
    pub now: u64,
    /// Due items handed to the callback and not stopped.
    pub items_expired: usize,
    /// Earliest remaining time after the sweep.
    pub next_expire_time: Option<u64>,
}

impl ExpireInfo {
    pub fn new(now: u64, max_to_expire: usize) -> Self {
        Self {
            max_to_expire,
            now,
            items_expired: 0,
            next_expire_time: None,
        }
    }
}

/// Ids sharing one expiration time.
type Slot<Id> = BTreeSet<Id>;

#[derive(Clone, Debug)]
pub struct EBuckets<Id> {
    by_time: BTreeMap<u64, Slot<Id>>,
    len: usize,
}

impl<Id> Default for EBuckets<Id> {
    fn default() -> Self {
        Self {
            by_time: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<Id: Ord + Clone> EBuckets<Id> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn insert(&mut self, when: u64, id: Id) {
        if self.by_time.entry(when).or_default().insert(id) {
            self.len += 1;
        }
    }

    /// Starts tracking `id` at `when`.
    pub fn add(&mut self, id: Id, meta: &mut ExpireMeta, when: u64) -> Result<(), ExpireError> {
        if meta.tracked {
            return Err(ExpireError::AlreadyTracked);
        }
        if when > EXPIRE_TIME_MAX {
            return Err(ExpireError::InvalidTime { when });
        }
        self.insert(when, id);
        meta.reschedule(when);
        Ok(())
    }

    /// Stops tracking `id`, returning the time it was tracked at.
    pub fn remove(&mut self, id: &Id, meta: &mut ExpireMeta) -> Option<u64> {
        let when = meta.when()?;
        let ids = self.by_time.get_mut(&when)?;
        if !ids.remove(id) {
            return None;
        }
        if ids.is_empty() {
            self.by_time.remove(&when);
        }
        self.len -= 1;
        meta.untrack();
        Some(when)
    }

    /// Moves a tracked `id` to `when`.
    pub fn update(&mut self, id: &Id, meta: &mut ExpireMeta, when: u64) -> Result<(), ExpireError> {
        if when > EXPIRE_TIME_MAX {
            return Err(ExpireError::InvalidTime { when });
        }
        if self.remove(id, meta).is_none() {
            return Err(ExpireError::NotTracked);
        }
        self.add(id.clone(), meta, when)
    }

    pub fn next_expire_time(&self) -> Option<u64> {
        self.by_time.keys().next().copied()
    }

    pub fn max_expire_time(&self) -> Option<u64> {
        self.by_time.keys().next_back().copied()
    }

    /// Hands due items to `f`, earliest first, until `info.max_to_expire`
    /// items were processed, nothing is due, or `f` says stop.
    ///
    /// Each item is detached from the index before `f` sees it. On `Remove`
    /// it stays detached; on `Update(t)` it is re-added at `t` once the
    /// sweep is over, so an item cannot be processed twice in one sweep.
    /// Times past `EXPIRE_TIME_MAX` are stored as `EXPIRE_TIME_MAX`, the
    /// same clamp `ExpireMeta::reschedule` applies.
    pub fn active_expire<F>(&mut self, info: &mut ExpireInfo, mut f: F)
    where
        F: FnMut(&Id) -> ExpireAction,
    {
        let mut updates = Vec::new();
        while info.items_expired < info.max_to_expire {
            let Some(mut entry) = self.by_time.first_entry() else {
                break;
            };
            let when = *entry.key();
            if when >= info.now {
                break;
            }
            let Some(id) = entry.get_mut().pop_first() else {
                entry.remove();
                continue;
            };
            if entry.get().is_empty() {
                entry.remove();
            }
            self.len -= 1;
            match f(&id) {
                ExpireAction::Remove => info.items_expired += 1,
                ExpireAction::Update(t) => {
                    info.items_expired += 1;
                    updates.push((t.min(EXPIRE_TIME_MAX), id));
                }
                ExpireAction::Stop => {
                    self.insert(when, id);
                    break;
                }
            }
        }
        for (when, id) in updates {
            self.insert(when, id);
        }
        info.next_expire_time = self.next_expire_time();
    }

    /// Offers stored ids to `f` for relocation, up to `max_ids` per call.
    /// A time's ids are always offered together.
    ///
    /// `f` must keep the id's ordering. Start with cursor 0; a returned 0
    /// means every id was offered.
    pub fn defrag<F>(&mut self, cursor: u64, max_ids: usize, mut f: F) -> u64
    where
        F: FnMut(&mut Id),
    {
        let start = cursor.saturating_sub(1);
        let mut budget = max_ids.max(1);
        for (&when, ids) in self.by_time.range_mut(start..) {
            if budget == 0 {
                return when + 1;
            }
            budget = budget.saturating_sub(ids.len());
            *ids = core::mem::take(ids)
                .into_iter()
                .map(|mut id| {
                    f(&mut id);
                    id
                })
                .collect();
        }
        0
    }

    /// Iterates `(when, id)` in time order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Id)> + '_ {
        self.by_time
            .iter()
            .flat_map(|(&when, ids)| ids.iter().map(move |id| (when, id)))
    }

    pub fn clear(&mut self) {
        self.by_time.clear();
        self.len = 0;
    }

    /// Approximate heap footprint in bytes.
    pub fn mem_usage(&self) -> usize {
        self.by_time.len() * (core::mem::size_of::<u64>() + core::mem::size_of::<Slot<Id>>())
            + self.len * core::mem::size_of::<Id>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(eb: &mut EBuckets<u32>, items: &[(u32, u64)]) -> Vec<ExpireMeta> {
        items
            .iter()
            .map(|&(id, when)| {
                let mut m = ExpireMeta::new();
                eb.add(id, &mut m, when).unwrap();
                m
            })
            .collect()
    }

    /// Invariant: a tracked item cannot be added twice and times are bounded.
    #[test]
    fn add_rejects_tracked_and_out_of_range() {
        let mut eb = EBuckets::new();
        let mut m = ExpireMeta::new();
        assert_eq!(
            eb.add(1u32, &mut m, EXPIRE_TIME_MAX + 1),
            Err(ExpireError::InvalidTime {
                when: EXPIRE_TIME_MAX + 1
            })
        );
        assert!(!m.is_tracked());
        eb.add(1, &mut m, 10).unwrap();
        assert_eq!(eb.add(1, &mut m, 20), Err(ExpireError::AlreadyTracked));
        assert_eq!(m.when(), Some(10));
        assert_eq!(eb.len(), 1);
    }

    /// Invariant: remove returns the tracked time and clears the meta;
    /// update moves the time.
    #[test]
    fn remove_and_update() {
        let mut eb = EBuckets::new();
        let mut metas = tracked(&mut eb, &[(1, 100), (2, 100), (3, 50)]);
        assert_eq!(eb.next_expire_time(), Some(50));
        assert_eq!(eb.max_expire_time(), Some(100));

        eb.update(&3, &mut metas[2], 200).unwrap();
        assert_eq!(eb.next_expire_time(), Some(100));
        assert_eq!(eb.remove(&3, &mut metas[2]), Some(200));
        assert!(!metas[2].is_tracked());
        assert_eq!(eb.remove(&3, &mut metas[2]), None);
        assert_eq!(eb.update(&3, &mut metas[2], 5), Err(ExpireError::NotTracked));
        assert_eq!(eb.len(), 2);
        assert_eq!(
            eb.iter().map(|(w, _)| w).collect::<Vec<_>>(),
            vec![100, 100]
        );
    }

    /// Invariant: only items strictly before `now` are due.
    #[test]
    fn active_expire_boundary() {
        let mut eb = EBuckets::new();
        tracked(&mut eb, &[(1, 1023), (2, 2047), (3, 2048), (4, 4095)]);
        let mut info = ExpireInfo::new(2048, 100);
        let mut expired = Vec::new();
        eb.active_expire(&mut info, |id| {
            expired.push(*id);
            ExpireAction::Remove
        });
        expired.sort_unstable();
        assert_eq!(expired, vec![1, 2]);
        assert_eq!(info.items_expired, 2);
        assert_eq!(info.next_expire_time, Some(2048));
        assert_eq!(eb.len(), 2);
    }

    /// Invariant: the sweep honors max_to_expire, Stop, and Update.
    #[test]
    fn active_expire_limits_and_actions() {
        let mut eb = EBuckets::new();
        tracked(&mut eb, &[(1, 1), (2, 2), (3, 3), (4, 4)]);

        let mut info = ExpireInfo::new(100, 1);
        eb.active_expire(&mut info, |_| ExpireAction::Remove);
        assert_eq!(info.items_expired, 1);
        assert_eq!(eb.len(), 3);

        let mut info = ExpireInfo::new(100, 10);
        eb.active_expire(&mut info, |id| {
            if *id == 2 {
                ExpireAction::Update(500)
            } else {
                ExpireAction::Stop
            }
        });
        assert_eq!(info.items_expired, 1);
        assert_eq!(eb.len(), 3);
        assert_eq!(eb.max_expire_time(), Some(500));
        assert_eq!(info.next_expire_time, Some(3));
    }

    /// Invariant: defrag offers every id exactly once across resumptions.
    #[test]
    fn defrag_resumes() {
        let mut eb = EBuckets::new();
        let items: Vec<(u32, u64)> = (0..50).map(|i| (i, (i % 10) as u64)).collect();
        tracked(&mut eb, &items);
        let mut seen = Vec::new();
        let mut cursor = 0;
        let mut calls = 0;
        loop {
            cursor = eb.defrag(cursor, 7, |id| seen.push(*id));
            calls += 1;
            if cursor == 0 {
                break;
            }
        }
        assert!(calls > 1);
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    /// Invariant: removing items that share one time stays cheap and keeps
    /// the index consistent.
    #[test]
    fn remove_many_at_one_time() {
        const N: u32 = 40_000;
        let timed = |when: fn(u32) -> u64| {
            let mut eb = EBuckets::new();
            let mut metas: Vec<ExpireMeta> = (0..N)
                .map(|id| {
                    let mut m = ExpireMeta::new();
                    eb.add(id, &mut m, when(id)).unwrap();
                    m
                })
                .collect();
            let start = std::time::Instant::now();
            for id in (0..N).rev() {
                assert_eq!(eb.remove(&id, &mut metas[id as usize]), Some(when(id)));
            }
            let took = start.elapsed();
            assert!(eb.is_empty());
            assert_eq!(eb.next_expire_time(), None);
            assert!(metas.iter().all(|m| !m.is_tracked()));
            took
        };
        let same = timed(|_| 7);
        let distinct = timed(u64::from);
        assert!(
            same < distinct * 10 + std::time::Duration::from_millis(50),
            "same time {same:?}, distinct times {distinct:?}"
        );
    }

    /// Invariant: an item rescheduled past the time bound is stored and
    /// recorded at the bound, so it can still be removed.
    #[test]
    fn update_past_bound_is_clamped() {
        let mut eb = EBuckets::new();
        let mut m = ExpireMeta::new();
        eb.add(1u32, &mut m, 10).unwrap();
        let mut info = ExpireInfo::new(100, 10);
        eb.active_expire(&mut info, |_| {
            m.reschedule(EXPIRE_TIME_MAX + 5);
            ExpireAction::Update(EXPIRE_TIME_MAX + 5)
        });
        assert_eq!(m.when(), Some(EXPIRE_TIME_MAX));
        assert_eq!(eb.max_expire_time(), Some(EXPIRE_TIME_MAX));
        assert_eq!(eb.remove(&1, &mut m), Some(EXPIRE_TIME_MAX));
        assert!(eb.is_empty());
    }

    #[test]
    fn clear_empties() {
        let mut eb = EBuckets::new();
        tracked(&mut eb, &[(1, 1), (2, 2)]);
        assert!(eb.mem_usage() > 0);
        eb.clear();
        assert!(eb.is_empty());
        assert_eq!(eb.next_expire_time(), None);
    }
}
