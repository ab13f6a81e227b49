//! Stage walking the ids indexed by an `Estore`.

use super::{DefragCtx, Stage, StageKind, StageStatus};
use crate::alloc::Relocatable;
use crate::ebuckets::EItem;
use crate::estore::Estore;
use std::time::Instant;

/// Ids offered per `defrag_bucket` call.
const IDS_PER_STEP: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pos {
    Start,
    In(usize),
    After(usize),
}

pub struct EstoreStage<C, I: EItem> {
    name: String,
    kind: StageKind,
    estore: fn(&mut C) -> &mut Estore<I>,
    pos: Pos,
    cursor: u64,
}

impl<C, I: EItem> EstoreStage<C, I> {
    pub fn new(name: impl Into<String>, kind: StageKind, estore: fn(&mut C) -> &mut Estore<I>) -> Self {
        Self {
            name: name.into(),
            kind,
            estore,
            pos: Pos::Start,
            cursor: 0,
        }
    }
}

impl<C, I> Stage<C> for EstoreStage<C, I>
where
    I: EItem,
    I::Id: Relocatable,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    fn step(&mut self, db: &mut C, ctx: &mut DefragCtx<'_>, deadline: Instant) -> StageStatus {
        let es = (self.estore)(db);
        loop {
            let eidx = match self.pos {
                Pos::Start => es.first_non_empty_bucket(),
                Pos::In(e) => Some(e),
                Pos::After(e) => es.next_non_empty_bucket(e),
            };
            let Some(eidx) = eidx else {
                self.reset();
                return StageStatus::Done;
            };
            if self.pos != Pos::In(eidx) {
                self.cursor = 0;
            }
            self.cursor = es.defrag_bucket(eidx, self.cursor, IDS_PER_STEP, |id| {
                ctx.scanned += 1;
                ctx.relocate(id);
            });
            self.pos = if self.cursor == 0 {
                Pos::After(eidx)
            } else {
                Pos::In(eidx)
            };
            if Instant::now() >= deadline {
                return StageStatus::NotDone;
            }
        }
    }

    fn reset(&mut self) {
        self.pos = Pos::Start;
        self.cursor = 0;
    }
}
