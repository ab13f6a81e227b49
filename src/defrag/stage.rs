//! Resumable units of defrag work.

use super::DefragCtx;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageStatus {
    Done,
    NotDone,
}

/// Position of a stage in a cycle. Stages run ordered by kind, and in
/// registration order within a kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    Keys,
    Expires,
    Subexpires,
    Pubsub,
    Misc,
    Module,
}

/// One resumable piece of a defrag cycle over a database of type `C`.
///
/// `step` does work until `deadline` passes or the stage is complete. A
/// `NotDone` stage is called again with a fresh deadline and continues from
/// its saved cursor. `reset` drops all progress; it runs before each cycle
/// and when a cycle is aborted.
pub trait Stage<C> {
    fn name(&self) -> &str;

    fn kind(&self) -> StageKind;

    fn step(&mut self, db: &mut C, ctx: &mut DefragCtx<'_>, deadline: Instant) -> StageStatus;

    fn reset(&mut self);
}

type StepFn<C> = dyn FnMut(&mut C, &mut DefragCtx<'_>, Instant, &mut u64) -> StageStatus;

/// Stage backed by a closure and a `u64` cursor the closure owns.
///
/// Used for the misc and module stages, whose structures are known only to
/// the embedding application.
pub struct FnStage<C> {
    name: String,
    kind: StageKind,
    cursor: u64,
    f: Box<StepFn<C>>,
}

impl<C> FnStage<C> {
    pub fn new<F>(name: impl Into<String>, kind: StageKind, f: F) -> Self
    where
        F: FnMut(&mut C, &mut DefragCtx<'_>, Instant, &mut u64) -> StageStatus + 'static,
    {
        Self {
            name: name.into(),
            kind,
            cursor: 0,
            f: Box::new(f),
        }
    }

    /// Stage that does all its work in one call.
    pub fn once<F>(name: impl Into<String>, kind: StageKind, mut f: F) -> Self
    where
        F: FnMut(&mut C, &mut DefragCtx<'_>) + 'static,
    {
        Self::new(name, kind, move |db, ctx, _deadline, _cursor| {
            f(db, ctx);
            StageStatus::Done
        })
    }
}

impl<C> Stage<C> for FnStage<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    fn step(&mut self, db: &mut C, ctx: &mut DefragCtx<'_>, deadline: Instant) -> StageStatus {
        let status = (self.f)(db, ctx, deadline, &mut self.cursor);
        if status == StageStatus::Done {
            self.cursor = 0;
        }
        status
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}
