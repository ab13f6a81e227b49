//! Reference-counted pause flags.
//!
//! `Dict` keeps two of these: one suppressing incremental rehash steps
//! while a safe iterator or scan holds entry handles, and one suppressing
//! automatic shrinking. Every `pause` must be matched by one `resume`;
//! resuming an unpaused counter is a caller bug and panics.

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PauseCount {
    depth: u32,
}

impl PauseCount {
    pub(crate) const fn new() -> Self {
        Self { depth: 0 }
    }

    #[inline]
    pub(crate) fn pause(&mut self) {
        self.depth = self
            .depth
            .checked_add(1)
            .expect("pause counter overflow");
    }

    #[inline]
    pub(crate) fn resume(&mut self) {
        assert!(self.depth > 0, "resume without a matching pause");
        self.depth -= 1;
    }

    #[inline]
    pub(crate) fn is_paused(&self) -> bool {
        self.depth > 0
    }
}

#[cfg(test)]
mod tests {
    use super::PauseCount;

    #[test]
    fn nested_pause_resume() {
        let mut p = PauseCount::new();
        assert!(!p.is_paused());
        p.pause();
        p.pause();
        assert_eq!(p.depth, 2);
        p.resume();
        assert!(p.is_paused());
        p.resume();
        assert!(!p.is_paused());
    }

    #[test]
    fn unmatched_resume_panics() {
        let res = std::panic::catch_unwind(|| {
            let mut p = PauseCount::new();
            p.resume();
        });
        assert!(res.is_err(), "expected unmatched resume to panic");
    }
}
