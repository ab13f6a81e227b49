//! Error types shared across the crate.
//!
//! Expected-absent results are `Option`s and duplicate inserts are
//! `Occupied` values; the enums here cover the genuinely failing paths.

use thiserror::Error;

/// Failure to start a resize of a `Dict`.
///
/// Every variant leaves the table unmodified.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DictError {
    #[error("a rehash is already in progress")]
    Rehashing,

    #[error("requested size {requested} cannot hold {used} entries")]
    InvalidSize { requested: usize, used: usize },

    #[error("resize to {requested} would leave the table at {buckets} buckets")]
    Unchanged { requested: usize, buckets: usize },

    #[error("allocation of {buckets} buckets failed")]
    AllocFailed { buckets: usize },
}

/// Failures of the expiration index.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpireError {
    #[error("item is already tracked by an expiration index")]
    AlreadyTracked,

    #[error("expire time {when} is beyond the supported range")]
    InvalidTime { when: u64 },

    #[error("item is not tracked by an expiration index")]
    NotTracked,
}

/// Invalid configuration parameter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ConfigError(String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Invariant: display strings carry the offending numbers.
    #[test]
    fn dict_error_display() {
        let e = DictError::InvalidSize {
            requested: 4,
            used: 9,
        };
        assert_eq!(e.to_string(), "requested size 4 cannot hold 9 entries");
        assert!(DictError::AllocFailed { buckets: 1 << 40 }
            .to_string()
            .contains("1099511627776"));
    }

    /// Invariant: ConfigError round-trips its message.
    #[test]
    fn config_error_message() {
        let e = ConfigError::new("cycle_min must be <= cycle_max");
        assert_eq!(e.message(), "cycle_min must be <= cycle_max");
        assert_eq!(e.to_string(), "cycle_min must be <= cycle_max");
    }

    /// Invariant: every error type is a std error.
    #[test]
    fn implements_std_error() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<DictError>();
        assert_error::<ExpireError>();
        assert_error::<ConfigError>();
    }
}
