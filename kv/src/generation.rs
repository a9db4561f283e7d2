//! Generation tokens used to validate optimistic-concurrency writes.
//!
//! A `Generation` is an opaque token a driver assigns to a committed value
//! version. It supports equality comparisons only (no total order across
//! arbitrary drivers), plus a handful of sentinel values the mutation layer
//! relies on: *unknown* (never observed), *unconditional* (the writeback
//! doesn't depend on the prior state), *no-value* (the key does not exist),
//! and *unspecified* (no generation was supplied).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Opaque version token assigned by a driver.
///
/// Drivers are free to pick any encoding (a revision number, an etag, a
/// content hash); this layer never inspects the bytes, only compares them
/// for equality against the sentinels below.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Generation {
    /// No generation has been observed yet.
    Unknown,
    /// The writeback result does not depend on the prior generation; a
    /// writeback conditioned on this generation always succeeds.
    Unconditional,
    /// The key has no value (a tombstone generation).
    NoValue,
    /// The caller did not care about ordering; equivalent to "any".
    Unspecified,
    /// A concrete, driver-assigned version token.
    Value(Vec<u8>),
}

impl Generation {
    pub fn is_unconditional(&self) -> bool {
        matches!(self, Generation::Unconditional)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Generation::Unknown)
    }

    pub fn is_no_value(&self) -> bool {
        matches!(self, Generation::NoValue)
    }

    /// Whether `self` as an expected-generation precondition would be
    /// satisfied by `actual` without contacting the driver.
    pub fn matches(&self, actual: &Generation) -> bool {
        if self.is_unconditional() {
            return true;
        }
        self == actual
    }
}

impl Default for Generation {
    fn default() -> Self {
        Generation::Unknown
    }
}

/// A `Generation` paired with the wall-clock time it was observed at.
///
/// `time` is `None` to represent `-infinity` (never validated against the
/// driver); `Some(_)` is a concrete instant.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct TimestampedGeneration {
    pub generation: Generation,
    pub time: Option<SystemTime>,
}

impl TimestampedGeneration {
    pub fn new(generation: Generation, time: SystemTime) -> Self {
        Self { generation, time: Some(time) }
    }

    /// A stamp that has never been validated against the underlying driver.
    pub fn never_validated(generation: Generation) -> Self {
        Self { generation, time: None }
    }

    /// Whether this stamp is older than `staleness_bound`, i.e. a fresh
    /// read is required before it can be trusted.
    pub fn is_out_of_date(&self, staleness_bound: SystemTime) -> bool {
        match self.time {
            None => true,
            Some(t) => t < staleness_bound,
        }
    }
}

/// A staleness bound used by reads and writebacks: "any state observed no
/// earlier than this instant is acceptable".
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StalenessBound(SystemTime);

impl StalenessBound {
    pub fn now() -> Self {
        StalenessBound(SystemTime::now())
    }

    pub fn at(time: SystemTime) -> Self {
        StalenessBound(time)
    }

    /// A bound that accepts any previously observed state, however old.
    pub fn unbounded() -> Self {
        StalenessBound(UNIX_EPOCH)
    }

    pub fn time(&self) -> SystemTime {
        self.0
    }

    pub fn advanced_by(&self, d: Duration) -> Self {
        StalenessBound(self.0 + d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconditional_matches_anything() {
        let g = Generation::Unconditional;
        assert!(g.matches(&Generation::Value(vec![1, 2, 3])));
        assert!(g.matches(&Generation::NoValue));
    }

    #[test]
    fn value_generations_require_equality() {
        let a = Generation::Value(vec![1]);
        let b = Generation::Value(vec![2]);
        assert!(!a.matches(&b));
        assert!(a.matches(&a.clone()));
    }

    #[test]
    fn never_validated_is_always_out_of_date() {
        let stamp = TimestampedGeneration::never_validated(Generation::Unknown);
        assert!(stamp.is_out_of_date(SystemTime::now()));
    }
}
