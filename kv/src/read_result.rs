use crate::generation::{Generation, StalenessBound, TimestampedGeneration};

/// The outcome of a read or writeback: either nothing changed, the key is
/// absent, or a concrete value is present.
#[derive(Clone, Debug, PartialEq)]
pub enum ReadResultState {
    /// No change relative to the input; the caller should keep whatever it
    /// already had.
    Unspecified,
    /// The key does not exist.
    Missing,
    /// The key has this value.
    Value(bytes::Bytes),
}

impl ReadResultState {
    pub fn is_unspecified(&self) -> bool {
        matches!(self, ReadResultState::Unspecified)
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, ReadResultState::Missing)
    }

    pub fn value(&self) -> Option<&bytes::Bytes> {
        match self {
            ReadResultState::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// A read (or writeback) result: the state, and the generation/time that
/// dated it.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadResult {
    pub state: ReadResultState,
    pub stamp: TimestampedGeneration,
}

impl ReadResult {
    pub fn missing(stamp: TimestampedGeneration) -> Self {
        Self { state: ReadResultState::Missing, stamp }
    }

    pub fn value(bytes: bytes::Bytes, stamp: TimestampedGeneration) -> Self {
        Self { state: ReadResultState::Value(bytes), stamp }
    }

    pub fn unspecified(stamp: TimestampedGeneration) -> Self {
        Self { state: ReadResultState::Unspecified, stamp }
    }

    /// A `Missing` result with no I/O performed, used to synthesize the
    /// input for an entry whose predecessor was buried by a delete-range
    /// (the `prev-deleted` case).
    pub fn synthesize_missing() -> Self {
        Self::missing(TimestampedGeneration::never_validated(Generation::NoValue))
    }

    pub fn is_dirty(&self) -> bool {
        !self.state.is_unspecified()
    }
}

/// An inclusive-start, exclusive-end byte range within a value, used to
/// request or write back a subrange instead of the whole value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub inclusive_min: u64,
    pub exclusive_max: Option<u64>,
}

impl ByteRange {
    pub fn full() -> Self {
        Self { inclusive_min: 0, exclusive_max: None }
    }
}

/// Options recognized on a non-transactional or RMW-chain read.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadOptions {
    pub if_equal: Option<Generation>,
    pub if_not_equal: Option<Generation>,
    pub staleness_bound: StalenessBound,
    pub byte_range: Option<ByteRange>,
    /// Allows the driver to coalesce this read with others issued in the
    /// same batch window; purely an optimization hint.
    pub batch: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            if_equal: None,
            if_not_equal: None,
            staleness_bound: StalenessBound::unbounded(),
            byte_range: None,
            batch: false,
        }
    }
}

/// Options recognized on a write.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct WriteOptions {
    pub if_equal: Option<Generation>,
}

/// Options for a read performed through the RMW-target protocol (`read` /
/// `writeback`): a staleness bound, plus an optional byte range.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ReadModifyWriteReadOptions {
    pub staleness_bound: Option<StalenessBound>,
    pub byte_range: Option<ByteRange>,
}

/// Options for a `writeback` request issued to an RMW source.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct WritebackOptions {
    pub staleness_bound: Option<StalenessBound>,
    pub byte_range: Option<ByteRange>,
}
