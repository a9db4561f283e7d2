use std::fmt;

/// Errors produced by the transactional mutation layer and the drivers it
/// talks to.
///
/// The variants correspond to the error taxonomy a driver or RMW source is
/// expected to signal; `Internal` and `Parse` are kept for the lower-level
/// storage/codec failures the rest of the crate still bottoms out on.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Caller passed an ill-formed key, range, or option.
    InvalidArgument(String),
    /// A generation precondition was not satisfied and retry does not apply.
    FailedPrecondition(String),
    /// Commit retried past its bound, or an atomic commit hit a conflict on
    /// a non-retryable entry.
    Aborted(String),
    /// The requested feature is not supported (e.g. `repeatable_read` list).
    Unimplemented(String),
    /// Invariant violation from a misbehaving driver or source.
    Internal(String),
    /// The caller cancelled the commit future.
    Cancelled,
    /// A value failed to parse or decode.
    Parse(String),
    /// A stored value was malformed or out of range for its field.
    Value(String),
}

pub type CResult<T> = Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::FailedPrecondition(msg) => write!(f, "failed precondition: {msg}"),
            Error::Aborted(msg) => write!(f, "aborted: {msg}"),
            Error::Unimplemented(msg) => write!(f, "unimplemented: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::Cancelled => write!(f, "cancelled"),
            Error::Parse(msg) => write!(f, "parse error: {msg}"),
            Error::Value(msg) => write!(f, "invalid value: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl Error {
    /// True for errors a non-atomic commit should surface without further
    /// retry, i.e. the source can't produce a different writeback result.
    pub fn is_generation_mismatch(&self) -> bool {
        matches!(self, Error::FailedPrecondition(_))
    }
}
