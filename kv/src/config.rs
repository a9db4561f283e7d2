//! Commit tuning knobs, in the shape of the teacher's own `ConfigLoad`
//! (`kv-cli`'s configuration struct): a plain struct with a `Default` impl,
//! loaded once and threaded through by value.

use std::time::Duration;

/// Tuning for [`crate::mutation::commit::commit_next_phase`].
#[derive(Clone, Debug)]
pub struct CommitConfig {
    /// Maximum number of retry attempts for a single non-atomic
    /// conditional write before giving up with
    /// [`crate::error::Error::Aborted`].
    pub max_retries: u32,
    /// Maximum number of retry attempts for an atomic batch commit.
    pub max_atomic_retries: u32,
    /// Default staleness bound applied to reads that don't specify one.
    pub default_staleness: Duration,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_retries: 8,
            max_atomic_retries: 8,
            default_staleness: Duration::from_secs(0),
        }
    }
}
