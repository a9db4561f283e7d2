//! The RMW-target protocol (spec §4.3): each [`crate::mutation::entry::ReadModifyWriteEntry`]
//! publishes a `ReadModifyWriteTarget` interface to its source, and consumes
//! a `ReadModifyWriteSource` interface back from it.

use async_trait::async_trait;

use crate::error::CResult;
use crate::read_result::{ReadModifyWriteReadOptions, ReadResult, WritebackOptions};

/// Implemented by the entry, consumed by the source (typically a cache
/// node). The source calls `read` to discover what value it should be
/// basing its writeback on, and `reads_committed` to decide whether it can
/// skip re-validating a cached read.
#[async_trait]
pub trait ReadModifyWriteTarget: Send + Sync {
    /// Satisfies a read request: if this entry has a predecessor, by
    /// requesting the predecessor's writeback; otherwise by delegating to
    /// the driver's non-transactional read. If this entry is
    /// `prev-deleted`, returns a synthesized `Missing` result without I/O.
    async fn read(&self, options: ReadModifyWriteReadOptions) -> CResult<ReadResult>;

    /// True iff the result of `read` reflects the committed underlying
    /// state, i.e. there is no predecessor and no ancestor awaiting
    /// writeback.
    async fn reads_committed(&self) -> bool;
}

/// Implemented by the source (normally a cache transaction node), consumed
/// by the entry during commit dispatch.
#[async_trait]
pub trait ReadModifyWriteSource: Send + Sync {
    /// Asks the source for its desired new state given the read result the
    /// entry's target has assembled. Returning `Unspecified` means "leave
    /// the existing value as-is".
    async fn writeback(&self, options: WritebackOptions) -> CResult<ReadResult>;

    /// Invalidates any cached read state. Idempotent; may be called more
    /// than once.
    async fn revoke(&self);

    /// Whether `writeback` accepts a non-full byte range. Read once at
    /// entry-admission time; never changes afterward.
    fn supports_byte_range_reads(&self) -> bool {
        false
    }

    /// Whether a writeback that fails with a generation mismatch should
    /// never be retried, because the desired writeback state would not
    /// change on a fresh read. Read once at entry-admission time.
    fn non_retryable(&self) -> bool {
        false
    }
}
