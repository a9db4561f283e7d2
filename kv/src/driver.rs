//! The underlying key-value driver contract consumed by the mutation layer.
//!
//! This crate does not implement a production driver: the driver is an
//! external collaborator (a file-backed store, an object-storage client, a
//! gRPC-fronted service) specified here only by interface. [`crate::testutil::MemoryDriver`]
//! is the one concrete implementation this crate ships, used by its own
//! tests and doc examples.

use async_trait::async_trait;

use crate::error::CResult;
use crate::generation::TimestampedGeneration;
use crate::key_range::KeyRange;
use crate::read_result::{ReadOptions, ReadResult, WriteOptions};

/// One entry produced while listing a key range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListEntry {
    pub key: Vec<u8>,
    pub size: u64,
}

/// Options recognized on a list operation.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub range: Option<KeyRange>,
    /// Strip this many leading bytes from each yielded key (used by
    /// non-terminal drivers that prefix keys with a shard identifier).
    pub strip_prefix_length: usize,
}

/// A value to write, or `None` to delete the key (write a tombstone).
pub type WriteValue = Option<bytes::Bytes>;

/// The underlying key-value driver this layer stages transactional
/// mutations against.
///
/// Terminal drivers implement this directly against physical storage;
/// adapter drivers forward to another `Driver` underneath, optionally
/// transforming keys or values. Every method may suspend; no lock from the
/// mutation layer is ever held across one of these calls.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Reads the current value of `key`, subject to the generation
    /// preconditions and staleness bound in `options`.
    async fn read(&self, key: &[u8], options: ReadOptions) -> CResult<ReadResult>;

    /// Writes `value` (or deletes, if `None`) to `key`, conditioned on
    /// `options.if_equal` if present. Fails with
    /// [`crate::error::Error::FailedPrecondition`] if the precondition does
    /// not hold.
    async fn write(
        &self,
        key: &[u8],
        value: WriteValue,
        options: WriteOptions,
    ) -> CResult<TimestampedGeneration>;

    /// Deletes every key in `range`. Drivers that cannot delete a range
    /// atomically may implement this as a sequence of point deletes; the
    /// mutation layer does not depend on atomicity of this call by itself.
    async fn delete_range(&self, range: KeyRange) -> CResult<()>;

    /// Streams the keys (and sizes) in `options.range`, in key order.
    async fn list(&self, options: ListOptions) -> CResult<Vec<ListEntry>>;

    /// A short human-readable description of `key`, for error messages.
    fn describe_key(&self, key: &[u8]) -> String {
        String::from_utf8_lossy(key).into_owned()
    }

    /// Whether this driver can apply a batch of writes/deletes atomically.
    /// Non-atomic drivers still implement this trait; the commit state
    /// machine falls back to per-key independent writes for them.
    fn supports_atomic_batch(&self) -> bool {
        false
    }

    /// Applies an atomic batch of writes and range-deletes, each
    /// conditioned on the paired expected generation. Only called when
    /// [`Driver::supports_atomic_batch`] returns `true`.
    async fn atomic_write_batch(&self, _batch: AtomicBatch) -> CResult<()> {
        Err(crate::error::Error::Unimplemented(
            "driver does not support atomic batches".into(),
        ))
    }
}

/// A single conditioned write within an atomic batch.
pub struct AtomicBatchWrite {
    pub key: Vec<u8>,
    pub value: WriteValue,
    pub if_equal: crate::generation::Generation,
}

/// A single range-delete within an atomic batch.
pub struct AtomicBatchDelete {
    pub range: KeyRange,
}

/// The full set of operations an atomic commit asks the driver to apply
/// all-or-nothing.
#[derive(Default)]
pub struct AtomicBatch {
    pub writes: Vec<AtomicBatchWrite>,
    pub deletes: Vec<AtomicBatchDelete>,
}

impl AtomicBatch {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}
