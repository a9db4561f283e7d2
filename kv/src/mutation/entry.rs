//! Mutation entries: the records held in a phase's interval tree (spec §3,
//! §4.1, §4.2). Translated from an intrusive red-black tree of tagged
//! pointers into an ownership-by-container model (see `DESIGN.md`): a
//! `BTreeMap` keyed by representative key owns the head of each chain, and
//! a `ReadModifyWriteEntry::prev` link owns the remainder of that chain.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::mutation::target::ReadModifyWriteSource;
use crate::read_result::ReadResult;

/// Bit flags on a [`ReadModifyWriteEntry`]. Writes require the owning
/// node's mutex; the two bits marked init-only may be read with a relaxed
/// atomic load without holding it, since they are set once at entry
/// creation and never change afterward.
#[derive(Debug, Default)]
pub struct Flags(AtomicU16);

impl Flags {
    pub const WRITEBACK_PROVIDED: u16 = 1 << 0;
    pub const TRANSITIVELY_UNCONDITIONAL: u16 = 1 << 1;
    pub const PREV_DELETED: u16 = 1 << 2;
    pub const ERROR: u16 = 1 << 3;
    pub const DELETED: u16 = 1 << 4;
    pub const TRANSITIVELY_DIRTY: u16 = 1 << 5;
    pub const REVOKED: u16 = 1 << 6;
    /// Init-only: safe to read without the node mutex.
    pub const NON_RETRYABLE: u16 = 1 << 7;
    /// Init-only: safe to read without the node mutex.
    pub const SUPPORTS_BYTE_RANGE: u16 = 1 << 8;

    pub fn new() -> Self {
        Self(AtomicU16::new(0))
    }

    pub fn get(&self, bit: u16) -> bool {
        self.0.load(Ordering::Relaxed) & bit != 0
    }

    pub fn set(&self, bit: u16) {
        self.0.fetch_or(bit, Ordering::Relaxed);
    }

    /// Sets `bit` and returns whether it was already set, for idempotent
    /// first-caller checks (e.g. `writeback_error`).
    pub fn test_and_set(&self, bit: u16) -> bool {
        self.0.fetch_or(bit, Ordering::Relaxed) & bit != 0
    }
}

/// A single-key read/modify/write operation staged against the mutation
/// layer.
pub struct ReadModifyWriteEntry {
    pub key: Vec<u8>,
    /// Index into `MultiPhaseNode::phases`: the phase active when this
    /// entry was admitted. Fixed for the lifetime of the entry.
    pub phase_index: usize,
    pub source: Arc<dyn ReadModifyWriteSource>,
    /// The same-key entry this one supersedes, if any. Exclusively owned:
    /// destroying this entry destroys its whole backward chain.
    pub prev: Option<Box<ReadModifyWriteEntry>>,
    pub flags: Flags,
    /// Set only for `repeatable_read` validation entries (spec §4.5 point
    /// 2): the exact read result observed at admission time, returned
    /// as-is by [`ReadModifyWriteTarget::read`](crate::mutation::target::ReadModifyWriteTarget::read)
    /// instead of issuing a fresh driver read at commit time, so the
    /// writeback this entry triggers is conditioned on the generation the
    /// caller actually saw rather than whatever the driver holds moments
    /// before commit.
    pub pinned_read: Option<ReadResult>,
}

impl ReadModifyWriteEntry {
    pub fn new(
        key: Vec<u8>,
        phase_index: usize,
        source: Arc<dyn ReadModifyWriteSource>,
    ) -> Self {
        Self::new_impl(key, phase_index, source, None)
    }

    /// Builds a `repeatable_read` validation entry: `pinned_read` is both
    /// the value `source.writeback` will reproduce and the input `read`
    /// reports, so commit rewrites the same bytes conditioned on the
    /// generation captured at admission time.
    pub fn new_pinned(
        key: Vec<u8>,
        phase_index: usize,
        source: Arc<dyn ReadModifyWriteSource>,
        pinned_read: ReadResult,
    ) -> Self {
        Self::new_impl(key, phase_index, source, Some(pinned_read))
    }

    fn new_impl(
        key: Vec<u8>,
        phase_index: usize,
        source: Arc<dyn ReadModifyWriteSource>,
        pinned_read: Option<ReadResult>,
    ) -> Self {
        let flags = Flags::new();
        if source.non_retryable() {
            flags.set(Flags::NON_RETRYABLE);
        }
        if source.supports_byte_range_reads() {
            flags.set(Flags::SUPPORTS_BYTE_RANGE);
        }
        Self { key, phase_index, source, prev: None, flags, pinned_read }
    }

    pub fn is_prev_deleted(&self) -> bool {
        self.flags.get(Flags::PREV_DELETED)
    }

    pub fn non_retryable(&self) -> bool {
        self.flags.get(Flags::NON_RETRYABLE)
    }
}

/// A half-open range-delete operation staged against the mutation layer.
pub struct DeleteRangeEntry {
    pub inclusive_min: Vec<u8>,
    pub exclusive_max: Vec<u8>,
    pub phase_index: usize,
    /// RMW entries fully covered by this delete at the time it was
    /// admitted, kept for validation only; discarded on writeback.
    pub superseded: BTreeMap<Vec<u8>, ReadModifyWriteEntry>,
}

impl DeleteRangeEntry {
    pub fn new(inclusive_min: Vec<u8>, exclusive_max: Vec<u8>, phase_index: usize) -> Self {
        Self {
            inclusive_min,
            exclusive_max,
            phase_index,
            superseded: BTreeMap::new(),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.inclusive_min.as_slice() && key < self.exclusive_max.as_slice()
    }
}

pub type SharedDeleteRange = Arc<Mutex<DeleteRangeEntry>>;

/// An entry (or delete-range fragment) as it appears in the node's virtual
/// view, keyed by representative key.
pub enum VirtualEntry {
    Rmw(Box<ReadModifyWriteEntry>),
    /// One contiguous fragment `[key, fragment_exclusive_max)` of a
    /// (possibly split) delete-range. `fragment_exclusive_max` may be
    /// narrower than the owning entry's own `exclusive_max` once a later
    /// RMW has split it.
    Delete(SharedDeleteRange, Vec<u8>),
}

/// Idempotent, per-entry writeback-error notification (spec §4.7): notifies
/// the source of `entry`, then recurses on `entry.prev`.
pub async fn writeback_error(entry: &mut ReadModifyWriteEntry, error: &Error) {
    let mut current = Some(entry);
    while let Some(e) = current {
        if e.flags.test_and_set(Flags::ERROR) {
            // Already notified further up this chain; nothing left to do
            // for this or any earlier predecessor, since a predecessor can
            // only be reachable through one chain.
            break;
        }
        log::warn!(
            "writeback error on key {:?} (phase {}): {error}",
            String::from_utf8_lossy(&e.key),
            e.phase_index
        );
        e.source.revoke().await;
        current = e.prev.as_deref_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_result::{ReadResult, WritebackOptions};
    use async_trait::async_trait;

    struct CountingSource(AtomicUsize);

    #[async_trait]
    impl ReadModifyWriteSource for CountingSource {
        async fn writeback(&self, _options: WritebackOptions) -> crate::error::CResult<ReadResult> {
            Ok(ReadResult::unspecified(Default::default()))
        }
        async fn revoke(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn writeback_error_notifies_chain_exactly_once() {
        let tail_revokes = Arc::new(CountingSource(AtomicUsize::new(0)));
        let head_revokes = Arc::new(CountingSource(AtomicUsize::new(0)));

        let tail = ReadModifyWriteEntry::new(b"k".to_vec(), 0, tail_revokes.clone());
        let mut head = ReadModifyWriteEntry::new(b"k".to_vec(), 1, head_revokes.clone());
        head.prev = Some(Box::new(tail));

        writeback_error(&mut head, &Error::Cancelled).await;
        writeback_error(&mut head, &Error::Cancelled).await;

        assert_eq!(head_revokes.0.load(Ordering::Relaxed), 1);
        assert_eq!(tail_revokes.0.load(Ordering::Relaxed), 1);
        assert!(head.flags.get(Flags::ERROR));
        assert!(head.prev.unwrap().flags.get(Flags::ERROR));
    }
}
