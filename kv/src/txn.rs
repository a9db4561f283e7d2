//! Transactional read and list entry points (spec §4.5, §6): the surface a
//! caller uses to read through an open transaction's own uncommitted
//! writes before they have been dispatched to the driver.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::CommitConfig;
use crate::driver::{Driver, ListEntry, ListOptions};
use crate::error::{CResult, Error};
use crate::generation::{Generation, StalenessBound, TimestampedGeneration};
use crate::key_range::KeyRange;
use crate::mutation::commit::commit_next_phase;
use crate::mutation::entry::VirtualEntry;
use crate::mutation::target::ReadModifyWriteSource;
use crate::mutation::MultiPhaseNode;
use crate::read_result::{ByteRange, ReadOptions, ReadResult, ReadResultState, WritebackOptions};

/// Transaction read/write mode flags (spec §6), as a small bitfield over a
/// `u8` rather than a dedicated crate: two flags don't earn a dependency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionMode(u8);

impl TransactionMode {
    pub const READ_WRITE: TransactionMode = TransactionMode(1 << 0);
    /// Reads observe a consistent snapshot across the whole transaction
    /// rather than the latest committed state at the time of each
    /// individual read. Not implemented: see [`transactional_list`].
    pub const REPEATABLE_READ: TransactionMode = TransactionMode(1 << 1);

    pub fn contains(self, other: TransactionMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TransactionMode {
    type Output = TransactionMode;
    fn bitor(self, rhs: TransactionMode) -> TransactionMode {
        TransactionMode(self.0 | rhs.0)
    }
}

/// Reads `key` through an open transaction (spec §4.5): if the key has an
/// uncommitted RMW entry in `node`'s virtual view, resolves it through that
/// entry's predecessor/source chain; if it falls under an uncommitted
/// delete-range, returns `missing` without touching the driver; otherwise
/// falls through to the driver's own non-transactional read. In
/// [`TransactionMode::REPEATABLE_READ`] mode, a fallthrough read also admits
/// a no-op validation entry so commit fails if the key changes underneath
/// the transaction before it commits.
pub async fn transactional_read(
    node: &MultiPhaseNode,
    driver: &dyn Driver,
    mode: TransactionMode,
    key: &[u8],
    staleness_bound: Option<StalenessBound>,
    byte_range: Option<ByteRange>,
) -> CResult<ReadResult> {
    match node.uncommitted_entry(key) {
        Some(UncommittedEntry::Rmw(source)) => {
            return source
                .writeback(crate::read_result::WritebackOptions { staleness_bound, byte_range })
                .await;
        }
        Some(UncommittedEntry::Deleted) => return Ok(ReadResult::synthesize_missing()),
        None => {}
    }
    let result = driver
        .read(
            key,
            ReadOptions {
                staleness_bound: staleness_bound.unwrap_or_else(StalenessBound::unbounded),
                byte_range,
                ..Default::default()
            },
        )
        .await?;
    if mode.contains(TransactionMode::REPEATABLE_READ) {
        node.add_repeatable_read_validation(key.to_vec(), result.clone())?;
    }
    Ok(result)
}

/// Alias for [`transactional_read`] under the "upward API" name spec §6
/// gives it (`read_via_existing_transaction(driver, txn, &phase, key,
/// opts)`): `node` plays the role of the transaction/phase handle, since
/// this crate's phases are addressed by index within one `MultiPhaseNode`
/// rather than by a separate handle.
pub async fn read_via_existing_transaction(
    driver: &dyn Driver,
    node: &MultiPhaseNode,
    mode: TransactionMode,
    key: &[u8],
    staleness_bound: Option<StalenessBound>,
    byte_range: Option<ByteRange>,
) -> CResult<ReadResult> {
    transactional_read(node, driver, mode, key, staleness_bound, byte_range).await
}

/// The source behind [`write_via_existing_transaction`]/[`write_via_transaction`]:
/// a literal value (or tombstone) to write back unconditionally, optionally
/// marked `non_retryable` so a generation conflict at commit is surfaced
/// rather than silently retried against a value that can never change.
struct LiteralValueSource {
    value: crate::driver::WriteValue,
    fail_on_mismatch: bool,
}

#[async_trait]
impl ReadModifyWriteSource for LiteralValueSource {
    async fn writeback(&self, _options: WritebackOptions) -> CResult<ReadResult> {
        let stamp = TimestampedGeneration::never_validated(Generation::Unspecified);
        Ok(match &self.value {
            Some(bytes) => ReadResult { state: ReadResultState::Value(bytes.clone()), stamp },
            None => ReadResult::missing(stamp),
        })
    }

    async fn revoke(&self) {}

    fn non_retryable(&self) -> bool {
        self.fail_on_mismatch
    }
}

/// Stages a literal write of `value` (`None` deletes the key) against an
/// already-open transaction node (spec §6 `write_via_existing_transaction`).
/// The write is not dispatched until the caller later drives `node`'s
/// commit; `fail_on_mismatch` controls whether a generation conflict at
/// that point is retried (by re-reading and reapplying the same literal
/// value) or surfaced immediately as [`Error::FailedPrecondition`].
pub fn write_via_existing_transaction(
    node: &MultiPhaseNode,
    key: Vec<u8>,
    value: crate::driver::WriteValue,
    fail_on_mismatch: bool,
) -> CResult<()> {
    let source = Arc::new(LiteralValueSource { value, fail_on_mismatch });
    node.add_read_modify_write(key, source)?;
    Ok(())
}

/// Wraps [`write_via_existing_transaction`] in a one-shot anonymous
/// transaction against a single phase (spec §6 `write_via_transaction`):
/// admits the literal write and immediately commits it, returning the
/// generation the driver assigned the new value.
pub async fn write_via_transaction(
    driver: &dyn Driver,
    key: Vec<u8>,
    value: crate::driver::WriteValue,
) -> CResult<TimestampedGeneration> {
    let node = MultiPhaseNode::new();
    write_via_existing_transaction(&node, key.clone(), value, false)?;
    commit_next_phase(&node, 0, driver, &CommitConfig::default()).await?;
    driver.read(&key, ReadOptions::default()).await.map(|r| r.stamp)
}

/// Lists keys through an open transaction. Only supported in
/// [`TransactionMode::REPEATABLE_READ`]-free mode: merging a transaction's
/// uncommitted range-deletes and writes into a driver-level key listing
/// while also holding a point-in-time snapshot is out of scope for this
/// layer (spec §6 Non-goals).
pub async fn transactional_list(
    node: &MultiPhaseNode,
    driver: &dyn Driver,
    mode: TransactionMode,
    options: ListOptions,
) -> CResult<Vec<ListEntry>> {
    if mode.contains(TransactionMode::REPEATABLE_READ) {
        return Err(Error::Unimplemented(
            "repeatable_read transactional_list is not supported".into(),
        ));
    }
    let mut entries = driver.list(options.clone()).await?;
    node.merge_uncommitted_listing(&mut entries, options.range.as_ref());
    Ok(entries)
}

/// What `transactional_read` finds covering a key in the virtual view,
/// before it has to touch the driver.
pub enum UncommittedEntry {
    /// An uncommitted RMW entry; ask this source for its writeback state.
    Rmw(Arc<dyn ReadModifyWriteSource>),
    /// The key falls under a live delete-range (spec §4.5 point 1: "return
    /// missing with the node's current stamp").
    Deleted,
}

impl MultiPhaseNode {
    /// Returns the uncommitted entry covering `key` in this node's virtual
    /// view, if any.
    pub fn uncommitted_entry(&self, key: &[u8]) -> Option<UncommittedEntry> {
        self.with_virtual_entry(key, |entry| match entry {
            Some(VirtualEntry::Rmw(e)) => Some(UncommittedEntry::Rmw(e.source.clone())),
            Some(VirtualEntry::Delete(_, _)) => Some(UncommittedEntry::Deleted),
            None => None,
        })
    }

    /// Adjusts a driver-provided listing to reflect this node's
    /// uncommitted writes and deletes: keys covered by a live delete are
    /// removed, and keys with an uncommitted write that weren't already
    /// present are inserted.
    pub fn merge_uncommitted_listing(&self, entries: &mut Vec<ListEntry>, range: Option<&KeyRange>) {
        self.for_each_virtual_entry(range, |key, entry| match entry {
            VirtualEntry::Rmw(_) => {
                if !entries.iter().any(|e| e.key == key) {
                    entries.push(ListEntry { key: key.to_vec(), size: 0 });
                }
            }
            VirtualEntry::Delete(_, exclusive_max) => {
                entries.retain(|e| {
                    !(e.key.as_slice() >= key && e.key.as_slice() < exclusive_max.as_slice())
                });
            }
        });
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.dedup_by(|a, b| a.key == b.key);
    }
}
