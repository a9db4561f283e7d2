//! The commit state machine (spec §4.4): drives one phase's entries to
//! completion against a [`Driver`], either as independent conditional
//! writes (`NonAtomicCommit`) or as a single atomic batch (`AtomicCommit`).

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::CommitConfig;
use crate::driver::{AtomicBatch, AtomicBatchDelete, AtomicBatchWrite, Driver};
use crate::error::CResult;
use crate::generation::StalenessBound;
use crate::key_range::KeyRange;
use crate::mutation::entry::{writeback_error, Flags, ReadModifyWriteEntry, SharedDeleteRange};
use crate::mutation::node::MultiPhaseNode;
use crate::mutation::target::{ReadModifyWriteSource, ReadModifyWriteTarget};
use crate::read_result::{
    ReadModifyWriteReadOptions, ReadOptions, ReadResult, ReadResultState, WriteOptions,
    WritebackOptions,
};

/// Adapts one [`ReadModifyWriteEntry`] plus the driver it commits against
/// into the [`ReadModifyWriteTarget`] its source expects: reads fall
/// through to the predecessor's writeback, or to the driver directly at
/// the head of a chain.
struct EntryTarget<'a> {
    entry: &'a ReadModifyWriteEntry,
    driver: &'a dyn Driver,
}

#[async_trait]
impl<'a> ReadModifyWriteTarget for EntryTarget<'a> {
    async fn read(&self, options: ReadModifyWriteReadOptions) -> CResult<ReadResult> {
        if let Some(pinned) = &self.entry.pinned_read {
            return Ok(pinned.clone());
        }
        if self.entry.is_prev_deleted() {
            return Ok(ReadResult::synthesize_missing());
        }
        if let Some(prev) = &self.entry.prev {
            return prev
                .source
                .writeback(WritebackOptions {
                    staleness_bound: options.staleness_bound,
                    byte_range: options.byte_range,
                })
                .await;
        }
        self.driver
            .read(
                &self.entry.key,
                ReadOptions {
                    staleness_bound: options
                        .staleness_bound
                        .unwrap_or_else(StalenessBound::unbounded),
                    byte_range: options.byte_range,
                    ..Default::default()
                },
            )
            .await
    }

    async fn reads_committed(&self) -> bool {
        self.entry.prev.is_none()
    }
}

/// Resolves `entry`'s current state (via its predecessor chain or the
/// driver) and its source's desired writeback state.
async fn resolve(
    entry: &ReadModifyWriteEntry,
    driver: &dyn Driver,
) -> CResult<(ReadResult, ReadResult)> {
    let target = EntryTarget { entry, driver };
    let current = target.read(ReadModifyWriteReadOptions::default()).await?;
    let desired = entry.source.writeback(WritebackOptions::default()).await?;
    Ok((current, desired))
}

/// Collects every source along `entry`'s predecessor chain, oldest last.
/// Purely synchronous, so it never holds a borrow across an `.await`.
fn source_chain(entry: &ReadModifyWriteEntry) -> Vec<Arc<dyn ReadModifyWriteSource>> {
    let mut out = Vec::new();
    let mut current = Some(entry);
    while let Some(e) = current {
        out.push(e.source.clone());
        current = e.prev.as_deref();
    }
    out
}

/// Notifies every source along a superseded entry's chain that its value
/// was discarded by an enclosing delete, surfacing whatever error (if any)
/// a link in the chain carries.
async fn validate_superseded_chains(delete: &SharedDeleteRange) -> CResult<()> {
    let chains: Vec<Vec<Arc<dyn ReadModifyWriteSource>>> = {
        let d = delete.lock().unwrap();
        d.superseded.values().map(source_chain).collect()
    };
    for chain in chains {
        for source in chain {
            source.writeback(WritebackOptions::default()).await?;
        }
    }
    Ok(())
}

/// Drives a single RMW entry to completion with independent conditional
/// writes, retrying on a generation mismatch up to `config.max_retries`
/// times unless the entry is marked non-retryable (spec §4.4 "Non-atomic").
pub struct NonAtomicCommit<'a> {
    pub driver: &'a dyn Driver,
    pub config: &'a CommitConfig,
}

impl<'a> NonAtomicCommit<'a> {
    pub async fn commit_entry(&self, entry: &mut ReadModifyWriteEntry) -> CResult<()> {
        let mut attempt = 0;
        loop {
            let (current, desired) = resolve(entry, self.driver).await?;
            let value = match desired.state {
                ReadResultState::Unspecified => {
                    entry.flags.set(Flags::WRITEBACK_PROVIDED);
                    return Ok(());
                }
                ReadResultState::Missing => None,
                ReadResultState::Value(bytes) => Some(bytes),
            };
            let write_options = WriteOptions { if_equal: Some(current.stamp.generation.clone()) };
            match self.driver.write(&entry.key, value, write_options).await {
                Ok(_) => {
                    entry.flags.set(Flags::WRITEBACK_PROVIDED);
                    return Ok(());
                }
                Err(e) if e.is_generation_mismatch() && !entry.non_retryable() => {
                    attempt += 1;
                    if attempt >= self.config.max_retries {
                        return Err(crate::error::Error::Aborted(format!(
                            "commit exceeded {} retries: {e}",
                            self.config.max_retries
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn commit_delete(&self, node: &MultiPhaseNode, delete: &SharedDeleteRange) -> CResult<()> {
        let fragments = node.take_delete_fragments(delete);
        for (lo, hi) in fragments {
            self.driver.delete_range(KeyRange::new(lo, hi)).await?;
        }
        validate_superseded_chains(delete).await
    }
}

/// Drives every RMW entry and delete-range in a phase to completion as one
/// atomic batch (spec §4.4 "Atomic"): buffer every writeback first, then
/// submit a single conditioned batch, retrying the whole batch on a
/// generation mismatch.
pub struct AtomicCommit<'a> {
    pub driver: &'a dyn Driver,
    pub config: &'a CommitConfig,
}

impl<'a> AtomicCommit<'a> {
    pub async fn commit_phase(
        &self,
        node: &MultiPhaseNode,
        entries: &mut [Box<ReadModifyWriteEntry>],
        deletes: &[SharedDeleteRange],
    ) -> CResult<()> {
        let mut attempt = 0;
        loop {
            // Each entry's current/desired state is independent of every
            // other entry's in the same phase, so resolve them concurrently
            // rather than one at a time; only the batch submission itself
            // needs to happen as a single call.
            let resolved = futures::future::try_join_all(
                entries.iter().map(|entry| resolve(entry, self.driver)),
            )
            .await?;

            let mut batch = AtomicBatch::default();
            for (entry, (current, desired)) in entries.iter().zip(resolved) {
                if let ReadResultState::Unspecified = desired.state {
                    continue;
                }
                batch.writes.push(AtomicBatchWrite {
                    key: entry.key.clone(),
                    value: desired.state.value().cloned(),
                    if_equal: current.stamp.generation,
                });
            }
            for delete in deletes {
                for (lo, hi) in node.take_delete_fragments(delete) {
                    batch.deletes.push(AtomicBatchDelete { range: KeyRange::new(lo, hi) });
                }
            }
            if batch.is_empty() {
                for entry in entries.iter_mut() {
                    entry.flags.set(Flags::WRITEBACK_PROVIDED);
                }
                for delete in deletes {
                    validate_superseded_chains(delete).await?;
                }
                return Ok(());
            }
            let has_non_retryable = entries.iter().any(|e| e.non_retryable());
            match self.driver.atomic_write_batch(batch).await {
                Ok(()) => {
                    for entry in entries.iter_mut() {
                        entry.flags.set(Flags::WRITEBACK_PROVIDED);
                    }
                    for delete in deletes {
                        validate_superseded_chains(delete).await?;
                    }
                    return Ok(());
                }
                // A non-retryable entry can't offer a different writeback
                // result on a fresh read, so there is no point re-batching:
                // surface the conflict as `aborted` immediately (spec §7).
                Err(e) if e.is_generation_mismatch() && has_non_retryable => {
                    return Err(crate::error::Error::Aborted(format!(
                        "atomic commit conflicted with a non-retryable entry: {e}"
                    )));
                }
                Err(e) if e.is_generation_mismatch() => {
                    attempt += 1;
                    if attempt >= self.config.max_atomic_retries {
                        return Err(crate::error::Error::Aborted(format!(
                            "atomic commit exceeded {} retries: {e}",
                            self.config.max_atomic_retries
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Commits the phase at `phase_index` to completion: relocates its
/// entries out of the node's virtual view, dispatches them (atomically if
/// the driver supports it, independently otherwise), and either destroys
/// the phase's storage on success or notifies every entry's source of the
/// failure (spec §4.4, §4.7).
pub async fn commit_next_phase(
    node: &MultiPhaseNode,
    phase_index: usize,
    driver: &dyn Driver,
    config: &CommitConfig,
) -> CResult<()> {
    node.relocate_phase(phase_index);

    let (mut entries, deletes) = node.take_phase_contents(phase_index);

    let result = if driver.supports_atomic_batch() {
        let r = AtomicCommit { driver, config }
            .commit_phase(node, &mut entries, &deletes)
            .await;
        // An atomic batch fails or succeeds as a whole, so on failure every
        // entry in the batch needs the same notification a per-entry
        // non-atomic failure gives its own entry (spec §4.4 "atomic commit
        // cancels remaining work in the phase").
        if let Err(e) = &r {
            for entry in entries.iter_mut() {
                writeback_error(entry, e).await;
            }
        }
        r
    } else {
        let committer = NonAtomicCommit { driver, config };
        let mut first_error = None;
        for entry in entries.iter_mut() {
            if let Err(e) = committer.commit_entry(entry).await {
                writeback_error(entry, &e).await;
                first_error.get_or_insert(e);
            }
        }
        for delete in &deletes {
            if let Err(e) = committer.commit_delete(node, delete).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    };

    match &result {
        Ok(()) => node.destroy_phase(phase_index),
        Err(e) => {
            node.put_back_phase_contents(phase_index, entries, deletes);
            log::error!("phase {phase_index} commit failed: {e}");
        }
    }
    result
}

/// Commits every phase of `node` in order (spec §4.4 "Iterate the phase
/// ring"): phase N+1 is never dispatched until phase N's commit has
/// resolved. A failed phase short-circuits the rest — the remaining phases
/// are aborted (their entries notified via the same path as
/// [`MultiPhaseNode::abort`]) rather than dispatched, and the first error is
/// surfaced to the caller.
pub async fn commit(
    node: &MultiPhaseNode,
    driver: &dyn Driver,
    config: &CommitConfig,
) -> CResult<()> {
    let phase_count = node.phase_count();
    for phase_index in 0..phase_count {
        if let Err(e) = commit_next_phase(node, phase_index, driver, config).await {
            node.abort_phases_from(phase_index + 1, &e).await;
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryDriver;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StaticSource(bytes::Bytes);

    #[async_trait]
    impl ReadModifyWriteSource for StaticSource {
        async fn writeback(&self, _options: WritebackOptions) -> CResult<ReadResult> {
            Ok(ReadResult::value(self.0.clone(), Default::default()))
        }
        async fn revoke(&self) {}
    }

    /// A driver whose `write` fails with a generation mismatch for the
    /// first `n` calls, then succeeds. Models property #5: if the
    /// underlying generation eventually stabilizes, atomic and non-atomic
    /// commit both converge within a bounded number of retries.
    struct FlakyWriteDriver {
        inner: MemoryDriver,
        failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl Driver for FlakyWriteDriver {
        async fn read(&self, key: &[u8], options: crate::read_result::ReadOptions) -> CResult<ReadResult> {
            self.inner.read(key, options).await
        }
        async fn write(
            &self,
            key: &[u8],
            value: Option<bytes::Bytes>,
            options: crate::read_result::WriteOptions,
        ) -> CResult<crate::generation::TimestampedGeneration> {
            if self.failures_remaining.load(Ordering::Relaxed) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::Relaxed);
                return Err(crate::error::Error::FailedPrecondition("stale generation".into()));
            }
            self.inner.write(key, value, options).await
        }
        async fn delete_range(&self, range: KeyRange) -> CResult<()> {
            self.inner.delete_range(range).await
        }
        async fn list(&self, options: crate::driver::ListOptions) -> CResult<Vec<crate::driver::ListEntry>> {
            self.inner.list(options).await
        }
    }

    #[tokio::test]
    async fn non_atomic_retry_converges_within_bound() {
        let driver = FlakyWriteDriver { inner: MemoryDriver::new_non_atomic(), failures_remaining: AtomicU32::new(2) };
        let mut entry = ReadModifyWriteEntry::new(
            b"k".to_vec(),
            0,
            Arc::new(StaticSource(bytes::Bytes::from_static(b"v"))),
        );
        let config = CommitConfig { max_retries: 5, ..CommitConfig::default() };
        let committer = NonAtomicCommit { driver: &driver, config: &config };

        committer.commit_entry(&mut entry).await.unwrap();

        assert!(entry.flags.get(Flags::WRITEBACK_PROVIDED));
        let result = driver.read(b"k", Default::default()).await.unwrap();
        assert_eq!(result.state, ReadResultState::Value(bytes::Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn non_atomic_retry_exhaustion_surfaces_error() {
        let driver = FlakyWriteDriver { inner: MemoryDriver::new_non_atomic(), failures_remaining: AtomicU32::new(10) };
        let mut entry = ReadModifyWriteEntry::new(
            b"k".to_vec(),
            0,
            Arc::new(StaticSource(bytes::Bytes::from_static(b"v"))),
        );
        let config = CommitConfig { max_retries: 3, ..CommitConfig::default() };
        let committer = NonAtomicCommit { driver: &driver, config: &config };

        let result = committer.commit_entry(&mut entry).await;
        assert!(result.is_err());
        assert!(!entry.flags.get(Flags::WRITEBACK_PROVIDED));
    }

    #[tokio::test]
    async fn commit_next_phase_notifies_source_on_failure() {
        let driver = FlakyWriteDriver { inner: MemoryDriver::new_non_atomic(), failures_remaining: AtomicU32::new(10) };
        let node = MultiPhaseNode::new();
        node.add_read_modify_write(b"k".to_vec(), Arc::new(StaticSource(bytes::Bytes::from_static(b"v"))))
            .unwrap();
        let config = CommitConfig { max_retries: 2, ..CommitConfig::default() };

        let result = commit_next_phase(&node, 0, &driver, &config).await;
        assert!(result.is_err());
    }

    struct RevokeCountingSource(bytes::Bytes, Arc<AtomicU32>);

    #[async_trait]
    impl ReadModifyWriteSource for RevokeCountingSource {
        async fn writeback(&self, _options: WritebackOptions) -> CResult<ReadResult> {
            Ok(ReadResult::value(self.0.clone(), Default::default()))
        }
        async fn revoke(&self) {
            self.1.fetch_add(1, Ordering::Relaxed);
        }
        fn non_retryable(&self) -> bool {
            true
        }
    }

    /// A driver whose `atomic_write_batch` always fails with a generation
    /// mismatch, modeling a batch that conflicted with a concurrent writer.
    struct AlwaysConflictingDriver(MemoryDriver);

    #[async_trait]
    impl Driver for AlwaysConflictingDriver {
        async fn read(&self, key: &[u8], options: crate::read_result::ReadOptions) -> CResult<ReadResult> {
            self.0.read(key, options).await
        }
        async fn write(
            &self,
            key: &[u8],
            value: Option<bytes::Bytes>,
            options: WriteOptions,
        ) -> CResult<crate::generation::TimestampedGeneration> {
            self.0.write(key, value, options).await
        }
        async fn delete_range(&self, range: KeyRange) -> CResult<()> {
            self.0.delete_range(range).await
        }
        async fn list(&self, options: crate::driver::ListOptions) -> CResult<Vec<crate::driver::ListEntry>> {
            self.0.list(options).await
        }
        fn supports_atomic_batch(&self) -> bool {
            true
        }
        async fn atomic_write_batch(&self, _batch: AtomicBatch) -> CResult<()> {
            Err(crate::error::Error::FailedPrecondition("conflicting write landed first".into()))
        }
    }

    #[tokio::test]
    async fn atomic_failure_notifies_every_entry_in_the_batch() {
        let revoked = Arc::new(AtomicU32::new(0));
        let driver = AlwaysConflictingDriver(MemoryDriver::new());
        let node = MultiPhaseNode::new();
        node.add_read_modify_write(
            b"a".to_vec(),
            Arc::new(RevokeCountingSource(bytes::Bytes::from_static(b"1"), revoked.clone())),
        )
        .unwrap();
        node.add_read_modify_write(
            b"b".to_vec(),
            Arc::new(RevokeCountingSource(bytes::Bytes::from_static(b"2"), revoked.clone())),
        )
        .unwrap();

        let config = CommitConfig::default();
        let result = commit_next_phase(&node, 0, &driver, &config).await;
        assert!(result.is_err());
        assert_eq!(revoked.load(Ordering::Relaxed), 2, "both entries in the aborted batch must be revoked");
    }

    #[tokio::test]
    async fn commit_runs_phases_in_order_and_aborts_the_rest_on_failure() {
        let driver = AlwaysConflictingDriver(MemoryDriver::new());
        let node = MultiPhaseNode::new();
        let revoked = Arc::new(AtomicU32::new(0));
        node.add_read_modify_write(
            b"a".to_vec(),
            Arc::new(RevokeCountingSource(bytes::Bytes::from_static(b"1"), revoked.clone())),
        )
        .unwrap();
        node.barrier();
        node.add_read_modify_write(
            b"b".to_vec(),
            Arc::new(RevokeCountingSource(bytes::Bytes::from_static(b"2"), revoked.clone())),
        )
        .unwrap();

        let result = super::commit(&node, &driver, &CommitConfig::default()).await;
        assert!(result.is_err());
        // The first phase's entry gets notified when its own batch fails;
        // the second phase's entry, never dispatched, gets notified by
        // `abort_phases_from` instead. Either way each fires exactly once.
        assert_eq!(revoked.load(Ordering::Relaxed), 2);
    }
}
