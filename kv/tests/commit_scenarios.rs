//! End-to-end commit scenarios (S1-S6), exercising the full state machine
//! in `kv::mutation::commit` against `kv::testutil::MemoryDriver`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use kv::config::CommitConfig;
use kv::driver::{AtomicBatch, Driver, ListEntry, ListOptions};
use kv::error::{CResult, Error};
use kv::generation::{Generation, TimestampedGeneration};
use kv::key_range::KeyRange;
use kv::mutation::commit::commit_next_phase;
use kv::mutation::entry::{Flags, VirtualEntry};
use kv::mutation::node::MultiPhaseNode;
use kv::mutation::target::ReadModifyWriteSource;
use kv::read_result::{ReadOptions, ReadResult, WriteOptions, WritebackOptions};
use kv::testutil::MemoryDriver;

/// An RMW source that always writes back a fixed value, for tests that
/// only care about the commit state machine, not source-side logic.
struct StaticSource {
    value: Bytes,
    non_retryable: bool,
}

impl StaticSource {
    fn new(value: &'static [u8]) -> Arc<Self> {
        Arc::new(Self { value: Bytes::from_static(value), non_retryable: false })
    }

    fn non_retryable(value: &'static [u8]) -> Arc<Self> {
        Arc::new(Self { value: Bytes::from_static(value), non_retryable: true })
    }
}

#[async_trait]
impl ReadModifyWriteSource for StaticSource {
    async fn writeback(&self, _options: WritebackOptions) -> CResult<ReadResult> {
        Ok(ReadResult::value(self.value.clone(), TimestampedGeneration::never_validated(Generation::Unspecified)))
    }

    async fn revoke(&self) {}

    fn non_retryable(&self) -> bool {
        self.non_retryable
    }
}

/// Wraps a [`MemoryDriver`] and reports a stale generation on the first
/// `stale_reads` calls to `read`, so a conditional `write` immediately
/// following it observes a generation mismatch against the real store —
/// modeling a concurrent writer that landed between the transaction's
/// initial read and its commit.
struct FlakyReadDriver {
    inner: MemoryDriver,
    stale_reads_remaining: AtomicU32,
}

impl FlakyReadDriver {
    fn new(inner: MemoryDriver, stale_reads: u32) -> Self {
        Self { inner, stale_reads_remaining: AtomicU32::new(stale_reads) }
    }
}

#[async_trait]
impl Driver for FlakyReadDriver {
    async fn read(&self, key: &[u8], options: ReadOptions) -> CResult<ReadResult> {
        let result = self.inner.read(key, options).await?;
        let remaining = self.stale_reads_remaining.load(Ordering::Relaxed);
        if remaining > 0 {
            self.stale_reads_remaining.fetch_sub(1, Ordering::Relaxed);
            return Ok(ReadResult { state: result.state, stamp: TimestampedGeneration::never_validated(Generation::NoValue) });
        }
        Ok(result)
    }

    async fn write(&self, key: &[u8], value: Option<Bytes>, options: WriteOptions) -> CResult<TimestampedGeneration> {
        self.inner.write(key, value, options).await
    }

    async fn delete_range(&self, range: KeyRange) -> CResult<()> {
        self.inner.delete_range(range).await
    }

    async fn list(&self, options: ListOptions) -> CResult<Vec<ListEntry>> {
        self.inner.list(options).await
    }

    fn supports_atomic_batch(&self) -> bool {
        self.inner.supports_atomic_batch()
    }

    async fn atomic_write_batch(&self, batch: AtomicBatch) -> CResult<()> {
        self.inner.atomic_write_batch(batch).await
    }
}

/// S1: non-atomic driver, single RMW, expect a plain write and success.
#[tokio::test]
async fn s1_non_atomic_single_write() {
    let driver = MemoryDriver::new_non_atomic();
    let node = MultiPhaseNode::new();
    node.add_read_modify_write(b"a".to_vec(), StaticSource::new(b"1")).unwrap();

    commit_next_phase(&node, 0, &driver, &CommitConfig::default()).await.unwrap();

    let result = driver.read(b"a", ReadOptions::default()).await.unwrap();
    assert_eq!(result.state.value().unwrap().as_ref(), b"1");
}

/// S2: non-atomic driver, two independent keys in one phase; both land
/// regardless of dispatch order.
#[tokio::test]
async fn s2_non_atomic_two_independent_writes() {
    let driver = MemoryDriver::new_non_atomic();
    let node = MultiPhaseNode::new();
    node.add_read_modify_write(b"a".to_vec(), StaticSource::new(b"1")).unwrap();
    node.add_read_modify_write(b"b".to_vec(), StaticSource::new(b"2")).unwrap();

    commit_next_phase(&node, 0, &driver, &CommitConfig::default()).await.unwrap();

    let a = driver.read(b"a", ReadOptions::default()).await.unwrap();
    let b = driver.read(b"b", ReadOptions::default()).await.unwrap();
    assert_eq!(a.state.value().unwrap().as_ref(), b"1");
    assert_eq!(b.state.value().unwrap().as_ref(), b"2");
}

/// S3: atomic driver, a delete-range admitted before an RMW it covers —
/// the RMW splits the range and wins for its own key in the single batch.
#[tokio::test]
async fn s3_atomic_write_wins_over_covering_delete() {
    let driver = MemoryDriver::new();
    driver.write(b"b", Some(Bytes::from_static(b"old")), WriteOptions::default()).await.unwrap();
    let node = MultiPhaseNode::new();
    node.add_delete_range(KeyRange::new(b"a".to_vec(), b"c".to_vec())).unwrap();
    node.add_read_modify_write(b"a".to_vec(), StaticSource::new(b"1")).unwrap();

    commit_next_phase(&node, 0, &driver, &CommitConfig::default()).await.unwrap();

    let a = driver.read(b"a", ReadOptions::default()).await.unwrap();
    assert_eq!(a.state.value().unwrap().as_ref(), b"1");
    let b = driver.read(b"b", ReadOptions::default()).await.unwrap();
    assert!(b.state.is_missing(), "b fell within the delete range and should be gone");
}

/// S4: optimistic-conflict retry — the first dispatch attempt observes a
/// stale generation and the conditional write is rejected; the commit
/// re-reads and retries, succeeding on the second attempt.
#[tokio::test]
async fn s4_retries_once_on_generation_mismatch() {
    let inner = MemoryDriver::new_non_atomic();
    inner.write(b"k", Some(Bytes::from_static(b"old")), WriteOptions::default()).await.unwrap();
    let driver = FlakyReadDriver::new(inner, 1);
    let node = MultiPhaseNode::new();
    node.add_read_modify_write(b"k".to_vec(), StaticSource::new(b"v")).unwrap();

    commit_next_phase(&node, 0, &driver, &CommitConfig::default()).await.unwrap();

    let result = driver.read(b"k", ReadOptions::default()).await.unwrap();
    assert_eq!(result.state.value().unwrap().as_ref(), b"v");
}

/// S5: same stale-generation setup as S4, but the source is non-retryable
/// — the commit must surface the generation mismatch instead of retrying.
#[tokio::test]
async fn s5_non_retryable_surfaces_failed_precondition() {
    let inner = MemoryDriver::new_non_atomic();
    inner.write(b"k", Some(Bytes::from_static(b"old")), WriteOptions::default()).await.unwrap();
    let driver = FlakyReadDriver::new(inner, 1);
    let node = MultiPhaseNode::new();
    node.add_read_modify_write(b"k".to_vec(), StaticSource::non_retryable(b"v")).unwrap();

    let result = commit_next_phase(&node, 0, &driver, &CommitConfig::default()).await;

    assert!(matches!(result, Err(Error::FailedPrecondition(_))));
}

/// S6: a delete-range admitted first, then an RMW inside it in the same
/// phase — the virtual view holds two placeholder fragments plus the new
/// RMW, and the RMW's input read is synthesized as missing.
#[tokio::test]
async fn s6_delete_then_write_splits_into_placeholders() {
    let node = MultiPhaseNode::new();
    node.add_delete_range(KeyRange::new(b"a".to_vec(), b"z".to_vec())).unwrap();
    node.add_read_modify_write(b"m".to_vec(), StaticSource::new(b"x")).unwrap();

    let mut seen = Vec::new();
    node.for_each_virtual_entry(None, |key, entry| {
        seen.push((key.to_vec(), matches!(entry, VirtualEntry::Rmw(_))));
    });
    seen.sort();

    assert_eq!(seen.len(), 3, "expected two delete placeholders plus the RMW, got {seen:?}");
    let rmw_count = seen.iter().filter(|(_, is_rmw)| *is_rmw).count();
    assert_eq!(rmw_count, 1);

    node.with_virtual_entry(b"m", |entry| match entry {
        Some(VirtualEntry::Rmw(e)) => {
            assert!(e.flags.get(Flags::PREV_DELETED), "RMW over a delete must carry prev-deleted");
        }
        _ => panic!("expected an RMW entry at \"m\""),
    });
}
