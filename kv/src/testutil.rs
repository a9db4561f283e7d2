//! An in-memory [`Driver`], grounded in the teacher's own `Memory` storage
//! engine (its `storage::memory::Memory`): a `BTreeMap` guarded by a
//! `std::sync::Mutex`, generalized here to the async `Driver` contract with
//! per-key generation tracking so the mutation layer's optimistic-
//! concurrency paths have something real to exercise in tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::driver::{AtomicBatch, Driver, ListEntry, ListOptions};
use crate::error::{CResult, Error};
use crate::generation::{Generation, TimestampedGeneration};
use crate::key_range::KeyRange;
use crate::read_result::{ReadOptions, ReadResult, WriteOptions};

struct Slot {
    value: Option<Bytes>,
    generation: u64,
}

/// A single-process, in-memory [`Driver`] backed by a `BTreeMap`. Supports
/// atomic batches, so it exercises both halves of the commit state machine
/// depending on which tests construct it with `supports_atomic_batch`
/// forced off.
pub struct MemoryDriver {
    data: Mutex<BTreeMap<Vec<u8>, Slot>>,
    next_generation: AtomicU64,
    atomic: bool,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self { data: Mutex::new(BTreeMap::new()), next_generation: AtomicU64::new(1), atomic: true }
    }

    /// A driver that reports no atomic-batch support, forcing the commit
    /// state machine down the per-key conditional-write path.
    pub fn new_non_atomic() -> Self {
        Self { atomic: false, ..Self::new() }
    }

    fn generation_of(slot: Option<&Slot>) -> Generation {
        match slot {
            None => Generation::NoValue,
            Some(s) => Generation::Value(s.generation.to_be_bytes().to_vec()),
        }
    }

    fn next_gen(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn read(&self, key: &[u8], _options: ReadOptions) -> CResult<ReadResult> {
        let data = self.data.lock().unwrap();
        let slot = data.get(key);
        let generation = Self::generation_of(slot);
        let stamp = TimestampedGeneration::new(generation, std::time::SystemTime::now());
        match slot.and_then(|s| s.value.clone()) {
            Some(value) => Ok(ReadResult::value(value, stamp)),
            None => Ok(ReadResult::missing(stamp)),
        }
    }

    async fn write(
        &self,
        key: &[u8],
        value: Option<Bytes>,
        options: WriteOptions,
    ) -> CResult<TimestampedGeneration> {
        let mut data = self.data.lock().unwrap();
        if let Some(expected) = &options.if_equal {
            let actual = Self::generation_of(data.get(key));
            if !expected.matches(&actual) {
                return Err(Error::FailedPrecondition(format!(
                    "generation mismatch on {:?}",
                    String::from_utf8_lossy(key)
                )));
            }
        }
        let generation = self.next_gen();
        match value {
            Some(v) => {
                data.insert(key.to_vec(), Slot { value: Some(v), generation });
            }
            None => {
                data.insert(key.to_vec(), Slot { value: None, generation });
            }
        }
        Ok(TimestampedGeneration::new(
            Generation::Value(generation.to_be_bytes().to_vec()),
            std::time::SystemTime::now(),
        ))
    }

    async fn delete_range(&self, range: KeyRange) -> CResult<()> {
        let mut data = self.data.lock().unwrap();
        let keys: Vec<Vec<u8>> = data
            .range(range.inclusive_min.clone()..)
            .take_while(|(k, _)| match &range.exclusive_max {
                Some(max) => k.as_slice() < max.as_slice(),
                None => true,
            })
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            data.remove(&k);
        }
        Ok(())
    }

    async fn list(&self, options: ListOptions) -> CResult<Vec<ListEntry>> {
        let data = self.data.lock().unwrap();
        let range = options.range.unwrap_or_else(|| KeyRange::starting_at(Vec::new()));
        Ok(data
            .range(range.inclusive_min.clone()..)
            .take_while(|(k, _)| match &range.exclusive_max {
                Some(max) => k.as_slice() < max.as_slice(),
                None => true,
            })
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(k, slot)| ListEntry {
                key: k[options.strip_prefix_length.min(k.len())..].to_vec(),
                size: slot.value.as_ref().map(|v| v.len() as u64).unwrap_or(0),
            })
            .collect())
    }

    fn supports_atomic_batch(&self) -> bool {
        self.atomic
    }

    async fn atomic_write_batch(&self, batch: AtomicBatch) -> CResult<()> {
        let mut data = self.data.lock().unwrap();
        for write in &batch.writes {
            let actual = Self::generation_of(data.get(&write.key));
            if !write.if_equal.matches(&actual) {
                return Err(Error::FailedPrecondition(format!(
                    "generation mismatch on {:?}",
                    String::from_utf8_lossy(&write.key)
                )));
            }
        }
        for write in batch.writes {
            let generation = self.next_gen();
            data.insert(write.key, Slot { value: write.value, generation });
        }
        for delete in batch.deletes {
            let keys: Vec<Vec<u8>> = data
                .range(delete.range.inclusive_min.clone()..)
                .take_while(|(k, _)| match &delete.range.exclusive_max {
                    Some(max) => k.as_slice() < max.as_slice(),
                    None => true,
                })
                .map(|(k, _)| k.clone())
                .collect();
            for k in keys {
                data.remove(&k);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let driver = MemoryDriver::new();
        driver
            .write(b"a", Some(Bytes::from_static(b"1")), WriteOptions::default())
            .await
            .unwrap();
        let result = driver.read(b"a", ReadOptions::default()).await.unwrap();
        assert_eq!(result.state.value().unwrap().as_ref(), b"1");
    }

    #[tokio::test]
    async fn conditional_write_rejects_stale_generation() {
        let driver = MemoryDriver::new();
        driver
            .write(b"a", Some(Bytes::from_static(b"1")), WriteOptions::default())
            .await
            .unwrap();
        let stale = Generation::NoValue;
        let result = driver
            .write(b"a", Some(Bytes::from_static(b"2")), WriteOptions { if_equal: Some(stale) })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delete_range_removes_covered_keys() {
        let driver = MemoryDriver::new();
        for key in [b"a".as_slice(), b"b", b"c"] {
            driver.write(key, Some(Bytes::from_static(b"x")), WriteOptions::default()).await.unwrap();
        }
        driver.delete_range(KeyRange::new(b"a".to_vec(), b"c".to_vec())).await.unwrap();
        let remaining = driver.list(ListOptions::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, b"c");
    }
}
