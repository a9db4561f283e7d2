//! The per-key mutation state for one transaction against one underlying
//! driver (spec §3 "multi-phase mutation tracker", §4.1, §4.6). This is the
//! Rust analogue of tensorstore's `MultiPhaseMutation`/`AtomicMultiPhaseMutation`
//! pair, translated per the Design Notes: an arena `Vec<Phase>` replaces the
//! intrusive phase ring, and a single `std::sync::Mutex` guards all of it
//! (critical sections here never cross an `.await`, matching the teacher's
//! own `Arc<Mutex<E>>` usage in its storage engine).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::{CResult, Error};
use crate::key_range::KeyRange;
use crate::mutation::entry::{
    writeback_error, DeleteRangeEntry, Flags, ReadModifyWriteEntry, SharedDeleteRange,
    VirtualEntry,
};
use crate::mutation::phase::Phase;
use crate::mutation::target::ReadModifyWriteSource;

/// Outcome of admitting a read-modify-write entry, reported back to the
/// caller so it can decide whether it needs to perform its own initial
/// read or can rely on the predecessor chain.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadModifyWriteStatus {
    /// The key had no prior entry in this transaction.
    CreatedFresh,
    /// The key had a prior entry, now linked as this one's `prev`.
    SupersededExisting,
    /// The key was covered by a delete-range; the new entry is
    /// `prev-deleted` and the range was split around it.
    SupersededDelete,
}

struct NodeState {
    virtual_view: BTreeMap<Vec<u8>, VirtualEntry>,
    phases: Vec<Phase>,
    aborted: bool,
}

impl NodeState {
    fn current_phase_index(&mut self) -> usize {
        if self.phases.is_empty() {
            self.phases.push(Phase::default());
        }
        self.phases.len() - 1
    }
}

/// Tracks every mutation staged against one driver within one transaction,
/// across however many commit phases the caller opens with `barrier`.
pub struct MultiPhaseNode {
    state: Mutex<NodeState>,
}

impl Default for MultiPhaseNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiPhaseNode {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NodeState {
                virtual_view: BTreeMap::new(),
                phases: Vec::new(),
                aborted: false,
            }),
        }
    }

    /// Opens a new phase. Entries admitted after this call are associated
    /// with the new phase until the next `barrier` call (or commit).
    pub fn barrier(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.phases.push(Phase::default());
        state.phases.len() - 1
    }

    pub fn phase_count(&self) -> usize {
        self.state.lock().unwrap().phases.len().max(1)
    }

    /// Admits a single-key read-modify-write entry (spec §4.1). Returns the
    /// admission outcome; the entry itself is retained internally and
    /// dispatched when its phase commits.
    pub fn add_read_modify_write(
        &self,
        key: Vec<u8>,
        source: Arc<dyn ReadModifyWriteSource>,
    ) -> CResult<ReadModifyWriteStatus> {
        let mut state = self.state.lock().unwrap();
        if state.aborted {
            return Err(Error::Cancelled);
        }
        let phase_index = state.current_phase_index();
        let entry = Box::new(ReadModifyWriteEntry::new(key.clone(), phase_index, source));
        Ok(self.admit_rmw(&mut state, key, entry))
    }

    /// Admits a `repeatable_read` validation entry for `key` (spec §4.5
    /// point 2): `pinned` is the result the caller's own read already
    /// observed (via [`crate::txn::transactional_read`] falling through to
    /// the driver). At commit this entry rewrites exactly that state,
    /// conditioned on `pinned`'s generation, so the commit fails with a
    /// generation mismatch if the key changed underneath the transaction.
    pub fn add_repeatable_read_validation(
        &self,
        key: Vec<u8>,
        pinned: crate::read_result::ReadResult,
    ) -> CResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.aborted {
            return Err(Error::Cancelled);
        }
        let phase_index = state.current_phase_index();
        let source: Arc<dyn ReadModifyWriteSource> = Arc::new(RepeatableReadValidator(pinned.clone()));
        let entry = Box::new(ReadModifyWriteEntry::new_pinned(key.clone(), phase_index, source, pinned));
        self.admit_rmw(&mut state, key, entry);
        Ok(())
    }

    /// Shared admission logic for a freshly constructed entry (spec
    /// §4.1 "insertion rules"): links it behind whatever already occupies
    /// `key` in the virtual view, absorbing/splitting a covering
    /// delete-range fragment as needed.
    fn admit_rmw(
        &self,
        state: &mut NodeState,
        key: Vec<u8>,
        mut entry: Box<ReadModifyWriteEntry>,
    ) -> ReadModifyWriteStatus {
        let status = match state.virtual_view.remove(&key) {
            None => ReadModifyWriteStatus::CreatedFresh,
            Some(VirtualEntry::Rmw(existing)) => {
                entry.prev = Some(existing);
                ReadModifyWriteStatus::SupersededExisting
            }
            Some(VirtualEntry::Delete(shared, fragment_max)) => {
                let absorbed = {
                    let mut d = shared.lock().unwrap();
                    d.superseded.remove(&key)
                };
                entry.prev = absorbed.map(Box::new);
                entry.flags.set(Flags::PREV_DELETED);
                self.reinsert_delete_fragment_excluding(state, shared, fragment_max, &key);
                ReadModifyWriteStatus::SupersededDelete
            }
        };
        state.virtual_view.insert(key, VirtualEntry::Rmw(entry));
        status
    }

    /// Admits a half-open range-delete entry (spec §4.1): absorbs any fully
    /// covered RMW entries into its `superseded` set, and coalesces with
    /// any overlapping delete-range fragments already present.
    pub fn add_delete_range(&self, range: KeyRange) -> CResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.aborted {
            return Err(Error::Cancelled);
        }
        let phase_index = state.current_phase_index();

        let KeyRange { inclusive_min, exclusive_max } = range;
        let exclusive_max = exclusive_max.unwrap_or_else(|| vec![0xff; 64]);

        let mut new_entry = DeleteRangeEntry::new(inclusive_min.clone(), exclusive_max.clone(), phase_index);

        // Collect every existing virtual-view key in [inclusive_min, exclusive_max).
        let overlapping: Vec<Vec<u8>> = state
            .virtual_view
            .range(inclusive_min.clone()..)
            .take_while(|(k, _)| k.as_slice() < exclusive_max.as_slice())
            .map(|(k, _)| k.clone())
            .collect();

        for key in overlapping {
            match state.virtual_view.remove(&key).unwrap() {
                VirtualEntry::Rmw(entry) => {
                    new_entry.superseded.insert(key, *entry);
                }
                VirtualEntry::Delete(shared, _fragment_max) => {
                    // Fully absorbed: migrate its superseded entries that
                    // fall within the new range; anything that belonged to
                    // an earlier phase and lies outside the new range is
                    // left for that phase's own (already-registered)
                    // dispatch to handle.
                    let mut old = shared.lock().unwrap();
                    let migrate: Vec<Vec<u8>> = old
                        .superseded
                        .range(inclusive_min.clone()..exclusive_max.clone())
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in migrate {
                        if let Some(e) = old.superseded.remove(&k) {
                            new_entry.superseded.insert(k, e);
                        }
                    }
                }
            }
        }

        let shared: SharedDeleteRange = Arc::new(Mutex::new(new_entry));
        state
            .virtual_view
            .insert(inclusive_min, VirtualEntry::Delete(shared.clone(), exclusive_max));
        state.phases[phase_index].pending_deletes.push(shared);
        Ok(())
    }

    /// Splits a delete-range fragment around `key`, reinserting the
    /// surviving sub-fragments (if non-empty) into the virtual view.
    fn reinsert_delete_fragment_excluding(
        &self,
        state: &mut NodeState,
        shared: SharedDeleteRange,
        fragment_max: Vec<u8>,
        key: &[u8],
    ) {
        let fragment_min = {
            let d = shared.lock().unwrap();
            d.inclusive_min.clone()
        };
        if fragment_min.as_slice() < key {
            state.virtual_view.insert(
                fragment_min,
                VirtualEntry::Delete(shared.clone(), key.to_vec()),
            );
        }
        let after = successor(key);
        if after.as_slice() < fragment_max.as_slice() {
            state
                .virtual_view
                .insert(after, VirtualEntry::Delete(shared, fragment_max));
        }
    }

    /// Relocates every virtual-view entry owned by `phase_index` into that
    /// phase's own storage (spec §4.4 step 1). Idempotent: a phase already
    /// relocated is left untouched.
    pub fn relocate_phase(&self, phase_index: usize) {
        let mut state = self.state.lock().unwrap();
        if state.phases[phase_index].relocated {
            return;
        }
        let owned_keys: Vec<Vec<u8>> = state
            .virtual_view
            .iter()
            .filter(|(_, v)| match v {
                VirtualEntry::Rmw(e) => e.phase_index == phase_index,
                VirtualEntry::Delete(_, _) => false,
            })
            .map(|(k, _)| k.clone())
            .collect();

        let mut rmw_entries = Vec::with_capacity(owned_keys.len());
        for key in owned_keys {
            if let Some(VirtualEntry::Rmw(entry)) = state.virtual_view.remove(&key) {
                rmw_entries.push(entry);
            }
        }

        let phase = &mut state.phases[phase_index];
        phase.rmw_entries = rmw_entries;
        phase.relocated = true;
    }

    /// Aborts the whole transaction: every outstanding entry in every phase
    /// is notified of [`Error::Cancelled`] and the node is marked so that
    /// no further admissions are accepted.
    pub async fn abort(&self) {
        self.abort_with(0, &Error::Cancelled).await
    }

    /// Aborts phases at index `from_phase_index` and later (spec §7: "a
    /// failed phase short-circuits remaining phases; they are aborted and
    /// destroyed"), notifying every entry still outstanding in them with
    /// `error`. Used by [`crate::mutation::commit::commit`] after a phase
    /// fails, to cancel the phases that never got a chance to dispatch.
    pub async fn abort_phases_from(&self, from_phase_index: usize, error: &Error) {
        self.abort_with(from_phase_index, error).await
    }

    async fn abort_with(&self, from_phase_index: usize, error: &Error) {
        let mut entries: Vec<Box<ReadModifyWriteEntry>> = {
            let mut state = self.state.lock().unwrap();
            state.aborted = true;
            let keys: Vec<Vec<u8>> = state
                .virtual_view
                .iter()
                .filter(|(_, v)| match v {
                    VirtualEntry::Rmw(e) => e.phase_index >= from_phase_index,
                    VirtualEntry::Delete(_, _) => false,
                })
                .map(|(k, _)| k.clone())
                .collect();
            let mut entries: Vec<Box<ReadModifyWriteEntry>> = keys
                .into_iter()
                .filter_map(|k| match state.virtual_view.remove(&k) {
                    Some(VirtualEntry::Rmw(e)) => Some(e),
                    _ => None,
                })
                .collect();
            let start = from_phase_index.min(state.phases.len());
            for phase in &mut state.phases[start..] {
                entries.extend(std::mem::take(&mut phase.rmw_entries));
            }
            entries
        };
        for entry in &mut entries {
            writeback_error(entry, error).await;
        }
    }

    /// Drops a fully-committed phase's storage. Called once
    /// `commit_next_phase` has observed the phase's counter reach zero.
    pub fn destroy_phase(&self, phase_index: usize) {
        let mut state = self.state.lock().unwrap();
        state.phases[phase_index].rmw_entries.clear();
        state.phases[phase_index].pending_deletes.clear();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().unwrap().aborted
    }

    /// Looks up the virtual-view entry covering `key` (an exact-match RMW
    /// entry, or a delete-range fragment containing it) and hands it to
    /// `f`, returning `None` to `f` if nothing covers `key`.
    pub fn with_virtual_entry<T>(
        &self,
        key: &[u8],
        f: impl FnOnce(Option<&VirtualEntry>) -> T,
    ) -> T {
        let state = self.state.lock().unwrap();
        match state.virtual_view.range(..=key.to_vec()).next_back() {
            Some((k, entry)) if k.as_slice() == key => f(Some(entry)),
            Some((_, entry @ VirtualEntry::Delete(_, max))) if key < max.as_slice() => f(Some(entry)),
            _ => f(None),
        }
    }

    /// Visits every virtual-view entry overlapping `range` (the whole view
    /// if `range` is `None`), in key order.
    pub fn for_each_virtual_entry(
        &self,
        range: Option<&KeyRange>,
        mut f: impl FnMut(&[u8], &VirtualEntry),
    ) {
        let state = self.state.lock().unwrap();
        for (key, entry) in state.virtual_view.iter() {
            if let Some(r) = range {
                let in_range = key.as_slice() >= r.inclusive_min.as_slice()
                    && match &r.exclusive_max {
                        Some(max) => key.as_slice() < max.as_slice(),
                        None => true,
                    };
                if !in_range {
                    continue;
                }
            }
            f(key, entry);
        }
    }

    /// Takes ownership of a relocated phase's entries and pending deletes
    /// for the duration of its commit dispatch.
    pub fn take_phase_contents(
        &self,
        phase_index: usize,
    ) -> (Vec<Box<ReadModifyWriteEntry>>, Vec<SharedDeleteRange>) {
        let mut state = self.state.lock().unwrap();
        let phase = &mut state.phases[phase_index];
        (std::mem::take(&mut phase.rmw_entries), std::mem::take(&mut phase.pending_deletes))
    }

    /// Restores a phase's entries after a failed commit attempt, so a
    /// retry or `abort` can still observe and notify them.
    pub fn put_back_phase_contents(
        &self,
        phase_index: usize,
        entries: Vec<Box<ReadModifyWriteEntry>>,
        deletes: Vec<SharedDeleteRange>,
    ) {
        let mut state = self.state.lock().unwrap();
        let phase = &mut state.phases[phase_index];
        phase.rmw_entries = entries;
        phase.pending_deletes = deletes;
    }

    /// Removes and returns every surviving fragment of `target` still
    /// present in the virtual view, as `(inclusive_min, exclusive_max)`
    /// pairs. Called once per delete entry at commit dispatch time.
    pub fn take_delete_fragments(&self, target: &SharedDeleteRange) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut state = self.state.lock().unwrap();
        let keys: Vec<Vec<u8>> = state
            .virtual_view
            .iter()
            .filter(|(_, v)| matches!(v, VirtualEntry::Delete(d, _) if Arc::ptr_eq(d, target)))
            .map(|(k, _)| k.clone())
            .collect();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(VirtualEntry::Delete(_, max)) = state.virtual_view.remove(&key) {
                out.push((key, max));
            }
        }
        out
    }
}

fn successor(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    out.push(0);
    out
}

/// The source behind a `repeatable_read` validation entry: its `writeback`
/// just reproduces the pinned read verbatim, turning commit dispatch into a
/// blind rewrite of the same bytes conditioned on the pinned generation.
struct RepeatableReadValidator(crate::read_result::ReadResult);

#[async_trait::async_trait]
impl ReadModifyWriteSource for RepeatableReadValidator {
    async fn writeback(
        &self,
        _options: crate::read_result::WritebackOptions,
    ) -> CResult<crate::read_result::ReadResult> {
        Ok(self.0.clone())
    }

    async fn revoke(&self) {}
}
