//! A single commit phase: the arena-indexed replacement for the intrusive
//! doubly-linked phase ring (spec §4.1, Design Notes in `SPEC_FULL.md`).

use crate::mutation::entry::{ReadModifyWriteEntry, SharedDeleteRange};

/// One phase's share of a transaction's mutations. Entries are relocated
/// here out of the node's virtual view when this phase's commit begins;
/// delete-range entries are recorded here at admission time instead, since
/// a `DeleteRangeEntry`'s owning phase never changes once created.
///
/// Completion accounting has no counter of its own: `commit_next_phase`
/// dispatches every entry and delete in this phase with a plain sequential
/// loop (see `SPEC_FULL.md` §5), so "this phase is done" is just "the loop
/// returned" rather than a decrement-to-zero condition a separate counter
/// needs to track.
#[derive(Default)]
pub struct Phase {
    pub rmw_entries: Vec<Box<ReadModifyWriteEntry>>,
    pub pending_deletes: Vec<SharedDeleteRange>,
    pub relocated: bool,
}

impl Phase {
    pub fn is_empty(&self) -> bool {
        self.rmw_entries.is_empty() && self.pending_deletes.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.rmw_entries.len() + self.pending_deletes.len()
    }
}
