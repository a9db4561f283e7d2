//! The transactional read-modify-write mutation layer (spec §3–§4): stages
//! per-key read-modify-write and range-delete operations across one or more
//! commit phases, and drives each phase to completion against a
//! [`crate::driver::Driver`].

pub mod commit;
pub mod entry;
pub mod node;
pub mod phase;
pub mod target;

pub use commit::{commit, commit_next_phase};
pub use entry::{DeleteRangeEntry, Flags, ReadModifyWriteEntry};
pub use node::{MultiPhaseNode, ReadModifyWriteStatus};
pub use target::{ReadModifyWriteSource, ReadModifyWriteTarget};
