//! A transactional read-modify-write mutation layer over a key-value
//! [`driver::Driver`].
//!
//! Callers stage single-key read-modify-write operations and half-open
//! range-deletes against a [`mutation::MultiPhaseNode`], grouped into
//! commit phases with [`mutation::MultiPhaseNode::barrier`]; committing a
//! phase with [`mutation::commit::commit_next_phase`], or the whole node in
//! phase order with [`mutation::commit::commit`], drives its entries to
//! completion against the underlying driver, either as independent
//! conditional writes or as a single atomic batch, per what the driver
//! supports. [`txn`] wraps this in a read/write surface for callers that
//! don't need to manage a `MultiPhaseNode` directly.

pub mod config;
pub mod driver;
pub mod error;
pub mod generation;
pub mod key_range;
pub mod mutation;
pub mod read_result;
pub mod txn;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use error::{CResult, Error};
