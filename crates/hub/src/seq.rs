//! Request sequencing shared by the per-garden arenas.
//!
//! Every request takes a number from one monotonic counter when issued. A
//! garden slot remembers the highest number it has applied (starting at the
//! number taken when the slot was opened), so a response is applied only if
//! it was issued after everything already applied. Responses from before a
//! teardown carry numbers below the reopened slot's floor and are dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Sequencer(AtomicU64);

impl Sequencer {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Whether a completed refresh made it into the visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshOutcome {
    Applied,
    /// A newer request had already been applied, or the garden was closed.
    Discarded,
}
