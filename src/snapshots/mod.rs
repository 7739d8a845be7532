//! Thread snapshots: folded state and its on-disk store.
//!
//! A snapshot bounds replay cost to "distance since last snapshot" rather
//! than "distance since thread creation". The fold treats payloads as
//! opaque: state is the ordered JSON array of committed events.

mod fold;
mod store;

pub use fold::{apply_event, fold_entries};
pub use store::SnapshotStore;
