//! Owned containers keyed by stable handles.
//!
//! Sockets, control blocks and security associations refer to each other through keys into these
//! containers rather than through references. Removing an entry invalidates every key that still
//! points at it, so a stale back-reference is detected instead of followed.
mod slotmap;

pub use self::slotmap::{Key, SlotMap};
