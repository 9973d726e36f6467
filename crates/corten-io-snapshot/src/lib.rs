//! Self-describing savestate object model shared by every device.
//!
//! The on-disk encoding is a stripped-down binary JSON: a state is a tree of
//! objects whose leaves are raw little-endian byte strings. The container
//! header is `F0 0F C7 C8` followed by a little-endian `u32` version, then
//! the root object. Objects are encoded as `TYPE_OBJECT (0x01)`, a `u8`
//! entry count, then for each entry a NUL-terminated key followed by either
//! a nested object or `TYPE_DATA (0x00)` + `u32` LE length + payload.
//!
//! Restore is tolerant of missing keys: a field that is absent in the
//! decoded state restores to zero, so older states load into newer devices.

pub mod state;

pub use state::{IoSnapshot, SnapshotError, StateEntry, StateObject};
