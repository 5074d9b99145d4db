//! Version-removal protocol.
//!
//! Readers pin a visibility sequence number; log truncation and checkpoint
//! cleanup ask whether a version is still visible and, if it is, receive the
//! notifications to await instead of blocking.

mod manager;
mod result;

pub use manager::VersionManager;
pub use result::{EnumerationCompletionResult, TryRemoveVersionResult};
