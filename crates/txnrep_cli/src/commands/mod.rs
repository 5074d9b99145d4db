//! CLI command implementations.

pub mod lifecycle;
pub mod simulate;
pub mod versions;
