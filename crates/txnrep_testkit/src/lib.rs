//! # txnrep testkit
//!
//! Test utilities for txnrep.
//!
//! This crate provides:
//! - A replicator fixture over the in-memory log and state manager
//! - Property-based test generators using proptest
//! - Concurrency stress drivers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use txnrep_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn commits_on_primary() {
//!     let fixture = TestReplicator::open_primary().await;
//!     let sp = fixture.register_provider("orders").await;
//!     // ... test operations
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
