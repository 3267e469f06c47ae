//! # BlobKit Testkit
//!
//! Test utilities for BlobKit.
//!
//! This crate provides:
//! - Temporary registries and fixed-permission subjects
//! - Property-based test generators using proptest
//! - A behavioural contract every store backend must satisfy
//! - Fault-injecting store and provider wrappers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use blobkit_testkit::prelude::*;
//!
//! #[test]
//! fn backup_round_trip() {
//!     let source = TempRegistry::memory();
//!     let engine = source.engine();
//!     // ... populate, back up, restore into another registry
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod contract;
pub mod faulty;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::contract::*;
    pub use crate::faulty::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use contract::*;
pub use faulty::*;
pub use fixtures::*;
pub use generators::*;
