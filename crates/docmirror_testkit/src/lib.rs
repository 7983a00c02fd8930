//! # DocMirror Testkit
//!
//! Test utilities for DocMirror.
//!
//! This crate provides:
//! - Document fixtures
//! - Property-based test generators using proptest
//! - Cache invariant checkers and a reference model
//! - Concurrent stress helpers for the cache
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust
//! use docmirror_core::OrderedCache;
//! use docmirror_testkit::prelude::*;
//!
//! let mut cache = OrderedCache::new();
//! cache.extend(docs(["b", "a"]));
//! assert!(check_sorted_unique(&cache).is_ok());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod invariants;
pub mod logging;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::invariants::*;
    pub use crate::logging::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use invariants::*;
pub use logging::*;
pub use stress::*;
