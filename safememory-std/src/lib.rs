//! SafeMemory Standard Containers
//!
//! Containers built on `safememory-runtime`. Their element storage is an
//! owned heap object, and in checked mode they keep an iterator registry, so
//! iterators that outlive the container (or survive a move or reassignment
//! of it) fail cleanly instead of reading stale memory.
//!
//! # Iterator Kinds
//!
//! - **Stack-only**: [`SafeVec::as_slice`] lends a borrowed slice whose
//!   iterators the borrow checker confines to the container's lifetime. They
//!   carry no registration and cost nothing at run time.
//! - **Heap-safe**: [`SafeVec::begin_safe`] returns an owned [`SafeIter`]
//!   that may be stored anywhere. It is registered with the container and
//!   checks its registration and bounds on every access.
//!
//! # Safety Modes
//!
//! Every container takes a `M: SafetyMode` parameter (default
//! [`Checked`](safememory_runtime::Checked)). In
//! [`Raw`](safememory_runtime::Raw) mode the registry is a zero-sized no-op
//! and only stack-only iteration is offered.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod vec;

pub use vec::{SafeIter, SafeVec};

/// Standard library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Container types provided by this crate (for tooling introspection)
pub const CONTAINERS: &[&str] = &["SafeVec"];
