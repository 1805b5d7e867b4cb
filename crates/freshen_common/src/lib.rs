//! Shared foundational types used across the freshen memoization crates.
//!
//! This crate provides the two hash types the cache relies on: a fast
//! XXH3-128 checksum for payload integrity and a SHA-256 digest for
//! fingerprinting function calls.

#![warn(missing_docs)]

pub mod digest;
pub mod hash;

pub use digest::Digest;
pub use hash::{ContentHash, ContentHasher};
