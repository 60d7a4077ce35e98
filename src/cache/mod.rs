// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation caching across forward passes.
//!
//! - [`GenerationalCache`] — the in-flight pass's captured values (`live`)
//!   and the previous pass's finalized values (`last`), used as the freeze
//!   reference and as patch source.

mod generational;

pub use generational::GenerationalCache;
