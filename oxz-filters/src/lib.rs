//! # oxz filters
//!
//! Size-preserving filters for the oxz compression stack.
//!
//! These are the non-terminal members of a filter chain: each transforms a
//! byte stream into an equally long byte stream that the downstream LZMA2
//! filter can compress better.
//!
//! - [`delta`]: byte-wise delta against a configurable distance
//! - [`bcj`]: the branch-address family (x86, PowerPC, IA-64, ARM,
//!   ARM-Thumb, SPARC, ARM64, LoongArch, RISC-V)
//! - [`simple`]: the streaming driver that turns the in-place transforms
//!   into incremental coders with partial-instruction holdback

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bcj;
pub mod delta;
pub mod simple;

// Re-exports
pub use bcj::{BcjArch, BcjFilter};
pub use delta::{DELTA_DIST_MAX, DELTA_DIST_MIN, DeltaFilter};
pub use simple::{CopyFilter, FilterStage, InPlaceFilter};
