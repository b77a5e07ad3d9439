//! # oxz core
//!
//! Core components for the oxz compression library.
//!
//! This crate provides the building blocks shared by every layer:
//!
//! - [`coder`]: the incremental, non-blocking coder contract
//! - [`vli`]: the restartable variable-length integer codec
//! - [`crc`]: CRC-32 and CRC-64 with compile-time tables
//! - [`check`]: integrity check dispatch (None/CRC-32/CRC-64/SHA-256)
//! - [`mem`]: byte-budget accounting for coder allocations
//! - [`error`]: the error taxonomy of the coder contract
//!
//! ## Architecture
//!
//! oxz is a layered stack; higher crates only talk to lower ones through
//! the interfaces defined here:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ oxz-cli: compress / decompress / test / list         │
//! ├──────────────────────────────────────────────────────┤
//! │ oxz-xz: stream + block framing, index, filter chain  │
//! ├──────────────────────────────────────────────────────┤
//! │ oxz-lzma, oxz-filters: LZMA2 codec, BCJ + Delta      │
//! ├──────────────────────────────────────────────────────┤
//! │ oxz-core (this crate): coder contract, VLI, CRC,     │
//! │ checks, memory accounting                            │
//! └──────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod check;
pub mod coder;
pub mod crc;
pub mod error;
pub mod mem;
pub mod vli;

// Re-exports for convenience
pub use check::{Check, CheckType, CheckValue};
pub use coder::{Action, CodeStatus, Coder, code_all};
pub use crc::{Crc32, Crc64};
pub use error::{Result, XzError};
pub use mem::MemLimit;
pub use vli::{VLI_MAX, VliReader, VliWriter, vli_decode, vli_encode, vli_size};
