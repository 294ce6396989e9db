//! Crate-wide error type.
//!
//! Every failure mode of the view, builder, and linker surfaces here. The
//! core never retries I/O and never skips malformed input; callers decide
//! policy. `InvalidData` carries a short static description for
//! diagnostics, but the variant, not the text, is the contract.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The buffer is shorter than four bytes or does not start with the
    /// SLF magic.
    #[error("invalid header: not an SLF file")]
    InvalidHeader,
    /// The magic matched but a later validation failed: truncated buffer,
    /// table out of bounds, malformed string table, bad symbol size.
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
    /// The linker was invoked with an empty module list.
    #[error("nothing to link")]
    NothingToLink,
    /// A module's pointer width disagrees with the link-wide width.
    #[error("mismatching symbol size: module uses {found} bytes, link uses {expected}")]
    MismatchingSymbolSize { expected: usize, found: usize },
    /// Module layout arithmetic overflowed the address space.
    #[error("integer overflow while laying out modules")]
    IntegerOverflow,
    /// A resolved address does not fit in the word being patched.
    #[error("value {value:#x} does not fit in {size} bytes")]
    ValueDoesNotFit { value: u64, size: usize },
    /// An underlying stream operation failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
