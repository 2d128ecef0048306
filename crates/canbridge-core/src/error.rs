//! Error types for the frame model and codec.
//!
//! Kept separate from `canbridge-server`'s `ServerError`: this crate only
//! ever fails on malformed kernel buffers, never on wire-protocol or I/O
//! concerns.

use thiserror::Error;

/// Errors from the frame codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A kernel frame buffer was neither 16 (classic) nor 72 (FD) bytes.
    #[error("wrong frame buffer size: expected {expected}, got {actual}")]
    WrongSize {
        /// Size the decoder required.
        expected: usize,
        /// Size actually supplied.
        actual: usize,
    },
}
