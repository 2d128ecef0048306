//! Frame model and kernel-layout codec shared across the CAN bridge.
//!
//! This crate has no transport or wire-protocol knowledge: it defines the
//! internal [`Frame`] representation, the classic/FD kernel buffer codec,
//! and a [`Clock`] abstraction used for deterministic tests elsewhere in the
//! workspace.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod codec;
pub mod error;
pub mod frame;
pub mod queue_entry;

pub use clock::{Clock, FakeClock, SystemClock};
pub use error::CodecError;
pub use frame::{Direction, Frame, FD_VALID_LENGTHS, fd_len_for_dlc, smallest_fd_dlc_for_len};
pub use queue_entry::QueueEntry;
