//! The GVRET-style binary wire protocol: handshake, opcode table, and the
//! per-client [`ClientSession`] state machine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod opcode;
pub mod session;
pub mod wire;

pub use opcode::Opcode;
pub use session::{ClientSession, SessionAction, SessionState};
pub use wire::{BusParams, try_decode_build_frame};
