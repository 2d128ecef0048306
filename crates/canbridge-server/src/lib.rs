//! The CAN-to-TCP bridge server: raw CAN socket I/O, the Bridge Core event
//! loop, and the durable ingest pipeline. Wire-protocol parsing lives in
//! `canbridge-proto`; the frame model and kernel codec live in
//! `canbridge-core`. This crate is everything with real sockets, files,
//! and SQL connections.

// `unsafe_code` is `deny` (not `forbid`) at the workspace level: `bus.rs`
// locally opts back in for the raw CAN socket syscalls it needs.
#![warn(missing_docs)]

pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod ingest;
pub mod registry;
pub mod stats;

pub use bridge::BridgeCore;
pub use bus::{BusError, BusSocket};
pub use config::{Args, ConfigError, ResolvedConfig};
pub use error::ServerError;
pub use ingest::{IngestConfig, IngestHandle};
