//! Top-level server error type.
//!
//! Kept as a hand-written `Display`/`Error` impl rather than a
//! `thiserror` derive, matching the split already present between this
//! crate's error texture and the lower crates' derived error types
//! (e.g. [`canbridge_core::CodecError`]).

use std::fmt;

use crate::{bus::BusError, config::ConfigError};

/// Errors that can surface from the server binary's startup.
///
/// Both variants are fatal at startup; the ingest worker's own spill-store
/// and connection failures are handled and logged inside its task and never
/// reach this type, since a bad database or disk shouldn't stop the bridge
/// from moving frames between the bus and connected clients.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration could not be resolved.
    Config(ConfigError),
    /// A CAN bus socket could not be opened.
    Bus(BusError),
    /// The TCP listener could not be bound.
    Listen(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Bus(err) => write!(f, "bus socket error: {err}"),
            Self::Listen(err) => write!(f, "failed to bind listen socket: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Bus(err) => Some(err),
            Self::Listen(err) => Some(err),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<BusError> for ServerError {
    fn from(err: BusError) -> Self {
        Self::Bus(err)
    }
}
