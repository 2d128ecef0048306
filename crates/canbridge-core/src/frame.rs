//! The internal CAN frame representation shared by every subsystem.
//!
//! A [`Frame`] is produced by the frame codec on receive, or by a client
//! session on decoding a send-frame request. It carries no transport or
//! wire-protocol detail; those live in `canbridge-proto`.

use std::time::Duration;

/// Maximum payload length for a classic CAN frame.
pub const CLASSIC_MAX_LEN: u8 = 8;

/// Maximum payload length for a CAN FD frame.
pub const FD_MAX_LEN: u8 = 64;

/// Valid CAN FD payload lengths, in ascending order. Any other length is not
/// representable on the wire and must be rounded up via [`smallest_fd_dlc_for_len`].
pub const FD_VALID_LENGTHS: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Direction a [`Frame`] travelled: received from the bus, or transmitted to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Frame was received from a Bus Socket.
    Rx,
    /// Frame was transmitted to a Bus Socket on behalf of a client.
    Tx,
}

impl Direction {
    /// The text tag used in the SQL-store contract ("rx" / "tx").
    #[must_use]
    pub fn as_sql_tag(self) -> &'static str {
        match self {
            Self::Rx => "rx",
            Self::Tx => "tx",
        }
    }
}

/// The internal representation of one CAN message.
///
/// # Invariants
///
/// - `payload.len() == data_len as usize`.
/// - If `fd` is set, `data_len` is one of [`FD_VALID_LENGTHS`]; otherwise
///   `data_len <= CLASSIC_MAX_LEN`.
/// - `id` is masked to 11 bits when `extended` is clear, 29 bits when set.
/// - If `rtr` is set, `payload` is empty (the DLC in the wire header may
///   still be non-zero; only the stored payload is truncated).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Arbitration identifier, already masked to 11 or 29 bits.
    pub id: u32,
    /// 29-bit extended identifier in use.
    pub extended: bool,
    /// Remote transmission request.
    pub rtr: bool,
    /// Kernel error frame.
    pub error: bool,
    /// CAN FD framing in use.
    pub fd: bool,
    /// Bit-rate-switch flag (FD only).
    pub brs: bool,
    /// Error-state-indicator flag (FD only).
    pub esi: bool,
    /// Payload length in bytes.
    pub data_len: u8,
    /// Payload bytes; `payload.len() == data_len as usize`.
    pub payload: Vec<u8>,
    /// Logical bus index exposed to clients (`bus_offset + socket_index`).
    pub bus: u8,
    /// Whether this frame was received from, or transmitted to, the bus.
    pub direction: Direction,
    /// Microsecond-resolution capture instant: kernel receive timestamp when
    /// available, otherwise captured at enqueue.
    pub timestamp: Duration,
}

impl Frame {
    /// Masks `id` to the width implied by `extended` (11 bits standard, 29 extended).
    #[must_use]
    pub fn mask_id(id: u32, extended: bool) -> u32 {
        if extended { id & 0x1FFF_FFFF } else { id & 0x7FF }
    }

    /// `true` if this frame's payload length, RTR, and FD-length invariants
    /// all hold.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        if self.payload.len() != self.data_len as usize {
            return false;
        }
        if self.rtr && !self.payload.is_empty() {
            return false;
        }
        if self.fd {
            FD_VALID_LENGTHS.contains(&self.data_len)
        } else {
            self.data_len <= CLASSIC_MAX_LEN
        }
    }
}

/// Converts an FD length to the DLC code transmitted on the wire (or stored
/// in the SQL ingest row), choosing the smallest DLC whose length is `>=` the
/// payload length. Classic frames always use `DLC == length`.
#[must_use]
pub fn smallest_fd_dlc_for_len(len: u8) -> u8 {
    match len {
        0..=8 => len,
        9..=12 => 9,
        13..=16 => 10,
        17..=20 => 11,
        21..=24 => 12,
        25..=32 => 13,
        33..=48 => 14,
        _ => 15,
    }
}

/// Converts an FD DLC code (0..=15) to its payload length in bytes.
#[must_use]
pub fn fd_len_for_dlc(dlc: u8) -> u8 {
    match dlc {
        0..=8 => dlc,
        9 => 12,
        10 => 16,
        11 => 20,
        12 => 24,
        13 => 32,
        14 => 48,
        _ => 64,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn fd_len_roundtrips_through_dlc(len in prop::sample::select(&FD_VALID_LENGTHS[..])) {
            let dlc = smallest_fd_dlc_for_len(len);
            prop_assert_eq!(fd_len_for_dlc(dlc), len);
        }

        #[test]
        fn fd_dlc_roundtrips_through_len(dlc in 0u8..=15) {
            let len = fd_len_for_dlc(dlc);
            prop_assert_eq!(smallest_fd_dlc_for_len(len), dlc);
        }

        #[test]
        fn any_len_rounds_up_to_a_valid_length(len in 0u8..=64) {
            let dlc = smallest_fd_dlc_for_len(len);
            let rounded = fd_len_for_dlc(dlc);
            prop_assert!(rounded >= len);
            prop_assert!(FD_VALID_LENGTHS.contains(&rounded));
        }
    }

    #[test]
    fn mask_id_respects_extended_flag() {
        assert_eq!(Frame::mask_id(0xFFFF_FFFF, false), 0x7FF);
        assert_eq!(Frame::mask_id(0xFFFF_FFFF, true), 0x1FFF_FFFF);
    }
}
