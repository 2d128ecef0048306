//! Encoding of fixed-opcode responses and the outbound frame push, and
//! decoding of the `BuildFrame` request payload.
//!
//! All multi-byte integers are little-endian, matching the kernel CAN
//! socket layout and the original GVRET dialect this protocol follows.

use canbridge_core::{Frame, fd_len_for_dlc, smallest_fd_dlc_for_len};

use crate::opcode::Opcode;

const SENTINEL: u8 = 0xF1;
const CAN_EFF_FLAG: u32 = 0x8000_0000;
const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
const CAN_SFF_MASK: u32 = 0x7FF;

/// Static per-bus parameters advertised to clients via `GET_BUS_PARAMS`/`GET_NUM_BUSES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusParams {
    /// Whether the bus is enabled.
    pub enabled: bool,
    /// Whether the bus is configured listen-only (no transmit).
    pub listen_only: bool,
    /// Nominal bit rate in bits/second.
    pub bitrate: u32,
}

/// Encodes the `TIMEBASE` response (`F1 01 <u32 us LE>`).
#[must_use]
pub fn encode_timebase(us_since_start: u32) -> Vec<u8> {
    let mut out = vec![SENTINEL, Opcode::Timebase.as_byte()];
    out.extend_from_slice(&us_since_start.to_le_bytes());
    out
}

/// Encodes the `GET_BUS_PARAMS` response, covering the first two advertised
/// buses; a bus beyond `params.len()` contributes zeroed flags and bitrate.
#[must_use]
pub fn encode_bus_params(params: &[BusParams]) -> Vec<u8> {
    let mut out = vec![SENTINEL, Opcode::GetBusParams.as_byte()];
    for slot in 0..2 {
        let (flags, bitrate) = match params.get(slot) {
            Some(p) => {
                let mut flags = 0u8;
                if p.enabled {
                    flags |= 0x01;
                }
                if p.listen_only {
                    flags |= 0x10;
                }
                (flags, p.bitrate)
            },
            None => (0, 0),
        };
        out.push(flags);
        out.extend_from_slice(&bitrate.to_le_bytes());
    }
    out
}

/// Encodes the `GET_DEV_INFO` response: firmware build 400, EEPROM version 1,
/// remaining bytes zero.
#[must_use]
pub fn encode_dev_info() -> Vec<u8> {
    let build: u16 = 400;
    let mut out = vec![SENTINEL, Opcode::GetDevInfo.as_byte()];
    out.extend_from_slice(&build.to_le_bytes());
    out.extend_from_slice(&[1, 0, 0, 0]);
    out
}

/// Encodes the `KEEPALIVE` response (`F1 09 DE AD`).
#[must_use]
pub fn encode_keepalive() -> Vec<u8> {
    vec![SENTINEL, Opcode::Keepalive.as_byte(), 0xDE, 0xAD]
}

/// Encodes the `GET_NUM_BUSES` response.
#[must_use]
pub fn encode_num_buses(bus_count: u8) -> Vec<u8> {
    vec![SENTINEL, Opcode::GetNumBuses.as_byte(), bus_count]
}

/// Encodes the outbound frame push sent for every frame a live session
/// observes: `F1 00 <ts_us LE> <id_with_eff LE> <bus_and_dlc> <payload> 00`.
#[must_use]
pub fn encode_frame_push(frame: &Frame, us_since_start: u32) -> Vec<u8> {
    let arb = if frame.extended { frame.id & CAN_EFF_MASK } else { frame.id & CAN_SFF_MASK };
    let id_with_eff = arb | if frame.extended { CAN_EFF_FLAG } else { 0 };
    let dlc = if frame.fd { smallest_fd_dlc_for_len(frame.data_len) } else { frame.data_len };
    let bus_and_dlc = ((frame.bus & 0x0F) << 4) | (dlc & 0x0F);

    let mut out = Vec::with_capacity(11 + frame.payload.len());
    out.push(SENTINEL);
    out.push(Opcode::BuildFrame.as_byte());
    out.extend_from_slice(&us_since_start.to_le_bytes());
    out.extend_from_slice(&id_with_eff.to_le_bytes());
    out.push(bus_and_dlc);
    out.extend_from_slice(&frame.payload);
    out.push(0x00);
    out
}

/// A decoded `BUILD_FRAME` request: arbitration id, extended flag, target
/// bus, and payload (DLC already clamped to 8 per the classic-only
/// transmit contract).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFrameRequest {
    /// Arbitration identifier, masked to 11 or 29 bits per `extended`.
    pub id: u32,
    /// Extended (29-bit) identifier flag.
    pub extended: bool,
    /// Target bus index.
    pub bus: u8,
    /// Payload bytes (length == DLC, clamped to 8).
    pub data: Vec<u8>,
}

/// Attempts to parse a `BUILD_FRAME` request from the front of `buf`.
///
/// Layout: `F1 00 <id:4 LE> <bus:1> <dlc:1> <data:dlc>`, 8-byte header
/// (including the `F1 00` prefix) followed by `dlc` data bytes.
///
/// Returns `Ok(None)` when `buf` does not yet contain a complete request
/// (caller should wait for more bytes); `Ok(Some((request, consumed)))` on
/// success, where `consumed` is the number of bytes to drop from the front
/// of the receive buffer.
///
/// # Panics
///
/// Never panics; callers must ensure `buf[0] == 0xF1 && buf[1] == 0x00`
/// before calling (checked by [`try_decode_build_frame`] itself via an
/// initial guard that returns `None` rather than panicking).
#[must_use]
pub fn try_decode_build_frame(buf: &[u8]) -> Option<(BuildFrameRequest, usize)> {
    if buf.len() < 8 || buf[0] != SENTINEL || buf[1] != Opcode::BuildFrame.as_byte() {
        return None;
    }

    let dlc = buf[7];
    let consumed = 8 + dlc as usize;
    if buf.len() < consumed {
        return None;
    }

    let can_id_le = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
    let bus = buf[6];
    let extended = can_id_le & CAN_EFF_FLAG != 0;
    let id = can_id_le & if extended { CAN_EFF_MASK } else { CAN_SFF_MASK };

    let clamped_dlc = dlc.min(8) as usize;
    let data = buf[8..8 + clamped_dlc].to_vec();

    Some((BuildFrameRequest { id, extended, bus, data }, consumed))
}

#[cfg(test)]
mod tests {
    use canbridge_core::Direction;

    use super::*;

    #[test]
    fn keepalive_encodes_fixed_opcode_and_payload() {
        assert_eq!(encode_keepalive(), vec![0xF1, 0x09, 0xDE, 0xAD]);
    }

    #[test]
    fn decode_build_frame_extracts_extended_flag() {
        let mut buf = vec![0xF1, 0x00];
        buf.extend_from_slice(&0x8000_0000u32.to_le_bytes()); // id with EFF bit set
        buf.push(1); // bus
        buf.push(4); // dlc
        buf.extend_from_slice(&[0x41, 0x42, 0x43, 0x44]);

        let (req, consumed) = try_decode_build_frame(&buf).expect("complete request");
        assert_eq!(consumed, buf.len());
        assert!(req.extended);
        assert_eq!(req.id, 0);
        assert_eq!(req.bus, 1);
        assert_eq!(req.data, vec![0x41, 0x42, 0x43, 0x44]);
    }

    #[test]
    fn decode_build_frame_waits_for_more_bytes() {
        let buf = vec![0xF1, 0x00, 0, 0, 0, 0, 0, 4, 0xAA]; // dlc=4 but only 1 data byte present
        assert_eq!(try_decode_build_frame(&buf), None);
    }

    #[test]
    fn decode_build_frame_clamps_dlc_to_eight() {
        let mut buf = vec![0xF1, 0x00, 0, 0, 0, 0, 0, 12];
        buf.extend_from_slice(&[0u8; 12]);
        let (req, consumed) = try_decode_build_frame(&buf).expect("complete request");
        assert_eq!(consumed, 20);
        assert_eq!(req.data.len(), 8);
    }

    #[test]
    fn frame_push_encodes_classic_frame_little_endian() {
        let frame = Frame {
            id: 0x123,
            extended: false,
            rtr: false,
            error: false,
            fd: false,
            brs: false,
            esi: false,
            data_len: 3,
            payload: vec![0xAA, 0xBB, 0xCC],
            bus: 0,
            direction: Direction::Rx,
            timestamp: std::time::Duration::ZERO,
        };
        let encoded = encode_frame_push(&frame, 0);
        assert_eq!(
            encoded,
            vec![0xF1, 0x00, 0, 0, 0, 0, 0x23, 0x01, 0x00, 0x00, 0x03, 0xAA, 0xBB, 0xCC, 0x00]
        );
    }

    #[test]
    fn frame_push_encodes_extended_fd_frame() {
        let payload: Vec<u8> = (0u8..12).collect();
        let frame = Frame {
            id: 0x1AB_CDEF,
            extended: true,
            rtr: false,
            error: false,
            fd: true,
            brs: true,
            esi: false,
            data_len: 12,
            payload: payload.clone(),
            bus: 1,
            direction: Direction::Rx,
            timestamp: std::time::Duration::ZERO,
        };
        let encoded = encode_frame_push(&frame, 0);
        let mut expected = vec![0xF1, 0x00, 0, 0, 0, 0];
        expected.extend_from_slice(&0x81AB_CDEFu32.to_le_bytes());
        expected.push(0x19); // bus 1 << 4 | dlc 9
        expected.extend_from_slice(&payload);
        expected.push(0x00);
        assert_eq!(encoded, expected);
        assert_eq!(fd_len_for_dlc(9), 12);
    }
}
