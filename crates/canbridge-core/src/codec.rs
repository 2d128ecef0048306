//! Conversions between the kernel's `can_frame`/`canfd_frame` byte layout and
//! [`Frame`]. Pure and stateless; no socket access.
//!
//! Layouts (both little-endian), matching `linux/can.h`:
//!
//! - classic `can_frame` (16 bytes): `u32 id_and_flags, u8 dlc, [u8; 3] pad, [u8; 8] data`
//! - `canfd_frame` (72 bytes): `u32 id_and_flags, u8 len, u8 flags, [u8; 2] pad, [u8; 64] data`

use std::time::Duration;

use crate::{
    error::CodecError,
    frame::{CLASSIC_MAX_LEN, Direction, FD_MAX_LEN, Frame, fd_len_for_dlc, smallest_fd_dlc_for_len},
};

/// Size in bytes of the kernel's classic `can_frame` layout.
pub const CLASSIC_FRAME_SIZE: usize = 16;
/// Size in bytes of the kernel's `canfd_frame` layout.
pub const FD_FRAME_SIZE: usize = 72;

const CAN_EFF_FLAG: u32 = 1 << 31;
const CAN_RTR_FLAG: u32 = 1 << 30;
const CAN_ERR_FLAG: u32 = 1 << 29;
const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
const CAN_SFF_MASK: u32 = 0x7FF;

const CANFD_BRS: u8 = 0x01;
const CANFD_ESI: u8 = 0x02;

/// Decodes a 16-byte classic `can_frame` buffer received on `bus` at `timestamp`.
///
/// # Errors
///
/// Returns [`CodecError::WrongSize`] if `buf.len() != `[`CLASSIC_FRAME_SIZE`].
pub fn decode_classic(buf: &[u8], bus: u8, timestamp: Duration) -> Result<Frame, CodecError> {
    if buf.len() != CLASSIC_FRAME_SIZE {
        return Err(CodecError::WrongSize { expected: CLASSIC_FRAME_SIZE, actual: buf.len() });
    }

    let id_and_flags = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let extended = id_and_flags & CAN_EFF_FLAG != 0;
    let rtr = id_and_flags & CAN_RTR_FLAG != 0;
    let error = id_and_flags & CAN_ERR_FLAG != 0;
    let id = id_and_flags & if extended { CAN_EFF_MASK } else { CAN_SFF_MASK };

    let data_len = buf[4].min(CLASSIC_MAX_LEN);
    let payload = if rtr { Vec::new() } else { buf[8..8 + data_len as usize].to_vec() };

    Ok(Frame {
        id,
        extended,
        rtr,
        error,
        fd: false,
        brs: false,
        esi: false,
        data_len: if rtr { data_len } else { payload.len() as u8 },
        payload,
        bus,
        direction: Direction::Rx,
        timestamp,
    })
}

/// Decodes a 72-byte `canfd_frame` buffer received on `bus` at `timestamp`.
///
/// # Errors
///
/// Returns [`CodecError::WrongSize`] if `buf.len() != `[`FD_FRAME_SIZE`].
pub fn decode_fd(buf: &[u8], bus: u8, timestamp: Duration) -> Result<Frame, CodecError> {
    if buf.len() != FD_FRAME_SIZE {
        return Err(CodecError::WrongSize { expected: FD_FRAME_SIZE, actual: buf.len() });
    }

    let id_and_flags = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let extended = id_and_flags & CAN_EFF_FLAG != 0;
    let id = id_and_flags & if extended { CAN_EFF_MASK } else { CAN_SFF_MASK };

    let data_len = buf[4].min(FD_MAX_LEN);
    let fd_flags = buf[5];

    Ok(Frame {
        id,
        extended,
        rtr: false,
        error: id_and_flags & CAN_ERR_FLAG != 0,
        fd: true,
        brs: fd_flags & CANFD_BRS != 0,
        esi: fd_flags & CANFD_ESI != 0,
        data_len,
        payload: buf[8..8 + data_len as usize].to_vec(),
        bus,
        direction: Direction::Rx,
        timestamp,
    })
}

/// Decodes a raw socket read whose size determines classic vs. FD framing.
///
/// Per the Bus Socket contract, buffers that are neither 16 nor 72 bytes are
/// discarded (`Ok(None)`), not treated as an error.
///
/// # Errors
///
/// Propagates decode errors for buffers whose size matches one of the two
/// layouts but otherwise fail to decode (currently infallible, but kept as a
/// `Result` so future validation can fail closed).
pub fn decode_any(buf: &[u8], bus: u8, timestamp: Duration) -> Result<Option<Frame>, CodecError> {
    match buf.len() {
        CLASSIC_FRAME_SIZE => decode_classic(buf, bus, timestamp).map(Some),
        FD_FRAME_SIZE => decode_fd(buf, bus, timestamp).map(Some),
        _ => Ok(None),
    }
}

/// Encodes `frame` into the kernel layout appropriate for its `fd` flag,
/// zero-padding reserved bytes and truncating an oversized payload to the
/// maximum width for that layout.
#[must_use]
pub fn encode_for_transmit(frame: &Frame) -> Vec<u8> {
    if frame.fd { encode_fd(frame) } else { encode_classic(frame) }
}

fn encode_classic(frame: &Frame) -> Vec<u8> {
    let mut buf = vec![0u8; CLASSIC_FRAME_SIZE];

    let mut id_and_flags = if frame.extended { frame.id & CAN_EFF_MASK } else { frame.id & CAN_SFF_MASK };
    if frame.extended {
        id_and_flags |= CAN_EFF_FLAG;
    }
    if frame.rtr {
        id_and_flags |= CAN_RTR_FLAG;
    }
    if frame.error {
        id_and_flags |= CAN_ERR_FLAG;
    }

    buf[0..4].copy_from_slice(&id_and_flags.to_le_bytes());
    let len = frame.data_len.min(CLASSIC_MAX_LEN) as usize;
    buf[4] = len as u8;
    buf[8..8 + len].copy_from_slice(&frame.payload[..len.min(frame.payload.len())]);
    buf
}

fn encode_fd(frame: &Frame) -> Vec<u8> {
    let mut buf = vec![0u8; FD_FRAME_SIZE];

    let mut id_and_flags = if frame.extended { frame.id & CAN_EFF_MASK } else { frame.id & CAN_SFF_MASK };
    if frame.extended {
        id_and_flags |= CAN_EFF_FLAG;
    }
    if frame.error {
        id_and_flags |= CAN_ERR_FLAG;
    }

    buf[0..4].copy_from_slice(&id_and_flags.to_le_bytes());
    let len = frame.data_len.min(FD_MAX_LEN) as usize;
    buf[4] = len as u8;

    let mut flags = 0u8;
    if frame.brs {
        flags |= CANFD_BRS;
    }
    if frame.esi {
        flags |= CANFD_ESI;
    }
    buf[5] = flags;

    buf[8..8 + len].copy_from_slice(&frame.payload[..len.min(frame.payload.len())]);
    buf
}

/// DLC value as it appears on the wire / in the SQL ingest row: identical to
/// `data_len` for classic frames, the FD DLC code (reverse-mapped) for FD frames.
#[must_use]
pub fn wire_dlc(frame: &Frame) -> u8 {
    if frame.fd { smallest_fd_dlc_for_len(frame.data_len) } else { frame.data_len }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_classic() -> Frame {
        Frame {
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
            timestamp: Duration::from_secs(1),
        }
    }

    fn sample_fd() -> Frame {
        let payload: Vec<u8> = (0..12).collect();
        Frame {
            id: 0x1AB_CDEF,
            extended: true,
            rtr: false,
            error: false,
            fd: true,
            brs: true,
            esi: false,
            data_len: 12,
            payload,
            bus: 1,
            direction: Direction::Rx,
            timestamp: Duration::from_secs(2),
        }
    }

    #[test]
    fn classic_round_trips_through_kernel_layout() {
        let frame = sample_classic();
        let wire = encode_for_transmit(&frame);
        assert_eq!(wire.len(), CLASSIC_FRAME_SIZE);

        let decoded = decode_classic(&wire, frame.bus, frame.timestamp).unwrap();
        assert_eq!(decoded.id, frame.id);
        assert_eq!(decoded.extended, frame.extended);
        assert_eq!(decoded.payload, frame.payload);
        assert_eq!(decoded.data_len, frame.data_len);
    }

    #[test]
    fn fd_round_trips_through_kernel_layout() {
        let frame = sample_fd();
        let wire = encode_for_transmit(&frame);
        assert_eq!(wire.len(), FD_FRAME_SIZE);

        let decoded = decode_fd(&wire, frame.bus, frame.timestamp).unwrap();
        assert_eq!(decoded.id, frame.id);
        assert_eq!(decoded.extended, frame.extended);
        assert_eq!(decoded.brs, frame.brs);
        assert_eq!(decoded.payload, frame.payload);
        assert_eq!(wire_dlc(&decoded), 9);
    }

    #[test]
    fn wrong_size_buffers_are_rejected_by_direct_decode() {
        assert!(matches!(
            decode_classic(&[0u8; 15], 0, Duration::ZERO),
            Err(CodecError::WrongSize { expected: 16, actual: 15 })
        ));
    }

    #[test]
    fn non_kernel_sizes_are_discarded_not_errored() {
        assert_eq!(decode_any(&[0u8; 20], 0, Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn extended_fd_frame_keeps_its_29_bit_id_and_fd_dlc() {
        let frame = sample_fd();
        assert_eq!(wire_dlc(&frame), 9);
        assert_eq!(Frame::mask_id(frame.id, true), 0x1AB_CDEF);
    }
}
