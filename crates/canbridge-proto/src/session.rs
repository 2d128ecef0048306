//! Per-client wire-protocol state machine.
//!
//! Pure logic: [`ClientSession::receive`] takes raw bytes and the current
//! instant and returns a list of [`SessionAction`]s for the executor to
//! perform. No socket access happens here, following the same split the
//! rest of the workspace uses for its state machines.

use std::time::Instant;

use canbridge_core::Frame;

use crate::{
    opcode::Opcode,
    wire::{
        BusParams, encode_bus_params, encode_dev_info, encode_frame_push, encode_keepalive,
        encode_num_buses, encode_timebase, try_decode_build_frame,
    },
};

const HANDSHAKE_SENTINEL: [u8; 2] = [0xE7, 0xE7];
const BINARY_SENTINEL: u8 = 0xF1;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Scanning for the `E7 E7` handshake sentinel.
    Ascii,
    /// Parsing framed `F1 <opcode>` requests.
    Binary,
    /// Session is closed; no further input is processed.
    Closed,
}

/// An action the executor must perform on behalf of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Write these bytes to the client's socket.
    Send(Vec<u8>),
    /// A `BUILD_FRAME` request decoded a frame for transmission on a bus;
    /// the executor routes it to the Bus Socket at the given index.
    Transmit {
        /// Target bus index.
        bus: u8,
        /// Arbitration identifier, already masked.
        id: u32,
        /// Extended identifier flag.
        extended: bool,
        /// Payload bytes (classic only, length <= 8).
        data: Vec<u8>,
    },
    /// The session must be closed; carries a human-readable reason for logs.
    Close(String),
}

/// Per-client GVRET-style protocol state machine.
pub struct ClientSession {
    state: SessionState,
    recv_buf: Vec<u8>,
    session_start: Instant,
    bus_params: Vec<BusParams>,
    bus_count: u8,
    /// Count of single-byte resyncs performed in binary mode (stats only).
    pub resync_count: u64,
}

impl ClientSession {
    /// Creates a new session starting in the `ascii` handshake state.
    #[must_use]
    pub fn new(now: Instant, bus_params: Vec<BusParams>, bus_count: u8) -> Self {
        Self {
            state: SessionState::Ascii,
            recv_buf: Vec::new(),
            session_start: now,
            bus_params,
            bus_count,
            resync_count: 0,
        }
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Microseconds since session start, truncated to 32 bits (wraps at ~71 minutes).
    #[must_use]
    pub fn us_since_start(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.session_start).as_micros() as u32
    }

    /// Feeds newly-read bytes into the session, returning the actions the
    /// executor must perform. Never errors: malformed input is resynced
    /// past (binary mode) or simply accumulated (ascii mode).
    pub fn receive(&mut self, bytes: &[u8], now: Instant) -> Vec<SessionAction> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }

        self.recv_buf.extend_from_slice(bytes);
        let mut actions = Vec::new();

        if self.state == SessionState::Ascii {
            self.scan_handshake();
        }

        if self.state == SessionState::Binary {
            self.drain_binary_requests(now, &mut actions);
        }

        actions
    }

    /// Builds the outbound push action for a frame observed on the bus,
    /// or `None` if the session hasn't completed the handshake yet: frames
    /// are only pushed after entering binary mode.
    #[must_use]
    pub fn push_frame(&self, frame: &Frame, now: Instant) -> Option<SessionAction> {
        if self.state != SessionState::Binary {
            return None;
        }
        Some(SessionAction::Send(encode_frame_push(frame, self.us_since_start(now))))
    }

    fn scan_handshake(&mut self) {
        while let Some(pos) =
            self.recv_buf.windows(2).position(|w| w == HANDSHAKE_SENTINEL)
        {
            self.recv_buf.drain(..pos + 2);
            self.state = SessionState::Binary;
            tracing::debug!("handshake sentinel found, entering binary mode");
        }
    }

    fn drain_binary_requests(&mut self, now: Instant, actions: &mut Vec<SessionAction>) {
        loop {
            let skipped_before = self.resync_count;
            while self.recv_buf.first().is_some_and(|&b| b != BINARY_SENTINEL) {
                self.recv_buf.remove(0);
                self.resync_count += 1;
            }
            if self.resync_count > skipped_before {
                tracing::warn!(skipped = self.resync_count - skipped_before, "resynced past malformed bytes");
            }

            if self.recv_buf.len() < 2 {
                return;
            }

            let opcode_byte = self.recv_buf[1];

            if opcode_byte == Opcode::BuildFrame.as_byte() {
                match try_decode_build_frame(&self.recv_buf) {
                    Some((req, consumed)) => {
                        self.recv_buf.drain(..consumed);
                        actions.push(SessionAction::Transmit {
                            bus: req.bus,
                            id: req.id,
                            extended: req.extended,
                            data: req.data,
                        });
                        continue;
                    },
                    None => return, // incomplete; wait for more bytes
                }
            }

            self.recv_buf.drain(..2);

            match Opcode::from_byte(opcode_byte) {
                Some(Opcode::Timebase) => {
                    actions.push(SessionAction::Send(encode_timebase(self.us_since_start(now))));
                },
                Some(Opcode::GetBusParams) => {
                    actions.push(SessionAction::Send(encode_bus_params(&self.bus_params)));
                },
                Some(Opcode::GetDevInfo) => {
                    actions.push(SessionAction::Send(encode_dev_info()));
                },
                Some(Opcode::Keepalive) => {
                    actions.push(SessionAction::Send(encode_keepalive()));
                },
                Some(Opcode::GetNumBuses) => {
                    actions.push(SessionAction::Send(encode_num_buses(self.bus_count)));
                },
                Some(Opcode::BuildFrame) => unreachable!("handled above"),
                None => {}, // unknown opcode: ignored, no response, no state change
            }
        }
    }

    /// Marks the session closed; called by the executor on write failure or
    /// a zero-length read.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn params() -> Vec<BusParams> {
        vec![BusParams { enabled: true, listen_only: false, bitrate: 500_000 }]
    }

    #[test]
    fn handshake_then_keepalive_round_trip() {
        let mut session = ClientSession::new(Instant::now(), params(), 1);
        let now = Instant::now();

        let actions = session.receive(&[0xFF, 0xE7, 0xE7, 0xF1, 0x09], now);
        assert_eq!(session.state(), SessionState::Binary);
        assert_eq!(actions, vec![SessionAction::Send(vec![0xF1, 0x09, 0xDE, 0xAD])]);
    }

    #[test]
    fn no_response_before_full_handshake() {
        let mut session = ClientSession::new(Instant::now(), params(), 1);
        let actions = session.receive(&[0xE7], Instant::now());
        assert!(actions.is_empty());
        assert_eq!(session.state(), SessionState::Ascii);
    }

    #[test]
    fn garbage_bytes_in_binary_mode_are_resynced() {
        let mut session = ClientSession::new(Instant::now(), params(), 1);
        session.receive(&[0xE7, 0xE7], Instant::now());

        let actions = session.receive(&[0x00, 0x01, 0x02, 0xF1, 0x09], Instant::now());
        assert_eq!(actions, vec![SessionAction::Send(vec![0xF1, 0x09, 0xDE, 0xAD])]);
        assert_eq!(session.resync_count, 3);
    }

    #[test]
    fn build_frame_waits_for_full_payload_across_reads() {
        let mut session = ClientSession::new(Instant::now(), params(), 1);
        session.receive(&[0xE7, 0xE7], Instant::now());

        let first = vec![0xF1, 0x00, 0, 0, 0, 0, 1, 4];
        let actions = session.receive(&first, Instant::now());
        assert!(actions.is_empty());

        let actions = session.receive(&[0x41, 0x42, 0x43, 0x44], Instant::now());
        assert_eq!(
            actions,
            vec![SessionAction::Transmit {
                bus: 1,
                id: 0,
                extended: false,
                data: vec![0x41, 0x42, 0x43, 0x44]
            }]
        );
    }

    #[test]
    fn push_is_suppressed_before_binary_mode() {
        let session = ClientSession::new(Instant::now(), params(), 1);
        let frame = canbridge_core::Frame {
            id: 1,
            extended: false,
            rtr: false,
            error: false,
            fd: false,
            brs: false,
            esi: false,
            data_len: 0,
            payload: vec![],
            bus: 0,
            direction: canbridge_core::Direction::Rx,
            timestamp: Duration::ZERO,
        };
        assert!(session.push_frame(&frame, Instant::now()).is_none());
    }

    proptest::proptest! {
        #[test]
        fn resync_never_hangs_and_never_replies_to_garbage(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256)) {
            let mut session = ClientSession::new(Instant::now(), params(), 1);
            session.receive(&[0xE7, 0xE7], Instant::now());
            let actions = session.receive(&bytes, Instant::now());
            for action in &actions {
                if let SessionAction::Send(bytes) = action {
                    proptest::prop_assert!(bytes.first() == Some(&0xF1));
                }
            }
        }
    }

    #[test]
    fn unknown_opcode_is_silently_ignored() {
        let mut session = ClientSession::new(Instant::now(), params(), 1);
        session.receive(&[0xE7, 0xE7], Instant::now());
        let actions = session.receive(&[0xF1, 0xFE, 0xF1, 0x09], Instant::now());
        assert_eq!(actions, vec![SessionAction::Send(vec![0xF1, 0x09, 0xDE, 0xAD])]);
    }
}
