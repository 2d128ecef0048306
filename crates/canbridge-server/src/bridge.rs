//! The top-level event loop: owns the listen socket, every Bus Socket, and
//! the live Client Session registry; fans inbound frames out and routes
//! outbound frames back to the right bus.
//!
//! Single task, non-blocking throughout (bus reads, client reads, and
//! client writes are all `try_*` calls polled on a fixed tick), so no SQL
//! round-trip or disk spill ever runs on this task — both only ever touch
//! the bounded channel exposed by [`IngestHandle`]. This mirrors the
//! design note to replace locking with explicit ownership: `BridgeCore` is
//! the sole owner of every socket and every session, so there is nothing
//! to lock.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant, SystemTime},
};

use canbridge_core::{Direction, Frame, QueueEntry};
use canbridge_proto::{BusParams, ClientSession, SessionAction};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    time::MissedTickBehavior,
};

use crate::{bus::BusSocket, config::ResolvedConfig, error::ServerError, ingest::IngestHandle, registry::SessionRegistry};

/// How often the event loop polls the listen socket's backlog, every Bus
/// Socket, and every client stream for more data.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A connected client's transport plus whatever bytes `queue_send` could
/// not push immediately (the stream would have blocked).
struct ClientConn {
    stream: TcpStream,
    pending_out: Vec<u8>,
}

/// The top-level bridge between CAN buses and TCP clients.
pub struct BridgeCore {
    listener: TcpListener,
    buses: Vec<BusSocket>,
    bus_offset: u8,
    bus_params: Vec<BusParams>,
    bus_count: u8,
    sessions: SessionRegistry,
    conns: HashMap<u64, ClientConn>,
    ingest: Option<IngestHandle>,
    default_direction: Direction,
    idle_timeout: Duration,
}

impl BridgeCore {
    /// Binds the listen socket and opens every configured Bus Socket.
    ///
    /// # Errors
    ///
    /// [`ServerError::Listen`] if the TCP listener cannot be bound;
    /// [`ServerError::Bus`] if any CAN interface cannot be opened.
    pub async fn bind(config: &ResolvedConfig, ingest: Option<IngestHandle>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.listen_addr).await.map_err(ServerError::Listen)?;

        let mut buses = Vec::with_capacity(config.interfaces.len());
        for (index, name) in config.interfaces.iter().enumerate() {
            let bus_index = config.bus_offset + index as u8;
            buses.push(BusSocket::open(name, config.fd_mode, bus_index)?);
        }

        let bus_count = config.interfaces.len() as u8;
        // Bit-rate discovery via netlink is out of scope for this bridge; we
        // advertise a bitrate of 0 (unknown) rather than guessing.
        let bus_params = vec![BusParams { enabled: true, listen_only: false, bitrate: 0 }; bus_count as usize];

        Ok(Self {
            listener,
            buses,
            bus_offset: config.bus_offset,
            bus_params,
            bus_count,
            sessions: SessionRegistry::new(),
            conns: HashMap::new(),
            ingest,
            default_direction: config.default_direction,
            idle_timeout: config.idle_timeout,
        })
    }

    /// The address the listen socket is actually bound to.
    ///
    /// # Errors
    ///
    /// Propagates the listener's own `local_addr` failure.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the event loop until `term` is set to `true` or dropped.
    pub async fn run(mut self, mut term: watch::Receiver<bool>) {
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = term.changed() => {
                    if changed.is_err() || *term.borrow() {
                        break;
                    }
                }
                accept = self.listener.accept() => {
                    self.handle_accept(accept);
                }
                _ = poll.tick() => {
                    self.tick();
                }
            }
        }

        tracing::info!(sessions = self.sessions.len(), "bridge core shutting down");
    }

    fn tick(&mut self) {
        self.flush_pending_writes();
        self.poll_buses();
        self.poll_sessions();
        self.sweep_idle();
    }

    fn handle_accept(&mut self, accept: std::io::Result<(TcpStream, SocketAddr)>) {
        match accept {
            Ok((stream, addr)) => {
                if let Err(error) = stream.set_nodelay(true) {
                    tracing::warn!(%error, "failed to set TCP_NODELAY on accepted connection");
                }
                let now = Instant::now();
                let session = ClientSession::new(now, self.bus_params.clone(), self.bus_count);
                let id = self.sessions.insert(session, now);
                self.conns.insert(id, ClientConn { stream, pending_out: Vec::new() });
                tracing::info!(session_id = id, %addr, "client connected");
            },
            Err(error) => tracing::error!(%error, "accept failed"),
        }
    }

    fn poll_buses(&mut self) {
        for index in 0..self.buses.len() {
            match self.buses[index].read_available() {
                Ok(frames) => {
                    for frame in frames {
                        self.fan_out(frame);
                    }
                },
                Err(error) => {
                    tracing::error!(interface = self.buses[index].interface(), %error, "bus read failed");
                },
            }
        }
    }

    /// Pushes a received frame to every live session, then enqueues one
    /// ingest entry tagged with the configured receive-direction label.
    fn fan_out(&mut self, frame: Frame) {
        let now = Instant::now();
        let ids: Vec<u64> = self.sessions.ids().collect();
        for id in ids {
            let action = {
                let Some(handle) = self.sessions.get_mut(id) else { continue };
                handle.session.push_frame(&frame, now)
            };
            if let Some(SessionAction::Send(bytes)) = action {
                self.queue_send(id, bytes);
            }
        }

        if let Some(ingest) = &self.ingest {
            let mut entry = QueueEntry::from(&frame);
            entry.direction = self.default_direction;
            ingest.try_enqueue(entry);
        }
    }

    fn poll_sessions(&mut self) {
        let ids: Vec<u64> = self.sessions.ids().collect();
        for id in ids {
            self.poll_session_read(id);
        }
    }

    fn poll_session_read(&mut self, id: u64) {
        let mut buf = [0u8; 4096];
        loop {
            let read_result = match self.conns.get(&id) {
                Some(conn) => conn.stream.try_read(&mut buf),
                None => return,
            };

            match read_result {
                Ok(0) => {
                    self.close_session(id, "peer closed connection");
                    return;
                },
                Ok(n) => {
                    let now = Instant::now();
                    let actions = {
                        let Some(handle) = self.sessions.get_mut(id) else { return };
                        handle.last_activity = now;
                        handle.session.receive(&buf[..n], now)
                    };
                    if self.execute_actions(id, actions) {
                        return; // session closed itself mid-batch
                    }
                },
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(error) => {
                    self.close_session(id, &error.to_string());
                    return;
                },
            }
        }
    }

    /// Executes the actions a session's `receive` produced. Returns `true`
    /// if the session was closed as a result (caller must stop touching it).
    fn execute_actions(&mut self, id: u64, actions: Vec<SessionAction>) -> bool {
        for action in actions {
            match action {
                SessionAction::Send(bytes) => self.queue_send(id, bytes),
                SessionAction::Transmit { bus, id: arb_id, extended, data } => {
                    self.handle_transmit(bus, arb_id, extended, data);
                },
                SessionAction::Close(reason) => {
                    self.close_session(id, &reason);
                    return true;
                },
            }
        }
        false
    }

    /// Routes a decoded `BUILD_FRAME` request to the bus at `bus -
    /// bus_offset`, writes it, and enqueues the transmitted entry.
    /// Out-of-range targets and write failures are silently dropped (the
    /// transient-I/O-error policy: not retried, not counted beyond the log).
    fn handle_transmit(&mut self, bus: u8, id: u32, extended: bool, data: Vec<u8>) {
        let Some(bus_idx) = bus.checked_sub(self.bus_offset) else { return };
        let Some(socket) = self.buses.get(bus_idx as usize) else { return };

        let frame = Frame {
            id: Frame::mask_id(id, extended),
            extended,
            rtr: false,
            error: false,
            fd: false,
            brs: false,
            esi: false,
            data_len: data.len() as u8,
            payload: data,
            bus,
            direction: Direction::Tx,
            timestamp: wall_clock_now(),
        };

        match socket.write(&frame) {
            Ok(()) => {
                if let Some(ingest) = &self.ingest {
                    ingest.try_enqueue(QueueEntry::from(&frame));
                }
            },
            Err(error) => {
                tracing::error!(%error, bus, "transmit failed, frame dropped");
            },
        }
    }

    fn queue_send(&mut self, id: u64, bytes: Vec<u8>) {
        let mut should_close = None;
        if let Some(conn) = self.conns.get_mut(&id) {
            if conn.pending_out.is_empty() {
                match conn.stream.try_write(&bytes) {
                    Ok(n) if n == bytes.len() => {},
                    Ok(n) => conn.pending_out.extend_from_slice(&bytes[n..]),
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        conn.pending_out.extend_from_slice(&bytes);
                    },
                    Err(error) => should_close = Some(error.to_string()),
                }
            } else {
                conn.pending_out.extend_from_slice(&bytes);
            }
        }
        if let Some(reason) = should_close {
            self.close_session(id, &reason);
        }
    }

    fn flush_pending_writes(&mut self) {
        let ids: Vec<u64> = self.conns.iter().filter(|(_, conn)| !conn.pending_out.is_empty()).map(|(id, _)| *id).collect();
        for id in ids {
            let mut should_close = None;
            if let Some(conn) = self.conns.get_mut(&id) {
                match conn.stream.try_write(&conn.pending_out) {
                    Ok(n) => conn.pending_out.drain(..n).for_each(drop),
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {},
                    Err(error) => should_close = Some(error.to_string()),
                }
            }
            if let Some(reason) = should_close {
                self.close_session(id, &reason);
            }
        }
    }

    fn sweep_idle(&mut self) {
        let now = Instant::now();
        let idle = self.sessions.idle_since(now, self.idle_timeout);
        for id in idle {
            self.close_session(id, "idle timeout");
        }
    }

    fn close_session(&mut self, id: u64, reason: &str) {
        if self.sessions.remove(id).is_some() {
            tracing::info!(session_id = id, reason, "client session closed");
        }
        self.conns.remove(&id);
    }
}

fn wall_clock_now() -> Duration {
    SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or(Duration::ZERO)
}
