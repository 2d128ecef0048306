//! Raw CAN socket I/O.
//!
//! One [`BusSocket`] owns one `AF_CAN`/`SOCK_RAW` endpoint bound to a named
//! interface. It is deliberately the only module in this crate that touches
//! raw file descriptors directly; everything above it works with [`Frame`]
//! values.
//!
//! Grounded on the kernel SocketCAN API (`linux/can.h`, `linux/can/raw.h`):
//! open, bind by interface index, request `SO_TIMESTAMP` ancillary data on
//! every read, and optionally enable `CAN_RAW_FD_FRAMES` for FD reception.

#![allow(unsafe_code)]

use std::{
    ffi::CString,
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

use canbridge_core::{
    Frame,
    codec::{CLASSIC_FRAME_SIZE, FD_FRAME_SIZE, decode_any, encode_for_transmit},
};
use thiserror::Error;

/// Maximum number of frames drained from one socket per [`BusSocket::read_available`] call.
pub const MAX_FRAMES_PER_TICK: usize = 256;

/// Errors opening or operating a raw CAN socket.
#[derive(Error, Debug)]
pub enum BusError {
    /// The named interface does not exist.
    #[error("CAN interface not found: {0}")]
    NotFound(String),
    /// The process lacks `CAP_NET_RAW` (or the socket could not be created/bound).
    #[error("permission denied opening CAN interface {interface}: {source}")]
    PermissionDenied {
        /// Interface name that failed to open.
        interface: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// A write was rejected or only partially completed.
    #[error("write to bus failed: {0}")]
    WriteFailed(io::Error),
}

/// One raw CAN endpoint bound to one named interface.
pub struct BusSocket {
    fd: OwnedFd,
    fd_mode: bool,
    /// Logical bus index exposed to clients (`bus_offset + socket_index`).
    pub bus_index: u8,
    interface: String,
}

impl BusSocket {
    /// Opens and binds a raw CAN socket to `interface_name`.
    ///
    /// # Errors
    ///
    /// [`BusError::NotFound`] if the interface does not exist;
    /// [`BusError::PermissionDenied`] if the socket cannot be created or
    /// bound (typically missing `CAP_NET_RAW`).
    pub fn open(interface_name: &str, fd_mode: bool, bus_index: u8) -> Result<Self, BusError> {
        let ifname =
            CString::new(interface_name).map_err(|_| BusError::NotFound(interface_name.to_string()))?;

        // SAFETY: `ifname` is a valid NUL-terminated C string; `if_nametoindex`
        // only reads it and returns 0 (not an index) on failure.
        let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
        if ifindex == 0 {
            return Err(BusError::NotFound(interface_name.to_string()));
        }

        // SAFETY: standard socket(2) call with fixed protocol family/type.
        let raw_fd = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_RAW, libc::CAN_RAW) };
        if raw_fd < 0 {
            return Err(BusError::PermissionDenied {
                interface: interface_name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: `raw_fd` was just returned by a successful `socket(2)` call
        // and is not owned anywhere else yet.
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let mut addr: libc::sockaddr_can = unsafe { std::mem::zeroed() };
        addr.can_family = libc::AF_CAN as libc::sa_family_t;
        addr.can_ifindex = ifindex as i32;

        // SAFETY: `addr` is a validly initialized `sockaddr_can`, its size
        // matches the struct passed, and `fd` is the socket we just created.
        let bind_result = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                size_of::<libc::sockaddr_can>() as libc::socklen_t,
            )
        };
        if bind_result < 0 {
            return Err(BusError::PermissionDenied {
                interface: interface_name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        set_bool_sockopt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_TIMESTAMP, true)
            .map_err(BusError::WriteFailed)?;

        if fd_mode {
            set_bool_sockopt(fd.as_raw_fd(), libc::SOL_CAN_RAW, libc::CAN_RAW_FD_FRAMES, true)
                .map_err(BusError::WriteFailed)?;
        }

        set_nonblocking(fd.as_raw_fd()).map_err(BusError::WriteFailed)?;

        Ok(Self { fd, fd_mode, bus_index, interface: interface_name.to_string() })
    }

    /// The bound interface name.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Drains all frames currently available without blocking, bounded by
    /// [`MAX_FRAMES_PER_TICK`]. Buffers whose size is neither 16 nor 72
    /// bytes are silently discarded, per the Bus Socket contract.
    ///
    /// # Errors
    ///
    /// Returns an error only for unexpected OS failures other than
    /// "would block"; a socket that would block simply yields an empty list.
    pub fn read_available(&self) -> io::Result<Vec<Frame>> {
        let mut frames = Vec::new();
        let max_size = if self.fd_mode { FD_FRAME_SIZE } else { CLASSIC_FRAME_SIZE };

        for _ in 0..MAX_FRAMES_PER_TICK {
            match recv_one(self.fd.as_raw_fd(), max_size) {
                Ok(Some((buf, timestamp))) => {
                    let ts = timestamp.unwrap_or_else(wall_clock_now);
                    let decoded = decode_frame_or_discard(&buf, self.bus_index, ts);
                    if let Some(frame) = decoded {
                        frames.push(frame);
                    }
                },
                Ok(None) => break, // would block: nothing more queued right now
                Err(e) => return Err(e),
            }
        }

        Ok(frames)
    }

    /// Serializes and writes one frame. A short write is treated as failure;
    /// the frame is not retried (the Bridge Core counts it as a drop).
    ///
    /// # Errors
    ///
    /// [`BusError::WriteFailed`] on any OS error or partial write.
    pub fn write(&self, frame: &Frame) -> Result<(), BusError> {
        let buf = encode_for_transmit(frame);

        // SAFETY: `buf` is a valid, fully-initialized byte buffer owned by
        // this call; `self.fd` is a valid open socket.
        let written =
            unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };

        if written < 0 {
            return Err(BusError::WriteFailed(io::Error::last_os_error()));
        }
        if written as usize != buf.len() {
            return Err(BusError::WriteFailed(io::Error::new(
                io::ErrorKind::WriteZero,
                "partial write to CAN socket",
            )));
        }
        Ok(())
    }
}

/// Decodes a drained buffer, discarding it on any codec error rather than
/// panicking: a malformed buffer of an otherwise-matching size is as
/// unreadable as one of a mismatched size, per the Bus Socket contract.
fn decode_frame_or_discard(buf: &[u8], bus: u8, timestamp: Duration) -> Option<Frame> {
    match decode_any(buf, bus, timestamp) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::warn!(%error, "discarding frame that failed to decode");
            None
        },
    }
}

fn wall_clock_now() -> Duration {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

fn set_bool_sockopt(fd: RawFd, level: i32, name: i32, enabled: bool) -> io::Result<()> {
    let value: i32 = i32::from(enabled);
    // SAFETY: `value` lives for the duration of the call and its size matches
    // the `option_len` argument.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            std::ptr::addr_of!(value).cast(),
            size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: standard fcntl(2) get/set flags sequence on a valid fd.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: see above.
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// Reads one datagram via `recvmsg`, extracting the kernel's `SO_TIMESTAMP`
/// ancillary data when present. Returns `Ok(None)` on `EAGAIN`/`EWOULDBLOCK`.
fn recv_one(fd: RawFd, max_size: usize) -> io::Result<Option<(Vec<u8>, Option<Duration>)>> {
    let mut buf = vec![0u8; max_size];
    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr().cast(), iov_len: buf.len() };

    const CMSG_BUF_LEN: usize = 64;
    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = std::ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = CMSG_BUF_LEN;

    // SAFETY: `msg` points to valid, correctly-sized iovec and control
    // buffers that outlive this call.
    let received = unsafe { libc::recvmsg(fd, std::ptr::addr_of_mut!(msg), 0) };

    if received < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            _ => Err(err),
        };
    }

    buf.truncate(received as usize);

    let timestamp = extract_timestamp(&msg);
    Ok(Some((buf, timestamp)))
}

fn extract_timestamp(msg: &libc::msghdr) -> Option<Duration> {
    // SAFETY: `msg` was populated by a successful `recvmsg` call with a
    // control buffer of the size we supplied; `CMSG_FIRSTHDR`/`CMSG_NXTHDR`
    // only ever walk within that buffer.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SO_TIMESTAMP {
                let tv = libc::CMSG_DATA(cmsg).cast::<libc::timeval>();
                let tv = *tv;
                return Some(
                    Duration::from_secs(tv.tv_sec.max(0) as u64)
                        + Duration::from_micros(tv.tv_usec.max(0) as u64),
                );
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_is_not_found() {
        let result = BusSocket::open("canbridge-test-nonexistent0", false, 0);
        assert!(matches!(result, Err(BusError::NotFound(_))));
    }
}
