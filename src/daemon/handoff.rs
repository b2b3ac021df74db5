//! Descriptor handoff over a Unix domain socket.
//!
//! Each handed-off connection travels as a single `sendmsg`: one sentinel
//! data byte plus the connection's descriptor attached as `SCM_RIGHTS`
//! ancillary data. The kernel installs a duplicate in the receiving
//! process, so the sender closes its own copy afterwards.

use crate::error::{MuxError, Result};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Data byte that accompanies every handed-off descriptor.
pub const SENTINEL: u8 = 0x55;

/// Descriptors we leave room for on receive, so that a peer sending more
/// than one can be detected and cleaned up instead of truncated.
const RECV_FD_SLOTS: usize = 4;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

fn cmsg_space(fds: usize) -> usize {
    let payload = (fds * mem::size_of::<libc::c_int>()) as libc::c_uint;
    // SAFETY: CMSG_SPACE is a pure size computation.
    unsafe { libc::CMSG_SPACE(payload) as usize }
}

/// Hand `fd` to the peer of `channel`. The descriptor is consumed and closed
/// locally whether or not the transfer succeeds.
pub async fn send_fd(channel: &UnixStream, fd: OwnedFd) -> Result<()> {
    let sock = channel.as_raw_fd();
    let raw = fd.as_raw_fd();
    let sent = channel
        .async_io(Interest::WRITABLE, || sendmsg_with_fd(sock, raw))
        .await;
    drop(fd);
    match sent {
        Ok(1) => Ok(()),
        Ok(n) => Err(MuxError::reset(format!("short handoff write ({n} bytes)"))),
        Err(e) => Err(e.into()),
    }
}

fn sendmsg_with_fd(sock: RawFd, fd: RawFd) -> io::Result<usize> {
    let mut data = [SENTINEL];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: data.len(),
    };

    let space = cmsg_space(1);
    let mut control = vec![0u8; space];

    // SAFETY: msghdr is plain old data; every field we rely on is set below.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = space as _;

    // SAFETY: `control` is CMSG_SPACE(sizeof(int)) bytes, so the first header
    // and its single-int payload are in bounds.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::c_int>() as libc::c_uint) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::c_int>(), fd);
    }

    // SAFETY: msg points at live buffers for the duration of the call.
    let n = unsafe { libc::sendmsg(sock, &msg, SEND_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Receive exactly one handed-off descriptor from `channel`.
pub async fn recv_fd(channel: &UnixStream) -> Result<OwnedFd> {
    let sock = channel.as_raw_fd();
    let (n, byte, mut fds, truncated) = channel
        .async_io(Interest::READABLE, || recvmsg_with_fds(sock))
        .await?;

    if n == 0 {
        return Err(MuxError::reset("daemon closed the registration channel"));
    }
    if truncated {
        return Err(MuxError::reset("ancillary data truncated"));
    }
    if n != 1 || byte != SENTINEL {
        return Err(MuxError::reset(format!(
            "malformed handoff unit ({n} bytes, first {byte:#04x})"
        )));
    }
    match fds.len() {
        1 => Ok(fds.remove(0)),
        0 => Err(MuxError::reset("handoff carried no descriptor")),
        // Dropping `fds` closes every extra descriptor.
        count => Err(MuxError::reset(format!(
            "handoff carried {count} descriptors"
        ))),
    }
}

type Received = (usize, u8, Vec<OwnedFd>, bool);

fn recvmsg_with_fds(sock: RawFd) -> io::Result<Received> {
    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: 1,
    };

    let space = cmsg_space(RECV_FD_SLOTS);
    let mut control = vec![0u8; space];

    // SAFETY: see sendmsg_with_fd.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = space as _;

    // SAFETY: msg points at live buffers for the duration of the call.
    let n = unsafe { libc::recvmsg(sock, &mut msg, RECV_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = Vec::new();
    // SAFETY: the kernel filled `control` up to msg_controllen; the CMSG_*
    // macros only walk headers inside that range.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let header = libc::CMSG_LEN(0) as usize;
                let count = ((*cmsg).cmsg_len as usize - header) / mem::size_of::<libc::c_int>();
                let base = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
                for i in 0..count {
                    let fd = std::ptr::read_unaligned(base.add(i));
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    let truncated = msg.msg_flags & libc::MSG_CTRUNC != 0;
    Ok((n as usize, data[0], fds, truncated))
}

/// Whether a failed `send_fd` means the registrant channel itself is gone,
/// as opposed to a single transfer that could not be completed.
pub fn is_fatal(err: &MuxError) -> bool {
    match err {
        MuxError::Io(e) => matches!(
            e.raw_os_error(),
            Some(libc::EPIPE | libc::ECONNRESET | libc::ENOTCONN | libc::EBADF)
        ),
        MuxError::ConnectionReset(_) | MuxError::PeerClosed => true,
        _ => false,
    }
}
