//! File-descriptor passing over the event socket.
//!
//! After every descriptor-bearing event the server writes into the inbound
//! ring, it follows up with exactly one `sendmsg`+`SCM_RIGHTS` carrying the
//! associated descriptor (a frame buffer for BCHUNK_IN/OUT, a new segment's
//! key for NEWSEGMENT, a font file for FONTHINT, ...). The payload bytes
//! alongside the ancillary data are a single sentinel byte; only the fd
//! matters.

use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

use crate::error::{Error, Result};

const SENTINEL: u8 = 1;

/// Send `fd` across `stream` as SCM_RIGHTS ancillary data.
pub fn send_fd(stream: &UnixStream, fd: RawFd) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let sock_fd = stream.as_raw_fd();
    let fd_size = std::mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let payload = [SENTINEL];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_space as _,
        msg_flags: 0,
    };

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        let data_ptr = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
        std::ptr::write_unaligned(data_ptr, fd);
    }

    let n = unsafe { libc::sendmsg(sock_fd, &msg, 0) };
    if n < 0 {
        return Err(Error::Io {
            inner: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Attempt to receive one fd from `stream`. Blocks unless `stream` has been
/// put into non-blocking mode by the caller; in that case a `WouldBlock` /
/// `EAGAIN` condition is reported as `Ok(None)` rather than an error.
pub fn recv_fd(stream: &UnixStream) -> Result<Option<RawFd>> {
    use std::os::unix::io::AsRawFd;

    let sock_fd = stream.as_raw_fd();
    let fd_size = std::mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];
    let mut payload = [0u8; 1];

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_buf.len() as _,
        msg_flags: 0,
    };

    let n = unsafe { libc::recvmsg(sock_fd, &mut msg, 0) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(Error::Io { inner: err });
    }
    if n == 0 {
        return Err(Error::PeerDead);
    }

    let mut found = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                found = Some(std::ptr::read_unaligned(data as *const libc::c_int));
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(found)
}

/// Puts `stream` into or out of non-blocking mode for the descriptor-channel
/// poll used by a non-blocking dequeue.
pub fn set_nonblocking(stream: &UnixStream, nonblocking: bool) -> Result<()> {
    stream.set_nonblocking(nonblocking).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rv = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rv, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn fd_round_trips_over_socketpair() {
        let (a, b) = UnixStream::pair().unwrap();
        let (r, w) = make_pipe();

        send_fd(&a, w).unwrap();
        let got = recv_fd(&b).unwrap().expect("fd should have arrived");
        assert_ne!(got, w);

        unsafe {
            libc::close(r);
            libc::close(w);
            libc::close(got);
        }
    }

    #[test]
    fn nonblocking_recv_reports_none_when_idle() {
        let (_a, b) = UnixStream::pair().unwrap();
        set_nonblocking(&b, true).unwrap();
        assert!(recv_fd(&b).unwrap().is_none());
    }
}
