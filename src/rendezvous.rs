//! Connection-path resolution and the initial textual handshake.
//!
//! Resolves a logical key to a concrete UNIX socket path (abstract
//! namespace / absolute / home-relative), connects, exchanges the
//! optional connection key for the shared-memory key, and hands back the
//! connected socket plus that key. `arcan_shmif_connect`/
//! `arcan_shmif_resolve_connpath` in the original control loop.

use std::io::{Read, Write};
use std::mem::size_of;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::wire::SHMKEY_LIM;

/// Default prefix used to resolve a connection path. A leading NUL selects
/// the Linux abstract socket namespace; an absolute path is used as-is;
/// anything else is resolved relative to `$HOME`.
pub const DEFAULT_PREFIX: &str = "\0arcan-";

/// Resolve `key` against `prefix` into a concrete socket path string
/// (the first byte of an abstract-namespace path is a literal NUL).
pub fn resolve_connpath(prefix: &str, key: &str) -> Result<String> {
    let resolved = if prefix.starts_with('\0') {
        format!("{}{}", &prefix[1..], key)
    } else if prefix.starts_with('/') {
        format!("{}{}", prefix, key)
    } else {
        let home = std::env::var("HOME").unwrap_or_default();
        format!("{}/.{}{}", home, prefix, key)
    };

    if resolved.len() > 107 {
        return Err(Error::KeyTooLong { limit: 107 });
    }
    Ok(resolved)
}

/// Result of a successful rendezvous: the connected socket and the
/// shared-memory key the server handed back.
pub struct Rendezvous {
    pub stream: UnixStream,
    pub key: String,
}

/// Connect to `connpath` (already-resolved or raw, see [`resolve_connpath`]),
/// optionally sending `connkey` first, and read back the shared-memory key.
pub fn connect(path: &str, connkey: Option<&str>) -> Result<Rendezvous> {
    let stream = connect_socket(path)?;

    if let Some(key) = connkey {
        if key.len() + 1 > SHMKEY_LIM {
            return Err(Error::KeyTooLong { limit: SHMKEY_LIM });
        }
        let mut line = key.to_owned();
        line.push('\n');
        (&stream)
            .write_all(line.as_bytes())
            .map_err(|inner| Error::Rendezvous { inner })?;
    }

    let key = read_key_line(&stream)?;
    Ok(Rendezvous { stream, key })
}

/// Retry `connect` with exponential backoff (`2^min(attempt, 4)` seconds)
/// until it succeeds or `max_attempts` is exhausted.
pub fn connect_loop(path: &str, connkey: Option<&str>, max_attempts: u32) -> Result<Rendezvous> {
    let mut attempt = 0;
    loop {
        match connect(path, connkey) {
            Ok(rv) => return Ok(rv),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(e);
                }
                let backoff = 1u64 << attempt.min(4);
                debug!("connect attempt {} failed ({}), retrying in {}s", attempt, e, backoff);
                std::thread::sleep(Duration::from_secs(backoff));
            }
        }
    }
}

/// Connects via raw `libc::connect` rather than `std`'s socket-address
/// helpers, since an abstract-namespace address (a leading NUL byte inside
/// `sun_path`, not a NUL-terminated string) isn't expressible through the
/// path-based constructors `std::os::unix::net` offers.
fn connect_socket(path: &str) -> Result<UnixStream> {
    let bytes = path.as_bytes();
    let sun_path_len = size_of::<libc::sockaddr_un>() - size_of::<libc::sa_family_t>();
    if bytes.len() > sun_path_len {
        return Err(Error::KeyTooLong { limit: sun_path_len });
    }

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            addr.sun_path.as_mut_ptr() as *mut u8,
            bytes.len(),
        );
    }
    // abstract-namespace addresses are sized to the prefix + name, with no
    // trailing NUL; path-based addresses include the terminator.
    let addrlen = size_of::<libc::sa_family_t>()
        + bytes.len()
        + if path.starts_with('\0') { 0 } else { 1 };

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::Rendezvous {
            inner: std::io::Error::last_os_error(),
        });
    }
    disable_sigpipe(fd);

    let rv = unsafe {
        libc::connect(
            fd,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            addrlen as libc::socklen_t,
        )
    };
    if rv != 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Rendezvous { inner: err });
    }

    Ok(unsafe { UnixStream::from_raw_fd(fd) })
}

/// Keep a write to a peer that has already hung up from raising `SIGPIPE`
/// and killing the process — the original does the equivalent
/// `setsockopt(sock, SOL_SOCKET, SO_NOSIGPIPE, ...)` right after opening the
/// rendezvous socket. Linux has no per-socket `SO_NOSIGPIPE`, so there the
/// signal is ignored process-wide instead, matching how the rest of the
/// original's platform shims fall back to a global disposition where BSD has
/// a socket option.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn disable_sigpipe(fd: RawFd) {
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn disable_sigpipe(_fd: RawFd) {
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
}

fn read_key_line(stream: &UnixStream) -> Result<String> {
    let mut reader = stream;
    let mut buf = Vec::with_capacity(SHMKEY_LIM);
    let mut byte = [0u8; 1];
    loop {
        let n = reader
            .read(&mut byte)
            .map_err(|inner| Error::Rendezvous { inner })?;
        if n == 0 {
            return Err(Error::Rendezvous {
                inner: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed during handshake"),
            });
        }
        if byte[0] == b'\n' || buf.len() >= SHMKEY_LIM {
            break;
        }
        buf.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_abstract_prefix_drops_leading_nul() {
        let resolved = resolve_connpath("\0arcan-", "demo").unwrap();
        assert_eq!(resolved, "arcan-demo");
    }

    #[test]
    fn resolve_absolute_prefix_concatenates() {
        let resolved = resolve_connpath("/tmp/arcan-", "demo").unwrap();
        assert_eq!(resolved, "/tmp/arcan-demo");
    }

    #[test]
    fn resolve_relative_prefix_is_home_rooted() {
        std::env::set_var("HOME", "/home/tester");
        let resolved = resolve_connpath("arcan-", "demo").unwrap();
        assert_eq!(resolved, "/home/tester/.arcan-demo");
    }

    #[test]
    fn handshake_round_trips_key_over_loopback() {
        use std::os::unix::net::UnixListener;
        let dir = std::env::temp_dir().join(format!("shmif-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("rendezvous.sock");
        let _ = std::fs::remove_file(&sock_path);

        let listener = UnixListener::bind(&sock_path).unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"shmkey123\n").unwrap();
        });

        let rv = connect(sock_path.to_str().unwrap(), None).unwrap();
        assert_eq!(rv.key, "shmkey123");
        server.join().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
