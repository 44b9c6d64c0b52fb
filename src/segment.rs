//! Segment mapping: opening the shared-memory object, mapping (and
//! remapping, if the server advertises a larger size), and opening the
//! trio of named semaphores.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

use log::debug;

use crate::error::{Error, Result};
use crate::wire::{SegmentPage, START_SZ};

/// A POSIX named semaphore handle (`sem_open`/`sem_wait`/`sem_post`).
/// Thin wrapper matching the teacher's `PerfFile`-style RAII-over-libc
/// pattern (`anp-perf_events/src/fd.rs`).
#[derive(Debug)]
pub struct Semaphore {
    handle: *mut libc::sem_t,
}

// SAFETY: POSIX semaphores are designed for cross-thread and cross-process
// use; the kernel serializes access to the underlying counter.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    fn open(name: &str) -> Result<Self> {
        let cname = CString::new(name).expect("semaphore name has no interior NUL");
        let handle = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if handle == libc::SEM_FAILED {
            return Err(Error::SemaphoreOpen {
                name: name.to_owned(),
                inner: nix::Error::last(),
            });
        }
        Ok(Semaphore { handle })
    }

    fn unlink(name: &str) {
        let cname = CString::new(name).expect("semaphore name has no interior NUL");
        if unsafe { libc::sem_unlink(cname.as_ptr()) } != 0 {
            debug!("sem_unlink({}) failed: {}", name, io::Error::last_os_error());
        }
    }

    pub fn wait(&self) {
        loop {
            let rv = unsafe { libc::sem_wait(self.handle) };
            if rv == 0 {
                return;
            }
            if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                return;
            }
        }
    }

    pub fn trywait(&self) -> bool {
        unsafe { libc::sem_trywait(self.handle) == 0 }
    }

    pub fn post(&self) {
        unsafe {
            libc::sem_post(self.handle);
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.handle);
        }
    }
}

#[cfg(test)]
impl Semaphore {
    /// Create (and unlink immediately, keeping only the open handle) a
    /// throwaway named semaphore for tests elsewhere in the crate that need
    /// a real handle to wait/post on without standing up a full segment.
    pub(crate) fn create_for_test(name: &str, initial: u32) -> Self {
        let cname = CString::new(name).unwrap();
        let handle = unsafe { libc::sem_open(cname.as_ptr(), libc::O_CREAT, 0o600, initial) };
        assert_ne!(handle, libc::SEM_FAILED, "sem_open failed: {}", io::Error::last_os_error());
        Semaphore::unlink(name);
        Semaphore { handle }
    }
}

pub struct SemaphoreTrio {
    pub video: Semaphore,
    pub audio: Semaphore,
    pub event: Semaphore,
}

/// Given shared-memory key `key`, the semaphore basename is `key` with its
/// last character replaced: `v`/`a`/`e` suffixes for video/audio/event.
fn sem_name(key: &str, suffix: char) -> String {
    let mut base = key.to_owned();
    if let Some(last) = base.len().checked_sub(1) {
        base.replace_range(last.., &suffix.to_string());
    }
    base
}

/// A mapped segment: raw memory plus the fd it came from (needed to remap
/// on resize) and the three semaphores.
pub struct MappedSegment {
    pub fd: RawFd,
    pub page: *mut SegmentPage,
    pub len: usize,
    pub semaphores: SemaphoreTrio,
}

unsafe impl Send for MappedSegment {}

impl MappedSegment {
    /// Open `key`, map `START_SZ` bytes, remap at the server-advertised
    /// size if different, then open the three semaphores. Unlinks all
    /// names (shm object + semaphores) when `force_unlink` is set, which
    /// is the common case for a client that does not want to leak
    /// filesystem-visible IPC names.
    pub fn open(key: &str, force_unlink: bool) -> Result<Self> {
        let cname = CString::new(key).expect("shm key has no interior NUL");
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o700) };
        if fd < 0 {
            return Err(Error::SegmentMap {
                inner: io::Error::last_os_error(),
            });
        }

        let mut len = START_SZ;
        let mut addr = unsafe { mmap_rw(fd, len) };
        if addr.is_null() {
            unsafe { libc::close(fd) };
            return Err(Error::SegmentMap {
                inner: io::Error::last_os_error(),
            });
        }

        if force_unlink {
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }

        let page = addr as *mut SegmentPage;
        let advertised = unsafe { (*page).segment_size };
        if advertised != len {
            debug!("segment {} advertises size {}, remapping", key, advertised);
            unsafe { libc::munmap(addr, len) };
            len = advertised;
            addr = unsafe { mmap_rw(fd, len) };
            if addr.is_null() {
                unsafe { libc::close(fd) };
                return Err(Error::SegmentMap {
                    inner: io::Error::last_os_error(),
                });
            }
        }

        let semaphores = match open_semaphores(key, force_unlink) {
            Ok(s) => s,
            Err(e) => {
                unsafe {
                    libc::munmap(addr, len);
                    libc::close(fd);
                }
                return Err(e);
            }
        };

        Ok(MappedSegment {
            fd,
            page: addr as *mut SegmentPage,
            len,
            semaphores,
        })
    }

    /// Remap the same fd at a new size (used after a resize ack). Returns
    /// the new page pointer; callers must re-bind any cached pointers into
    /// the old mapping.
    pub fn remap(&mut self, new_len: usize) -> Result<()> {
        unsafe {
            libc::munmap(self.page as *mut libc::c_void, self.len);
        }
        let addr = unsafe { mmap_rw(self.fd, new_len) };
        if addr.is_null() {
            return Err(Error::SegmentMap {
                inner: io::Error::last_os_error(),
            });
        }
        self.page = addr as *mut SegmentPage;
        self.len = new_len;
        Ok(())
    }
}

unsafe fn mmap_rw(fd: RawFd, len: usize) -> *mut libc::c_void {
    let addr = libc::mmap(
        std::ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        fd,
        0,
    );
    if addr == libc::MAP_FAILED {
        std::ptr::null_mut()
    } else {
        addr
    }
}

fn open_semaphores(key: &str, force_unlink: bool) -> Result<SemaphoreTrio> {
    let vname = sem_name(key, 'v');
    let aname = sem_name(key, 'a');
    let ename = sem_name(key, 'e');

    let video = Semaphore::open(&vname)?;
    if force_unlink {
        Semaphore::unlink(&vname);
    }
    let audio = Semaphore::open(&aname)?;
    if force_unlink {
        Semaphore::unlink(&aname);
    }
    let event = Semaphore::open(&ename)?;
    if force_unlink {
        Semaphore::unlink(&ename);
    }

    Ok(SemaphoreTrio { video, audio, event })
}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.page as *mut libc::c_void, self.len);
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sem_name_replaces_last_char() {
        assert_eq!(sem_name("abcde", 'v'), "abcdv");
        assert_eq!(sem_name("abcde", 'a'), "abcda");
        assert_eq!(sem_name("abcde", 'e'), "abcde");
    }

    #[test]
    fn open_reports_io_error_for_missing_key() {
        let err = MappedSegment::open("/shmif-test-definitely-missing-key", false);
        assert!(err.is_err());
    }
}
