//! Background watcher that polls the parent process's liveness and, if it
//! has gone away, pulls the dead-man's switch and wakes every blocked
//! waiter. Mirrors `guard_thread`/`parent_alive`/`spawn_guardthread` in the
//! original control loop, as a `std::thread` rather than a raw pthread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::error::Result;
use crate::segment::Semaphore;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Grace period after pulling the switch before the at-exit hook runs, in
/// case the host is already mid-teardown and calls `drop` in time.
const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A pointer to the page's `dms` byte plus the three semaphores to post
/// when the switch is pulled, shared between the owning endpoint and the
/// watcher thread it spawns.
pub struct GuardTarget {
    dms: *mut u8,
    semaphores: [*const Semaphore; 3],
}

unsafe impl Send for GuardTarget {}

impl GuardTarget {
    /// # Safety
    /// `dms` and every semaphore pointer must remain valid for as long as
    /// the returned guard (and the thread it may spawn) is alive. Callers
    /// re-point `dms` via [`GuardHandle::relocate_with`] after a resize
    /// remap, under the same lock the watcher thread checks.
    pub unsafe fn new(dms: *mut u8, semaphores: [*const Semaphore; 3]) -> Self {
        GuardTarget { dms, semaphores }
    }

    fn pull(&self) {
        unsafe { *self.dms = 0 };
        for sem in &self.semaphores {
            if !sem.is_null() {
                unsafe { &**sem }.post();
            }
        }
    }
}

/// Handle to a running guard thread. Dropping it (without calling
/// [`GuardHandle::stop`] first) lets the thread keep polling — the
/// original's guard thread is likewise detached and frees its own state on
/// exit, since it may outlive the context that spawned it during teardown
/// races.
pub struct GuardHandle {
    active: Arc<AtomicBool>,
    target: Arc<std::sync::Mutex<GuardTarget>>,
    join: Option<JoinHandle<()>>,
}

impl GuardHandle {
    /// Spawn the watcher. `parent_pid` is the process to poll. After pulling
    /// the switch, the thread sleeps out [`GRACE_PERIOD`] and, unless
    /// [`GuardHandle::stop`] was called in the meantime, invokes `on_dead`
    /// once — matching the original's `guard_thread`, which pulls, sleeps
    /// 5s, then unconditionally calls `gstr->guard.exitf(EXIT_FAILURE)`.
    pub fn spawn(parent_pid: i32, target: GuardTarget, on_dead: Box<dyn FnOnce() + Send + 'static>) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let target = Arc::new(std::sync::Mutex::new(target));

        let active_bg = Arc::clone(&active);
        let target_bg = Arc::clone(&target);
        let join = std::thread::spawn(move || {
            while active_bg.load(Ordering::Relaxed) {
                if !parent_alive(parent_pid) {
                    debug!("guard: parent {} is gone, pulling the dead-man switch", parent_pid);
                    target_bg.lock().unwrap().pull();
                    std::thread::sleep(GRACE_PERIOD);
                    if active_bg.load(Ordering::Relaxed) {
                        warn!("guard: peer did not tear down within the grace period");
                        on_dead();
                    }
                    return;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        });

        GuardHandle {
            active,
            target,
            join: Some(join),
        }
    }

    /// Run `f` — which performs the unmap/remap and returns the relocated
    /// `dms`/semaphore pointers — with the watcher's target lock held for
    /// the whole sequence, so the watcher thread can never observe or
    /// dereference a pointer mid-remap. Replaces a bare `remap` followed by
    /// a separately-locked pointer update, which left a window where the
    /// lock was acquired only after the old mapping was already gone.
    pub fn relocate_with<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<(*mut u8, [*const Semaphore; 3])>,
    {
        let mut guard = self.target.lock().unwrap();
        let (dms, semaphores) = f()?;
        guard.dms = dms;
        guard.semaphores = semaphores;
        Ok(())
    }

    /// Stop polling. Does not join; the thread notices on its next wake (or,
    /// if already past the dead-man check, during the grace-period sleep)
    /// and exits without invoking `on_dead` or touching a possibly
    /// already-unmapped target.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Relaxed);
    }
}

impl Drop for GuardHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            // Detach rather than block teardown on the sleep interval.
            drop(join);
        }
    }
}

/// `parent_alive`: `kill(pid, 0)` succeeding (or failing with `EPERM`, which
/// still proves the pid is live) means the process exists.
fn parent_alive(pid: i32) -> bool {
    let rv = unsafe { libc::kill(pid, 0) };
    if rv == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
