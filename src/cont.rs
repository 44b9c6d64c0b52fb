//! Endpoint context: the handle a caller holds for one segment — the
//! mapped page, event state, guard watcher, and acquisition config bundled
//! together. Mirrors `arcan_shmif_acquire`/`arcan_shmif_open`/
//! `arcan_shmif_drop` in the original control loop.

use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

use log::{info, warn};

use crate::argstr::{self, Arg};
use crate::error::{Error, Result};
use crate::event::{Dequeued, EventFlags, EventState};
use crate::guard::{GuardHandle, GuardTarget};
use crate::rendezvous;
use crate::resize::{self, ResizeTarget};
use crate::ring::EventRing;
use crate::segment::MappedSegment;
use crate::signal::{self, SignalMask};
use crate::wire::{cookie, Event, EventCategory, EventPayload, IoVal, TargetCommand, TargetEvent, VCHANNELS};

bitflags::bitflags! {
    /// Acquisition-time behavior toggles, the typed replacement for the
    /// original's varargs fatal-exit callback parameter.
    pub struct AcquireFlags: u32 {
        /// Exit the process on acquisition failure instead of returning `Err`.
        const FATALFAIL     = 0b0001;
        /// Don't spawn the guard watcher thread for this endpoint.
        const DISABLE_GUARD = 0b0010;
        /// Surface PAUSE/UNPAUSE as ordinary events instead of filtering them.
        const MANUAL_PAUSE  = 0b0100;
        /// Leave the shm object and semaphore names linked after opening.
        const DONT_UNLINK   = 0b1000;
    }
}

/// Segment category advertised via the initial REGISTER event. Only the
/// values this crate's callers need are modeled; `arcan_shmif.h`'s
/// `ARCAN_SEGID` carries many more.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentKind {
    Application = 2,
    Encoder = 9,
    ClipboardPaste = 13,
}

impl SegmentKind {
    fn is_output(self) -> bool {
        matches!(self, SegmentKind::Encoder | SegmentKind::ClipboardPaste)
    }
}

/// Bundled parameters for [`ShmifCont::connect`].
#[derive(Default)]
pub struct ConnectConfig {
    pub connpath: Option<String>,
    pub connkey: Option<String>,
    pub flags: AcquireFlags,
    pub segment_kind: Option<SegmentKind>,
    /// Invoked (with the same process-exit code `FATALFAIL` would use)
    /// instead of exiting the process, when set alongside `FATALFAIL`.
    pub fatal_hook: Option<Box<dyn FnMut(i32) + Send>>,
}

/// The owning handle for one mapped segment: page, semaphores, event
/// socket, ring views, guard thread, and the audio/video back-buffer
/// pointer arrays recomputed on acquire and on every resize.
pub struct ShmifCont {
    segment: MappedSegment,
    events: EventState,
    guard: Option<GuardHandle>,
    flags: AcquireFlags,
    output: bool,
    vbuf: Vec<*mut u8>,
    abuf: Vec<*mut u8>,
}

// SAFETY: every field is either already `Send` (`MappedSegment`,
// `EventState`, `GuardHandle`) or a pointer into memory owned by
// `segment`, which only this handle unmaps.
unsafe impl Send for ShmifCont {}

impl ShmifCont {
    /// `arcan_shmif_connect` + `arcan_shmif_acquire(NULL, ...)`: resolve
    /// and connect to a rendezvous socket, then acquire the segment it
    /// hands back.
    pub fn connect(config: ConnectConfig) -> Result<Self> {
        let result = Self::connect_inner(&config);
        Self::handle_acquire_failure(result, config.flags, config.fatal_hook)
    }

    fn connect_inner(config: &ConnectConfig) -> Result<Self> {
        let path = config
            .connpath
            .clone()
            .unwrap_or_else(|| rendezvous::DEFAULT_PREFIX.to_owned());
        let rv = rendezvous::connect(&path, config.connkey.as_deref())?;
        Self::acquire(rv.stream, &rv.key, config.flags, config.segment_kind, true)
    }

    /// `arcan_shmif_open`: the environment-variable bootstrap. Returns the
    /// acquired endpoint plus the decoded `ARCAN_ARG` blob, matching the
    /// original's `outarg` out-parameter.
    pub fn open(flags: AcquireFlags, segment_kind: Option<SegmentKind>) -> Result<(Self, Vec<Arg>)> {
        let args = match std::env::var("ARCAN_ARG") {
            Ok(blob) => argstr::unpack(&blob)?,
            Err(_) => Vec::new(),
        };

        let result = Self::open_inner(flags, segment_kind);
        let cont = Self::handle_acquire_failure(result, flags, None)?;
        Ok((cont, args))
    }

    fn open_inner(flags: AcquireFlags, segment_kind: Option<SegmentKind>) -> Result<Self> {
        if let (Ok(key), Ok(fdstr)) = (std::env::var("ARCAN_SHMKEY"), std::env::var("ARCAN_SOCKIN_FD")) {
            let fd: RawFd = fdstr.parse().map_err(|_| Error::Rendezvous {
                inner: std::io::Error::new(std::io::ErrorKind::InvalidInput, "ARCAN_SOCKIN_FD is not an fd"),
            })?;
            let stream = unsafe { UnixStream::from_raw_fd(fd) };
            return Self::acquire(stream, &key, flags, segment_kind, !flags.contains(AcquireFlags::DONT_UNLINK));
        }

        if let Ok(connpath) = std::env::var("ARCAN_CONNPATH") {
            let connkey = std::env::var("ARCAN_CONNKEY").ok();
            let rv = if flags.contains(AcquireFlags::FATALFAIL) {
                rendezvous::connect_loop(&connpath, connkey.as_deref(), 8)?
            } else {
                rendezvous::connect(&connpath, connkey.as_deref())?
            };
            return Self::acquire(rv.stream, &rv.key, flags, segment_kind, true);
        }

        Err(Error::Rendezvous {
            inner: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no ARCAN_CONNPATH or inherited ARCAN_SHMKEY/ARCAN_SOCKIN_FD in environment",
            ),
        })
    }

    /// `arcan_shmif_acquire(parent, NULL, ...)`: claim the sub-segment the
    /// parent's last NEWSEGMENT event stashed.
    pub fn acquire_subsegment(parent: &mut ShmifCont, flags: AcquireFlags) -> Result<Self> {
        let (epipe, key) = parent
            .events
            .subsegment
            .take()
            .ok_or_else(|| Error::Rendezvous {
                inner: std::io::Error::new(std::io::ErrorKind::Other, "no pending sub-segment to acquire"),
            })?;

        let force_unlink = !flags.contains(AcquireFlags::DONT_UNLINK);
        let stream = unsafe { UnixStream::from_raw_fd(epipe) };
        Self::acquire(stream, &key, flags, None, force_unlink)
    }

    fn acquire(
        stream: UnixStream,
        shmkey: &str,
        flags: AcquireFlags,
        segment_kind: Option<SegmentKind>,
        force_unlink: bool,
    ) -> Result<Self> {
        let segment = MappedSegment::open(shmkey, force_unlink)?;

        let page = unsafe { &mut *segment.page };
        if page.cookie != cookie() {
            return Err(Error::AbiMismatch);
        }

        let inbound = unsafe {
            EventRing::new(
                &mut page.childevq as *mut _,
                &segment.semaphores.event as *const _,
                Some(&page.dms as *const u8),
            )
        };
        let outbound = unsafe {
            EventRing::new(
                &mut page.parentevq as *mut _,
                &segment.semaphores.event as *const _,
                None,
            )
        };

        let event_flags = if flags.contains(AcquireFlags::MANUAL_PAUSE) {
            EventFlags::MANUAL_PAUSE
        } else {
            EventFlags::empty()
        };
        let events = EventState::new(inbound, outbound, stream, event_flags);

        let guard = if flags.contains(AcquireFlags::DISABLE_GUARD) {
            None
        } else {
            let target = unsafe {
                GuardTarget::new(
                    &mut page.dms as *mut u8,
                    [
                        &segment.semaphores.audio as *const _,
                        &segment.semaphores.video as *const _,
                        &segment.semaphores.event as *const _,
                    ],
                )
            };
            Some(GuardHandle::spawn(page.parent, target, Box::new(|| std::process::exit(1))))
        };

        let output = segment_kind.map(SegmentKind::is_output).unwrap_or(false);

        let mut cont = ShmifCont {
            segment,
            events,
            guard,
            flags,
            output,
            vbuf: Vec::new(),
            abuf: Vec::new(),
        };
        cont.recompute_buffers();

        if let Some(kind) = segment_kind {
            // REGISTER isn't in the client-inspected TargetCommand set, so
            // the kind rides in ioevs[0]; category External per the
            // original's `EVENT_EXTERNAL`/`REGISTER`.
            let mut reg = TargetEvent { kind: TargetCommand::Other, ..Default::default() };
            reg.ioevs[0] = IoVal::Int(kind as i32);
            let ev = Event {
                category: EventCategory::External as u8,
                payload: EventPayload::Target(reg),
            };
            info!("shmif: enqueuing {}", crate::wire::describe(&ev));
            cont.try_enqueue(&ev);
        }

        Ok(cont)
    }

    fn handle_acquire_failure(
        result: Result<Self>,
        flags: AcquireFlags,
        mut fatal_hook: Option<Box<dyn FnMut(i32) + Send>>,
    ) -> Result<Self> {
        if let Err(ref e) = result {
            warn!("shmif: acquisition failed: {}", e);
            if flags.contains(AcquireFlags::FATALFAIL) {
                match fatal_hook.as_deref_mut() {
                    Some(hook) => hook(1),
                    None => std::process::exit(1),
                }
            }
        }
        result
    }

    pub fn is_alive(&self) -> bool {
        self.events.is_alive()
    }

    pub fn is_paused(&self) -> bool {
        self.events.is_paused()
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    pub fn poll(&mut self) -> Dequeued {
        self.events.poll()
    }

    pub fn wait(&mut self) -> Dequeued {
        self.events.wait()
    }

    pub fn enqueue(&mut self, ev: &Event) -> bool {
        self.events.enqueue(ev)
    }

    pub fn try_enqueue(&mut self, ev: &Event) -> bool {
        self.events.try_enqueue(ev)
    }

    /// The first video back-buffer, or `None` if no buffers were granted.
    pub fn vidp(&self) -> Option<*mut u8> {
        self.vbuf.first().copied()
    }

    pub fn audp(&self) -> Option<*mut u8> {
        self.abuf.first().copied()
    }

    pub fn vbuf(&self) -> &[*mut u8] {
        &self.vbuf
    }

    pub fn abuf(&self) -> &[*mut u8] {
        &self.abuf
    }

    /// `shmif_resize`: negotiate a new geometry/buffer count, then
    /// recompute the back-buffer pointer arrays against the (possibly
    /// remapped) page.
    pub fn resize(&mut self, width: u32, height: u32, video_count: Option<i32>, audio_count: Option<i32>) -> Result<()> {
        resize::resize(
            ResizeTarget {
                segment: &mut self.segment,
                guard: self.guard.as_ref(),
                inbound: &mut self.events.inbound,
                outbound: &mut self.events.outbound,
            },
            width,
            height,
            video_count,
            audio_count,
        )?;
        self.recompute_buffers();
        Ok(())
    }

    /// `arcan_shmif_signal`: mark the selected buffer(s) ready and block
    /// per `mask`.
    pub fn signal(&mut self, mask: SignalMask) -> Result<u64> {
        let page = unsafe { &mut *self.segment.page };
        signal::signal(page, &self.segment.semaphores, mask, None)
    }

    /// `arcan_shmif_signalhandle`: hand a descriptor to the peer alongside
    /// the signalled buffer(s).
    pub fn signal_handle(&mut self, fd: RawFd, mask: SignalMask) -> Result<u64> {
        let page = unsafe { &mut *self.segment.page };
        signal::signal_handle(self.events.epipe_ref(), fd, page, &self.segment.semaphores, mask)
    }

    /// `setup_avbuf`: recompute `vbuf`/`abuf` from the page's current
    /// geometry and pending buffer counts, aligning each buffer within the
    /// payload region that follows the fixed page header.
    fn recompute_buffers(&mut self) {
        let page = unsafe { &mut *self.segment.page };
        let vbuf_cnt = page.vpending.max(0) as usize;
        let abuf_cnt = page.apending.max(0) as usize;
        page.vpending = 0;
        page.apending = 0;

        let vstride = page.w as usize * page.h as usize * VCHANNELS;
        let astride = page.abufsize;

        let base = self.segment.page as *mut u8;
        let header = std::mem::size_of::<crate::wire::SegmentPage>();

        self.vbuf.clear();
        self.abuf.clear();

        let mut offset = header;
        for _ in 0..vbuf_cnt {
            self.vbuf.push(unsafe { base.add(offset) });
            offset += vstride;
        }
        for _ in 0..abuf_cnt {
            self.abuf.push(unsafe { base.add(offset) });
            offset += astride;
        }

        info!(
            "shmif: buffers recomputed, {} video / {} audio, geometry {}x{}",
            vbuf_cnt, abuf_cnt, page.w, page.h
        );
    }
}

impl Drop for ShmifCont {
    fn drop(&mut self) {
        let page = unsafe { &mut *self.segment.page };
        page.dms = 0;
        if let Some(guard) = self.guard.take() {
            guard.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_kind_classifies_output_segments() {
        assert!(SegmentKind::Encoder.is_output());
        assert!(SegmentKind::ClipboardPaste.is_output());
        assert!(!SegmentKind::Application.is_output());
    }

    #[test]
    fn connect_config_defaults_to_empty_flags() {
        let config = ConnectConfig::default();
        assert!(config.flags.is_empty());
        assert!(config.connpath.is_none());
    }
}
