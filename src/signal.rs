//! Frame signalling: mark a video and/or audio buffer ready, run any
//! pre-commit hook, and block (or not) on the corresponding semaphore(s).
//! Mirrors `arcan_shmif_signal`/`arcan_shmif_signalhandle` in the original
//! control loop.

use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::time::Instant;

use crate::descriptor;
use crate::error::Result;
use crate::segment::SemaphoreTrio;
use crate::wire::SegmentPage;

bitflags::bitflags! {
    /// Which buffer(s) to signal and how to block while doing it.
    pub struct SignalMask: u32 {
        const VIDEO      = 0b0001;
        const AUDIO      = 0b0010;
        /// Don't block on the semaphore(s) at all.
        const BLK_NONE   = 0b0100;
        /// Block for at most one post, then proceed regardless.
        const BLK_ONCE   = 0b1000;
    }
}

/// A pre-commit hook invoked just before a masked buffer is marked ready,
/// given the chance to substitute the mask (e.g. to skip a buffer that
/// turned out empty). Matches the original's `video_hook`/`audio_hook`.
pub type PreCommitHook<'a> = &'a mut dyn FnMut(SignalMask) -> SignalMask;

/// Mark the requested buffer(s) ready and wait per `mask`. Returns the
/// elapsed time in milliseconds, matching the original's millisecond
/// `arcan_timemillis()` delta return.
pub fn signal(
    page: &mut SegmentPage,
    semaphores: &SemaphoreTrio,
    mut mask: SignalMask,
    mut hook: Option<PreCommitHook>,
) -> Result<u64> {
    if page.dms == 0 {
        return Ok(0);
    }

    let start = Instant::now();

    if mask.contains(SignalMask::VIDEO) {
        if let Some(h) = hook.as_deref_mut() {
            mask = h(mask);
        }
    }
    if mask.contains(SignalMask::AUDIO) {
        if let Some(h) = hook.as_deref_mut() {
            mask = h(mask);
        }
    }

    let no_block = mask.intersects(SignalMask::BLK_NONE | SignalMask::BLK_ONCE);

    let video = mask.contains(SignalMask::VIDEO);
    let audio = mask.contains(SignalMask::AUDIO);

    if video && !audio {
        page.vready = 1;
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        wait_or_trywait(&semaphores.video, no_block);
    } else if audio && !video {
        page.aready = 1;
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        wait_or_trywait(&semaphores.audio, no_block);
    } else if video || audio {
        page.vready = 1;
        // Audio-before-video ordering: the consumer expects the audio
        // buffer to already be flagged ready by the time it observes the
        // video buffer, since a frame may carry both.
        if page.abufused > 0 {
            page.aready = 1;
            std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
            wait_or_trywait(&semaphores.audio, no_block);
        }
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        wait_or_trywait(&semaphores.video, no_block);
    }

    Ok(start.elapsed().as_millis() as u64)
}

fn wait_or_trywait(sem: &crate::segment::Semaphore, no_block: bool) {
    if no_block {
        sem.trywait();
    } else {
        sem.wait();
    }
}

/// Send `fd` over the event socket, enqueue a BUFFERSTREAM-style event
/// describing it, then signal. `arcan_shmif_signalhandle`.
pub fn signal_handle(
    epipe: &UnixStream,
    fd: RawFd,
    page: &mut SegmentPage,
    semaphores: &SemaphoreTrio,
    mask: SignalMask,
) -> Result<u64> {
    descriptor::send_fd(epipe, fd)?;
    signal(page, semaphores, mask, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Semaphore;

    fn test_page() -> Box<SegmentPage> {
        Box::new(SegmentPage::new(std::process::id() as i32))
    }

    /// Real, unlinked-but-open named semaphores, unique per test so
    /// parallel test runs don't collide.
    fn test_trio(tag: &str) -> SemaphoreTrio {
        let pid = std::process::id();
        SemaphoreTrio {
            video: Semaphore::create_for_test(&format!("/shmif-sig-{}-{}-v", pid, tag), 0),
            audio: Semaphore::create_for_test(&format!("/shmif-sig-{}-{}-a", pid, tag), 0),
            event: Semaphore::create_for_test(&format!("/shmif-sig-{}-{}-e", pid, tag), 0),
        }
    }

    #[test]
    fn signalling_a_dead_endpoint_is_a_quiet_no_op() {
        let mut page = test_page();
        page.dms = 0;
        let semaphores = test_trio("dead");
        let elapsed = signal(&mut page, &semaphores, SignalMask::VIDEO | SignalMask::BLK_NONE, None).unwrap();
        assert_eq!(elapsed, 0);
    }

    #[test]
    fn video_mask_flags_vready_without_blocking() {
        let mut page = test_page();
        let semaphores = test_trio("video");
        signal(&mut page, &semaphores, SignalMask::VIDEO | SignalMask::BLK_NONE, None).unwrap();
        assert_eq!(page.vready, 1);
        assert_eq!(page.aready, 0);
    }

    #[test]
    fn precommit_hook_can_downgrade_the_mask() {
        let mut page = test_page();
        let semaphores = test_trio("hook");
        let mut hook = |_m: SignalMask| SignalMask::BLK_NONE;
        signal(
            &mut page,
            &semaphores,
            SignalMask::VIDEO | SignalMask::BLK_NONE,
            Some(&mut hook),
        )
        .unwrap();
        assert_eq!(page.vready, 0);
    }

    #[test]
    fn combined_mask_signals_audio_before_video_when_audio_buffered() {
        let mut page = test_page();
        page.abufused = 1;
        let semaphores = test_trio("combo");
        signal(
            &mut page,
            &semaphores,
            SignalMask::VIDEO | SignalMask::AUDIO | SignalMask::BLK_NONE,
            None,
        )
        .unwrap();
        assert_eq!(page.vready, 1);
        assert_eq!(page.aready, 1);
    }
}
