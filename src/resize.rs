//! Resize negotiation: publish the desired geometry and buffer counts,
//! signal the request, wait for the server's acknowledgment, remap if the
//! segment grew, and rebind the ring views. Mirrors `shmif_resize` in the
//! original control loop.

use crate::error::{Error, Result};
use crate::guard::GuardHandle;
use crate::ring::EventRing;
use crate::segment::MappedSegment;
use crate::wire::{MAX_H, MAX_W};

/// Everything a resize needs to mutate: the mapped segment (for the remap),
/// the guard thread (so it re-points at the new `dms` address), and the two
/// ring views (so they're re-bound against the new mapping).
pub struct ResizeTarget<'a> {
    pub segment: &'a mut MappedSegment,
    pub guard: Option<&'a GuardHandle>,
    pub inbound: &'a mut EventRing,
    pub outbound: &'a mut EventRing,
}

/// Negotiate a new geometry. `video_count`/`audio_count` of `None` keep
/// the endpoint's current buffer counts (the original's `vidc < 0`/
/// `audc < 0` sentinel).
/// Bounds-check a requested geometry ahead of any page/segment access.
fn validate_geometry(width: u32, height: u32) -> Result<()> {
    if width > MAX_W || height > MAX_H {
        return Err(Error::ResizeRejected {
            reason: format!("{}x{} exceeds the {}x{} limit", width, height, MAX_W, MAX_H),
        });
    }
    Ok(())
}

pub fn resize(
    target: ResizeTarget,
    width: u32,
    height: u32,
    video_count: Option<i32>,
    audio_count: Option<i32>,
) -> Result<()> {
    validate_geometry(width, height)?;

    let page = unsafe { &mut *target.segment.page };
    if page.dms == 0 {
        return Err(Error::PeerDead);
    }

    let width = width.max(1);
    let height = height.max(1);
    let video_count = video_count.unwrap_or(page.vpending);
    let audio_count = audio_count.unwrap_or(page.apending);

    if width == page.w && height == page.h && video_count == page.vpending && audio_count == page.apending {
        return Ok(());
    }

    // Wait out any outstanding video buffer in flight before renegotiating.
    while page.vready != 0 && page.dms != 0 {
        target.segment.semaphores.video.wait();
    }

    // Strict ordering: publish geometry, fence, THEN raise the request flag.
    page.w = width;
    page.h = height;
    page.apending = audio_count;
    page.vpending = video_count;
    std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
    page.resized = 1;
    std::sync::atomic::fence(std::sync::atomic::Ordering::Release);

    target.segment.semaphores.video.wait();

    while page.resized == 1 && page.dms != 0 {
        std::hint::spin_loop();
    }

    if page.dms == 0 {
        return Err(Error::PeerDead);
    }

    let advertised = page.segment_size;
    if advertised != target.segment.len {
        match target.guard {
            Some(guard) => {
                // Hold the watcher's lock across the whole unmap/mmap/rebind
                // sequence so it can never observe a stale or already-freed
                // `dms` pointer mid-remap.
                guard.relocate_with(|| {
                    target.segment.remap(advertised)?;
                    let page = unsafe { &mut *target.segment.page };
                    Ok::<_, Error>((
                        &mut page.dms as *mut u8,
                        [
                            &target.segment.semaphores.audio as *const _,
                            &target.segment.semaphores.video as *const _,
                            &target.segment.semaphores.event as *const _,
                        ],
                    ))
                })?;
            }
            None => {
                target.segment.remap(advertised)?;
            }
        }
    }

    let page = unsafe { &mut *target.segment.page };
    *target.inbound = unsafe {
        EventRing::new(
            &mut page.childevq as *mut _,
            &target.segment.semaphores.event as *const _,
            Some(&page.dms as *const u8),
        )
    };
    *target.outbound = unsafe {
        EventRing::new(
            &mut page.parentevq as *mut _,
            &target.segment.semaphores.event as *const _,
            None,
        )
    };

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_geometry_over_the_maximum() {
        let err = validate_geometry(MAX_W + 1, 10).unwrap_err();
        assert!(matches!(err, Error::ResizeRejected { .. }));
    }

    #[test]
    fn accepts_geometry_within_bounds() {
        assert!(validate_geometry(MAX_W, MAX_H).is_ok());
    }
}
