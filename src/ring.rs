//! The single-producer/single-consumer event ring embedded in the shared
//! page, plus the dead-man gate each side checks on every blocking wait.
//!
//! `front == back` means empty; `(back + 1) % N == front` means full. The
//! producer writes the slot, fences, then advances `back`; the consumer
//! reads the slot, zeroes it, then advances `front`. A `Mutex` brackets
//! every index mutation rather than gating it behind a compile-time
//! feature (the original's `ARCAN_SHMIF_THREADSAFE_QUEUE`) — see
//! DESIGN.md for why the toggle was collapsed.

use std::sync::atomic::{fence, Ordering};
use std::sync::Mutex;

use crate::segment::Semaphore;
use crate::wire::{Event, EventCategory, EventQueueFields, QUEUE_SZ};

/// A view onto one ring living inside the shared page, plus the
/// semaphore that signals not-empty/not-full and a pointer to the
/// dead-man byte this ring should respect while waiting.
pub struct EventRing {
    fields: *mut EventQueueFields,
    lock: Mutex<()>,
    /// Semaphore posted on enqueue, waited on by a blocking enqueue when
    /// the ring is full. `None` only in tests that never block.
    pub(crate) semaphore: Option<*const Semaphore>,
    /// Points at the page's `dms` byte; `None` for the outbound ring
    /// (only the inbound ring watches the killswitch, per the original).
    killswitch: Option<*const u8>,
}

unsafe impl Send for EventRing {}
unsafe impl Sync for EventRing {}

impl EventRing {
    /// # Safety
    /// `fields` and `semaphore` must stay valid (i.e. the mapping must
    /// not be unmapped or remapped) for the lifetime of this ring view.
    /// Callers re-bind a fresh `EventRing` after every resize remap.
    pub unsafe fn new(
        fields: *mut EventQueueFields,
        semaphore: *const Semaphore,
        killswitch: Option<*const u8>,
    ) -> Self {
        EventRing {
            fields,
            lock: Mutex::new(()),
            semaphore: Some(semaphore),
            killswitch,
        }
    }

    /// Like [`EventRing::new`], but for a ring view with no semaphore bound
    /// at all (e.g. a transient/in-process ring exercised only through the
    /// non-blocking path). `wait_for_semaphore` becomes a no-op.
    ///
    /// # Safety
    /// `fields` must stay valid for the lifetime of this ring view.
    pub unsafe fn new_without_semaphore(
        fields: *mut EventQueueFields,
        killswitch: Option<*const u8>,
    ) -> Self {
        EventRing {
            fields,
            lock: Mutex::new(()),
            semaphore: None,
            killswitch,
        }
    }

    fn fields(&self) -> &mut EventQueueFields {
        unsafe { &mut *self.fields }
    }

    fn dms_alive(&self) -> bool {
        match self.killswitch {
            Some(p) => unsafe { *p != 0 },
            None => true,
        }
    }

    fn semaphore(&self) -> &Semaphore {
        unsafe { &*self.semaphore.expect("ring has no semaphore bound") }
    }

    pub fn is_empty(&self) -> bool {
        let f = self.fields();
        f.front == f.back
    }

    fn is_full(f: &EventQueueFields) -> bool {
        (f.back + 1) % QUEUE_SZ as u32 == f.front
    }

    /// Blocking enqueue: waits on the event semaphore while full. Stamps
    /// an unset category as `External` before publishing.
    pub fn enqueue_blocking(&self, ev: &Event) {
        loop {
            {
                let _guard = self.lock.lock().unwrap();
                let f = self.fields();
                if !Self::is_full(f) {
                    self.publish(f, ev);
                    return;
                }
            }
            self.semaphore().wait();
        }
    }

    /// Non-blocking enqueue: fails immediately (returns `false`) if full,
    /// without touching the ring.
    pub fn enqueue_nonblocking(&self, ev: &Event) -> bool {
        let _guard = self.lock.lock().unwrap();
        let f = self.fields();
        if Self::is_full(f) {
            return false;
        }
        self.publish(f, ev);
        true
    }

    fn publish(&self, f: &mut EventQueueFields, ev: &Event) {
        let mut stamped = *ev;
        if stamped.is_category_unset() {
            stamped.category = EventCategory::External as u8;
        }
        f.eventbuf[f.back as usize] = stamped;
        fence(Ordering::Release);
        f.back = (f.back + 1) % QUEUE_SZ as u32;
    }

    /// Pop one slot if present. Returns `None` if the ring is empty.
    /// Callers check the dead-man switch themselves around this (the
    /// state machine needs finer control over when `-1` vs `0` vs retry
    /// is the right response).
    pub fn try_pop(&self) -> Option<Event> {
        let _guard = self.lock.lock().unwrap();
        let f = self.fields();
        if f.front == f.back {
            return None;
        }
        fence(Ordering::Acquire);
        let ev = f.eventbuf[f.front as usize];
        f.eventbuf[f.front as usize] = Event::default();
        f.front = (f.front + 1) % QUEUE_SZ as u32;
        Some(ev)
    }

    /// Scan from `front` to `back` (not including slots already popped)
    /// for another event of the same target kind, used by the
    /// DISPLAYHINT compaction step. Returns the slot index if found.
    pub fn scan_for_target_kind(&self, kind: crate::wire::TargetCommand) -> Option<usize> {
        let f = self.fields();
        let mut cur = f.front;
        while cur != f.back {
            let ev = &f.eventbuf[cur as usize];
            if ev.category == EventCategory::Target as u8 {
                if let Some(t) = ev.as_target() {
                    if t.kind as u8 == kind as u8 {
                        return Some(cur as usize);
                    }
                }
            }
            cur = (cur + 1) % QUEUE_SZ as u32;
        }
        None
    }

    pub fn slot_mut(&self, idx: usize) -> &mut Event {
        &mut self.fields().eventbuf[idx]
    }

    pub fn peer_alive(&self) -> bool {
        self.dms_alive()
    }

    /// Blocks on this ring's semaphore if one is bound, otherwise returns
    /// immediately. Used by a blocking dequeue to avoid busy-spinning while
    /// waiting for the peer to publish the next event.
    pub fn wait_for_semaphore(&self) {
        if let Some(sem) = self.semaphore {
            unsafe { &*sem }.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::TargetCommand;

    /// Builds a bare ring view with no semaphore bound — sufficient for
    /// every test here, since none of them exercise the blocking path.
    fn test_ring(fields: &mut EventQueueFields) -> EventRing {
        EventRing {
            fields: fields as *mut _,
            lock: Mutex::new(()),
            semaphore: None,
            killswitch: None,
        }
    }

    #[test]
    fn enqueue_then_dequeue_preserves_fifo_order() {
        let mut fields = EventQueueFields::default();
        let ring = test_ring(&mut fields);

        let a = Event::target(TargetCommand::Pause);
        let b = Event::target(TargetCommand::Unpause);
        assert!(ring.enqueue_nonblocking(&a));
        assert!(ring.enqueue_nonblocking(&b));

        let got_a = ring.try_pop().unwrap();
        let got_b = ring.try_pop().unwrap();
        assert_eq!(got_a.as_target().unwrap().kind as u8, TargetCommand::Pause as u8);
        assert_eq!(got_b.as_target().unwrap().kind as u8, TargetCommand::Unpause as u8);
        assert!(ring.try_pop().is_none());
    }

    #[test]
    fn nonblocking_enqueue_fails_when_full_without_mutation() {
        let mut fields = EventQueueFields::default();
        let ring = test_ring(&mut fields);

        let ev = Event::target(TargetCommand::Unpause);
        let mut filled = 0;
        while ring.enqueue_nonblocking(&ev) {
            filled += 1;
        }
        assert_eq!(filled, QUEUE_SZ - 1);
        assert!(!ring.enqueue_nonblocking(&ev));
    }

    #[test]
    fn category_zero_is_stamped_external() {
        let mut fields = EventQueueFields::default();
        let ring = test_ring(&mut fields);

        let mut ev = Event::target(TargetCommand::Pause);
        ev.category = 0;
        ring.enqueue_nonblocking(&ev);
        let popped = ring.try_pop().unwrap();
        assert_eq!(popped.category, EventCategory::External as u8);
    }

    #[test]
    fn dead_man_switch_reports_alive_via_pointer() {
        let dms: u8 = 1;
        let mut fields = EventQueueFields::default();
        let mut ring = test_ring(&mut fields);
        ring.killswitch = Some(&dms as *const u8);
        assert!(ring.peer_alive());
    }
}
