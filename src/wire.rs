//! The shared-memory page layout and event wire format.
//!
//! Everything in this module is part of the cross-process ABI: field order,
//! sizes, and the `cookie()` fingerprint all have to match byte-for-byte on
//! both sides of the segment. Don't reorder fields without bumping
//! `ABI_MAJOR`.

use std::mem::size_of;
use strum_macros::{Display, EnumString};

/// Maximum width/height a segment may request during resize negotiation.
pub const MAX_W: u32 = 8192;
pub const MAX_H: u32 = 8192;

/// Initial mapping size before the server has a chance to advertise a
/// larger `segment_size`.
pub const START_SZ: usize = 512 * 1024;

/// Number of channels in the video buffer (RGBA).
pub const VCHANNELS: usize = 4;

/// Fixed slot count for each event ring. Deliberately small: the ring
/// exists to smooth out scheduling jitter, not to buffer unbounded work.
pub const QUEUE_SZ: usize = 64;

/// Maximum bytes (including the trailing newline) for a rendezvous key.
pub const SHMKEY_LIM: usize = 32;

/// Length of the inline message field on a `Event`.
pub const MESSAGE_LEN: usize = 256;

pub const ABI_MAJOR: u16 = 0;
pub const ABI_MINOR: u16 = 16;

/// Sentinel for "no descriptor here", matching the C source's `BADFD`.
pub const BADFD: i32 = -1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, EnumString)]
#[repr(u8)]
pub enum EventCategory {
    System = 0,
    Io = 1,
    Video = 2,
    Audio = 3,
    Target = 4,
    Fsrv = 5,
    External = 6,
    Net = 7,
}

impl EventCategory {
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        use EventCategory::*;
        Some(match v {
            0 => System,
            1 => Io,
            2 => Video,
            3 => Audio,
            4 => Target,
            5 => Fsrv,
            6 => External,
            7 => Net,
            _ => return None,
        })
    }
}

/// `TARGET` event sub-commands. Only a subset carries a descriptor (see
/// [`TargetCommand::is_descriptor_bearing`]); FONTHINT is conditional on
/// `ioevs[1]`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, EnumString)]
#[repr(u8)]
pub enum TargetCommand {
    Undefined = 0,
    Exit = 1,
    Pause = 2,
    Unpause = 3,
    Displayhint = 4,
    Fonthint = 5,
    NewSegment = 6,
    Store = 7,
    Restore = 8,
    BchunkIn = 9,
    BchunkOut = 10,
    Other = 255,
}

impl TargetCommand {
    pub fn is_descriptor_bearing(self, ioevs: &[IoVal; 6]) -> bool {
        use TargetCommand::*;
        match self {
            Store | Restore | BchunkIn | BchunkOut | NewSegment => true,
            Fonthint => ioevs[1].as_int() == 1,
            _ => false,
        }
    }
}

/// One slot of a `TARGET` event's small fixed I/O array: either an integer
/// or a float, picked per-field by convention (mirrors the original's
/// `ioevs[n].iv` / `.fv` union access).
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub enum IoVal {
    Int(i32),
    Float(f32),
}

impl Default for IoVal {
    fn default() -> Self {
        IoVal::Int(0)
    }
}

impl IoVal {
    pub fn as_int(self) -> i32 {
        match self {
            IoVal::Int(v) => v,
            IoVal::Float(v) => v as i32,
        }
    }

    pub fn as_float(self) -> f32 {
        match self {
            IoVal::Int(v) => v as f32,
            IoVal::Float(v) => v,
        }
    }
}

/// A `TARGET` event payload: command kind, six generic I/O slots, and an
/// inline message (used by NEWSEGMENT to carry the new segment's key).
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct TargetEvent {
    pub kind: TargetCommand,
    pub ioevs: [IoVal; 6],
    #[serde(skip)]
    pub message: [u8; MESSAGE_LEN],
}

impl Default for TargetEvent {
    fn default() -> Self {
        TargetEvent {
            kind: TargetCommand::Undefined,
            ioevs: [IoVal::default(); 6],
            message: [0; MESSAGE_LEN],
        }
    }
}

impl TargetEvent {
    pub fn message_str(&self) -> String {
        let end = self.message.iter().position(|&b| b == 0).unwrap_or(self.message.len());
        String::from_utf8_lossy(&self.message[..end]).into_owned()
    }

    pub fn set_message(&mut self, s: &str) {
        self.message = [0; MESSAGE_LEN];
        let bytes = s.as_bytes();
        let n = bytes.len().min(MESSAGE_LEN - 1);
        self.message[..n].copy_from_slice(&bytes[..n]);
    }
}

/// Tagged event union. Only the `Target` variant is modeled in full detail
/// (it's the only category the client-side state machine inspects); other
/// categories are passed through opaquely.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub enum EventPayload {
    Target(TargetEvent),
    Opaque,
}

impl Default for EventPayload {
    fn default() -> Self {
        EventPayload::Opaque
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize)]
pub struct Event {
    pub category: u8,
    pub payload: EventPayload,
}

impl Event {
    pub fn target(kind: TargetCommand) -> Self {
        Event {
            category: EventCategory::Target as u8,
            payload: EventPayload::Target(TargetEvent {
                kind,
                ..Default::default()
            }),
        }
    }

    pub fn as_target(&self) -> Option<&TargetEvent> {
        match &self.payload {
            EventPayload::Target(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_target_mut(&mut self) -> Option<&mut TargetEvent> {
        match &mut self.payload {
            EventPayload::Target(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_category_unset(&self) -> bool {
        self.category == 0
    }
}

/// `arcan_shmif_eventstr`: a human-readable `"CATEGORY:KIND"` tag for log
/// lines and `Debug` output, built from the `EventCategory`/`TargetCommand`
/// name tables (`cat_xlt`/`tgt_cmd_xlt` in the original).
///
/// The original indexes `tgt_cmd_xlt` with `aev->ext.kind` instead of
/// `aev->tgt.kind` — a read of the wrong union member that happens to often
/// alias the right one. `Event`'s payload is a tagged Rust enum rather than
/// a C union, so there's no second `ext.kind` field living at the same
/// offset to misread; the bug has no equivalent here to reproduce.
pub fn describe(ev: &Event) -> String {
    let category = EventCategory::from_u8(ev.category).map(|c| c.to_string()).unwrap_or_else(|| "UNKNOWN".to_owned());
    let kind = ev.as_target().map(|t| t.kind.to_string()).unwrap_or_else(|| "UNKNOWN".to_owned());
    format!("{}:{}", category, kind)
}

/// One single-producer/single-consumer ring embedded in the shared page.
/// `front`/`back` are shared atomics; see `ring.rs` for the producer/
/// consumer discipline.
#[derive(Debug)]
#[repr(C)]
pub struct EventQueueFields {
    pub front: u32,
    pub back: u32,
    pub eventbuf: [Event; QUEUE_SZ],
}

impl Default for EventQueueFields {
    fn default() -> Self {
        EventQueueFields {
            front: 0,
            back: 0,
            eventbuf: [Event::default(); QUEUE_SZ],
        }
    }
}

/// The shared-memory page. One instance lives at the base of every mapped
/// segment; both peers mutate disjoint subsets of its fields (see the
/// single-writer policy in `SPEC_FULL.md` §5).
#[repr(C)]
pub struct SegmentPage {
    pub cookie: u64,
    pub major: u16,
    pub minor: u16,

    /// Dead-man's switch. Nonzero means "alive". Either side clears it to
    /// declare the link permanently dead.
    pub dms: u8,

    pub w: u32,
    pub h: u32,
    pub segment_size: usize,

    pub resized: u8,
    pub vready: u8,
    pub aready: u8,

    pub vpending: i32,
    pub apending: i32,

    pub abufused: usize,
    pub abufsize: usize,

    pub parent: i32,

    pub childevq: EventQueueFields,
    pub parentevq: EventQueueFields,
}

impl SegmentPage {
    pub fn new(parent_pid: i32) -> Self {
        let mut page = SegmentPage {
            cookie: 0,
            major: ABI_MAJOR,
            minor: ABI_MINOR,
            dms: 1,
            w: 0,
            h: 0,
            segment_size: START_SZ,
            resized: 0,
            vready: 0,
            aready: 0,
            vpending: 0,
            apending: 0,
            abufused: 0,
            abufsize: 0,
            parent: parent_pid,
            childevq: EventQueueFields::default(),
            parentevq: EventQueueFields::default(),
        };
        page.cookie = cookie();
        page
    }
}

/// ABI fingerprint: a fixed combination of structure sizes and field
/// offsets, each shifted into its own byte. Two builds with the same
/// struct layout produce the same cookie; a layout change (field reorder,
/// added field, ABI-incompatible struct size) overwhelmingly produces a
/// different one.
pub fn cookie() -> u64 {
    let mut base = (size_of::<Event>() + size_of::<SegmentPage>()) as u64;
    base += (offset_of_cookie() as u64) << 8;
    base += (offset_of_resized() as u64) << 16;
    base += (offset_of_aready() as u64) << 24;
    base += (offset_of_abufused() as u64) << 32;
    base += (offset_of_childevq_front() as u64) << 40;
    base += (offset_of_childevq_back() as u64) << 48;
    base += (offset_of_parentevq_front() as u64) << 56;
    base
}

// `offset_of!` isn't in std on this edition; these helpers compute field
// offsets the same way the macro would, via a dangling reference. Safe
// because we never dereference the pointers, only compare addresses.
macro_rules! field_offset {
    ($ty:ty, $field:ident) => {{
        let base = std::ptr::NonNull::<$ty>::dangling().as_ptr();
        let field = unsafe { std::ptr::addr_of!((*base).$field) };
        (field as usize) - (base as usize)
    }};
}

fn offset_of_cookie() -> usize {
    field_offset!(SegmentPage, cookie)
}
fn offset_of_resized() -> usize {
    field_offset!(SegmentPage, resized)
}
fn offset_of_aready() -> usize {
    field_offset!(SegmentPage, aready)
}
fn offset_of_abufused() -> usize {
    field_offset!(SegmentPage, abufused)
}
fn offset_of_childevq_front() -> usize {
    field_offset!(SegmentPage, childevq)
}
fn offset_of_childevq_back() -> usize {
    field_offset!(SegmentPage, childevq) + field_offset!(EventQueueFields, back)
}
fn offset_of_parentevq_front() -> usize {
    field_offset!(SegmentPage, parentevq)
}
