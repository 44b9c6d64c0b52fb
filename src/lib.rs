//! Client-side shared-memory IPC runtime: segment mapping, the event ring
//! pair, the out-of-band descriptor channel, the dequeue/enqueue state
//! machine, the guard watcher, resize negotiation, and signal/commit.
//!
//! Mirrors `arcan_shmif_control.c`'s public surface, restructured as
//! explicit Rust modules instead of one translation unit.

#[macro_use]
extern crate failure_derive;

pub mod argstr;
pub mod cont;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod guard;
pub mod registry;
pub mod rendezvous;
pub mod resize;
pub mod ring;
pub mod segment;
pub mod signal;
pub mod wire;

pub use cont::{AcquireFlags, ConnectConfig, SegmentKind, ShmifCont};
pub use error::{Error, Result};
pub use event::{Dequeued, EventFlags};
pub use registry::PrimaryKind;
pub use wire::{Event, EventCategory, TargetCommand, TargetEvent};
