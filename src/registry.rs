//! Process-wide primary-segment registry: two nullable slots (input,
//! output) a caller may set and query to locate "the" input/output
//! segment without threading a reference through its own code. The
//! runtime itself never consults these. Mirrors `arcan_shmif_primary`/
//! `arcan_shmif_setprimary`.

use std::sync::Mutex;

use crate::cont::ShmifCont;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrimaryKind {
    Input,
    Output,
}

struct Registry {
    input: Option<*mut ShmifCont>,
    output: Option<*mut ShmifCont>,
}

// SAFETY: the registry only stores and hands back the pointer value; it
// never dereferences it, so there's no actual cross-thread access to the
// pointee to race on.
unsafe impl Send for Registry {}

static PRIMARY: Mutex<Registry> = Mutex::new(Registry { input: None, output: None });

/// Register `cont` as the process's primary segment of `kind`.
///
/// # Safety
/// `cont` must remain valid (not dropped or moved) for as long as it may
/// still be observed through [`primary`]; callers must call [`clear`]
/// before letting the registered endpoint drop.
pub unsafe fn set_primary(kind: PrimaryKind, cont: *mut ShmifCont) {
    let mut reg = PRIMARY.lock().unwrap();
    match kind {
        PrimaryKind::Input => reg.input = Some(cont),
        PrimaryKind::Output => reg.output = Some(cont),
    }
}

/// Clear the `kind` slot, e.g. right before the registered endpoint drops.
pub fn clear(kind: PrimaryKind) {
    let mut reg = PRIMARY.lock().unwrap();
    match kind {
        PrimaryKind::Input => reg.input = None,
        PrimaryKind::Output => reg.output = None,
    }
}

/// Fetch the `kind` slot.
///
/// # Safety
/// The returned pointer is only valid to dereference if the registrant
/// hasn't dropped or cleared it since registration.
pub unsafe fn primary(kind: PrimaryKind) -> Option<*mut ShmifCont> {
    let reg = PRIMARY.lock().unwrap();
    match kind {
        PrimaryKind::Input => reg.input,
        PrimaryKind::Output => reg.output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips_the_pointer() {
        // Never dereferenced: the registry only compares/stores the raw
        // address, so a dangling-but-unused pointer is safe to exercise.
        let marker: u8 = 0;
        let fake = &marker as *const u8 as *mut ShmifCont;

        unsafe {
            set_primary(PrimaryKind::Input, fake);
            assert_eq!(primary(PrimaryKind::Input), Some(fake));
            assert_eq!(primary(PrimaryKind::Output), None);

            clear(PrimaryKind::Input);
            assert_eq!(primary(PrimaryKind::Input), None);
        }
    }

    #[test]
    fn input_and_output_slots_are_independent() {
        let marker_a: u8 = 0;
        let marker_b: u8 = 0;
        let a = &marker_a as *const u8 as *mut ShmifCont;
        let b = &marker_b as *const u8 as *mut ShmifCont;

        unsafe {
            set_primary(PrimaryKind::Input, a);
            set_primary(PrimaryKind::Output, b);
            assert_eq!(primary(PrimaryKind::Input), Some(a));
            assert_eq!(primary(PrimaryKind::Output), Some(b));
            clear(PrimaryKind::Input);
            clear(PrimaryKind::Output);
        }
    }
}
