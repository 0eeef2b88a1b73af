//! Restricted double-compare single-swap: install a word at `target`
//! conditional on `status_ref` still holding `expected_status`. Used by the
//! CASN protocol to acquire cells only while the transaction is undecided.

use crate::atomic::{AtomicSlot, Slot, RDCSS_TAG};
use crossbeam_epoch::{Guard, Shared};

/// Immutable after construction. The descriptor is published by tagging its
/// address into `target`; any thread that trips over it may complete it.
pub(crate) struct RdcssDescriptor {
    status_ref: *const AtomicSlot,
    expected_status: Slot,
    target: *const AtomicSlot,
    expected: Slot,
    replacement: Slot,
}

unsafe impl Send for RdcssDescriptor {}
unsafe impl Sync for RdcssDescriptor {}

/// Attempt the double-compare single-swap and return the prior content of
/// `target`. A return equal to `expected` means the descriptor was installed
/// and completed; anything else means the swap never took place.
pub(crate) fn rdcss(
    status_ref: &AtomicSlot,
    expected_status: Slot,
    target: &AtomicSlot,
    expected: Slot,
    replacement: Slot,
    guard: &Guard,
) -> Slot {
    debug_assert_eq!(expected.tag(), 0);
    let descriptor = Box::into_raw(Box::new(RdcssDescriptor {
        status_ref,
        expected_status,
        target,
        expected,
        replacement,
    }));
    let d_slot = Slot::descriptor(descriptor as *const RdcssDescriptor, RDCSS_TAG);
    loop {
        match target.compare_exchange(expected, d_slot) {
            Ok(_) => {
                complete(unsafe { &*descriptor }, d_slot);
                unsafe {
                    guard.defer_destroy(Shared::from(descriptor as *const RdcssDescriptor))
                };
                return expected;
            }
            Err(observed) => {
                if observed.tag() == RDCSS_TAG {
                    unsafe { help_foreign(observed, guard) };
                    continue;
                }
                // never published, reclaim in place
                drop(unsafe { Box::from_raw(descriptor) });
                return observed;
            }
        }
    }
}

/// Complete a descriptor observed in some slot.
///
/// Safety: the caller must have loaded `observed` from a slot while pinned,
/// which keeps the descriptor allocation alive.
pub(crate) unsafe fn help_foreign(observed: Slot, _guard: &Guard) {
    debug_assert_eq!(observed.tag(), RDCSS_TAG);
    complete(&*observed.descriptor_ptr::<RdcssDescriptor>(), observed);
}

/// Read a slot, completing any RDCSS descriptor in it. The returned word is
/// never RDCSS-tagged; CASN descriptors are left for the caller.
pub(crate) fn read(slot: &AtomicSlot, guard: &Guard) -> Slot {
    loop {
        let curr = slot.load();
        if curr.tag() == RDCSS_TAG {
            unsafe { help_foreign(curr, guard) };
            continue;
        }
        return curr;
    }
}

/// The decision is keyed entirely on the status word, which transitions out
/// of its expected value at most once, so every helper swings `target` the
/// same way. Both CASes are conditional on the descriptor still being
/// installed, making completion idempotent.
fn complete(d: &RdcssDescriptor, d_slot: Slot) {
    let status = unsafe { (*d.status_ref).load() };
    let outcome = if status == d.expected_status {
        d.replacement
    } else {
        d.expected
    };
    let _ = unsafe { (*d.target).compare_exchange(d_slot, outcome) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::{AtomicSlot, Slot};
    use crossbeam_epoch::pin;

    fn word(v: usize) -> Slot {
        Slot::from(v)
    }

    #[test]
    fn swaps_when_status_matches() {
        let guard = pin();
        let status = AtomicSlot::new(word(0));
        let target = AtomicSlot::new(word(10));
        let observed = rdcss(&status, word(0), &target, word(10), word(20), &guard);
        assert_eq!(observed, word(10));
        assert_eq!(target.load(), word(20));
    }

    #[test]
    fn rolls_back_when_status_differs() {
        let guard = pin();
        let status = AtomicSlot::new(word(1));
        let target = AtomicSlot::new(word(10));
        let observed = rdcss(&status, word(0), &target, word(10), word(20), &guard);
        assert_eq!(observed, word(10));
        assert_eq!(target.load(), word(10));
    }

    #[test]
    fn reports_mismatched_target() {
        let guard = pin();
        let status = AtomicSlot::new(word(0));
        let target = AtomicSlot::new(word(11));
        let observed = rdcss(&status, word(0), &target, word(10), word(20), &guard);
        assert_eq!(observed, word(11));
        assert_eq!(target.load(), word(11));
    }

    #[test]
    fn read_passes_plain_words_through() {
        let guard = pin();
        let slot = AtomicSlot::new(word(33));
        assert_eq!(read(&slot, &guard), word(33));
    }
}
