//! Multi-word compare-and-swap. A transaction acquires its cells through
//! RDCSS so installation stays conditional on the status word, decides the
//! outcome with a single status CAS, then releases every cell. Any thread
//! that finds a foreign descriptor drives it through the same two phases.

use crate::atomic::{Atomic, AtomicSlot, Slot, Word, CASN_TAG};
use crate::rdcss;
use arrayvec::ArrayVec;
use crossbeam_epoch::{pin, Guard, Shared};
use crossbeam_utils::Backoff;

pub(crate) const UNDECIDED: usize = 0;
pub(crate) const SUCCEEDED: usize = 1;
pub(crate) const FAILED: usize = 2;

/// Upper bound on cells per transaction.
pub const MAX_CELLS: usize = 8;

/// One `(target, expected, new)` triple of a transaction.
pub struct Cell<'a> {
    target: &'a AtomicSlot,
    expected: Slot,
    new: Slot,
}

impl<'a> Cell<'a> {
    pub fn new<T: Word>(target: &'a Atomic<T>, expected: T, new: T) -> Self {
        Self {
            target: target.as_slot(),
            expected: expected.into(),
            new: new.into(),
        }
    }
}

struct CellSnapshot {
    target: *const AtomicSlot,
    expected: Slot,
    new: Slot,
}

pub(crate) struct CasnDescriptor {
    status: AtomicSlot,
    cells: ArrayVec<[CellSnapshot; MAX_CELLS]>,
}

unsafe impl Send for CasnDescriptor {}
unsafe impl Sync for CasnDescriptor {}

/// Atomically move every cell from its expected value to its new value, or
/// leave all of them untouched. Cells are processed in one global order
/// (sorted by target address); naming the same target twice is undefined.
pub fn casn(cells: &mut [Cell<'_>]) -> bool {
    assert!(!cells.is_empty() && cells.len() <= MAX_CELLS);
    cells.sort_by_key(|c| c.target as *const AtomicSlot as usize);
    debug_assert!(cells
        .windows(2)
        .all(|w| !std::ptr::eq(w[0].target, w[1].target)));

    let guard = pin();
    let mut snapshot = ArrayVec::new();
    for cell in cells.iter() {
        snapshot.push(CellSnapshot {
            target: cell.target,
            expected: cell.expected,
            new: cell.new,
        });
    }
    let descriptor = Box::into_raw(Box::new(CasnDescriptor {
        status: AtomicSlot::new(status_word(UNDECIDED)),
        cells: snapshot,
    }));
    let d_slot = Slot::descriptor(descriptor as *const CasnDescriptor, CASN_TAG);
    let succeeded = unsafe { help(&*descriptor, d_slot, &guard) };
    // terminal and removed from every cell, safe to retire
    unsafe { guard.defer_destroy(Shared::from(descriptor as *const CasnDescriptor)) };
    succeeded
}

/// Two-cell convenience form over heterogeneous targets.
pub fn cas2<T0, T1>(
    addr0: &Atomic<T0>,
    addr1: &Atomic<T1>,
    expected0: T0,
    expected1: T1,
    new0: T0,
    new1: T1,
) -> bool
where
    T0: Word,
    T1: Word,
{
    let mut cells = [
        Cell::new(addr0, expected0, new0),
        Cell::new(addr1, expected1, new1),
    ];
    casn(&mut cells)
}

/// Drive a foreign descriptor terminal.
///
/// Safety: `observed` must have been loaded from a slot under `guard`,
/// which keeps the descriptor allocation alive.
pub(crate) unsafe fn help_foreign(observed: Slot, guard: &Guard) -> bool {
    debug_assert_eq!(observed.tag(), CASN_TAG);
    help(&*observed.descriptor_ptr::<CasnDescriptor>(), observed, guard)
}

unsafe fn help(d: &CasnDescriptor, d_slot: Slot, guard: &Guard) -> bool {
    // Phase 1: acquire every cell while the outcome is still open.
    if d.status.load() == status_word(UNDECIDED) {
        let mut decision = SUCCEEDED;
        'cells: for cell in &d.cells {
            let backoff = Backoff::new();
            loop {
                let observed = rdcss::rdcss(
                    &d.status,
                    status_word(UNDECIDED),
                    &*cell.target,
                    cell.expected,
                    d_slot,
                    guard,
                );
                if observed == d_slot {
                    // a helper acquired this cell for us
                    break;
                }
                if observed.tag() == CASN_TAG {
                    if backoff.is_completed() {
                        help_foreign(observed, guard);
                    } else {
                        backoff.spin();
                    }
                    continue;
                }
                if observed == cell.expected {
                    break;
                }
                decision = FAILED;
                break 'cells;
            }
        }
        // first writer wins, the status never leaves UNDECIDED twice
        let _ = d
            .status
            .compare_exchange(status_word(UNDECIDED), status_word(decision));
    }

    // Phase 2: the status is terminal, release every cell accordingly.
    let succeeded = d.status.load() == status_word(SUCCEEDED);
    for cell in &d.cells {
        let outcome = if succeeded { cell.new } else { cell.expected };
        let _ = (*cell.target).compare_exchange(d_slot, outcome);
    }
    succeeded
}

fn status_word(status: usize) -> Slot {
    Slot::from(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn casn_swaps_all_or_nothing() {
        let r1 = Atomic::new(1usize);
        let r2 = Atomic::new(2usize);
        let r3 = Atomic::new(3usize);

        let mut cells = [
            Cell::new(&r1, 1, 11),
            Cell::new(&r2, 2, 22),
            Cell::new(&r3, 3, 33),
        ];
        assert!(casn(&mut cells));
        assert_eq!((r1.get(), r2.get(), r3.get()), (11, 22, 33));

        // same expectations again must fail and change nothing
        let mut stale = [
            Cell::new(&r1, 1, 111),
            Cell::new(&r2, 2, 222),
            Cell::new(&r3, 3, 333),
        ];
        assert!(!casn(&mut stale));
        assert_eq!((r1.get(), r2.get(), r3.get()), (11, 22, 33));
    }

    #[test]
    fn one_stale_cell_fails_the_transaction() {
        let r1 = Atomic::new(1usize);
        let r2 = Atomic::new(2usize);
        let mut cells = [Cell::new(&r1, 1, 10), Cell::new(&r2, 99, 20)];
        assert!(!casn(&mut cells));
        assert_eq!((r1.get(), r2.get()), (1, 2));
    }

    #[test]
    fn single_cell_casn_behaves_like_cas() {
        let r = Atomic::new(7usize);
        assert!(casn(&mut [Cell::new(&r, 7, 8)]));
        assert!(!casn(&mut [Cell::new(&r, 7, 9)]));
        assert_eq!(r.get(), 8);
    }

    #[test]
    fn concurrent_cas2_counters_stay_in_step() {
        let counters = Arc::new((Atomic::new(0usize), Atomic::new(0usize)));
        let max = 10_000;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counters = Arc::clone(&counters);
            handles.push(std::thread::spawn(move || loop {
                let first = counters.0.get();
                let second = counters.1.get();
                if first >= max {
                    break;
                }
                cas2(&counters.0, &counters.1, first, second, first + 1, second + 1);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counters.0.get(), max);
        assert_eq!(counters.1.get(), max);
    }

    #[test]
    fn overlapping_transactions_preserve_atomicity() {
        let cells = Arc::new(vec![
            Atomic::new(0usize),
            Atomic::new(0usize),
            Atomic::new(0usize),
        ]);
        let rounds = 2_000;
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cells = Arc::clone(&cells);
            handles.push(std::thread::spawn(move || {
                let mut applied = 0usize;
                while applied < rounds {
                    let snap: Vec<usize> = cells.iter().map(|c| c.get()).collect();
                    let mut tx = [
                        Cell::new(&cells[0], snap[0], snap[0] + 1),
                        Cell::new(&cells[1], snap[1], snap[1] + 1),
                        Cell::new(&cells[2], snap[2], snap[2] + 1),
                    ];
                    if casn(&mut tx) {
                        applied += 1;
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let total = 4 * rounds;
        assert_eq!(cells[0].get(), total);
        assert_eq!(cells[1].get(), total);
        assert_eq!(cells[2].get(), total);
    }
}
