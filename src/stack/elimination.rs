use super::treiber::Node;
use super::Stack;
use crate::thread_id::ThreadIdPool;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use rand::{thread_rng, Rng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Bound on the passive wait for a collision partner. Empirical, keep
/// tunable.
const ELIMINATION_SPIN: usize = 10_000;

// Collision cell word. A push cell starts at its payload pointer, a pop cell
// at PUBLISHED; both move exactly once, so a claim CAS can never land on a
// recycled payload address.
const PUBLISHED: usize = 0;
const RETRACTED: usize = 1;
const CLAIMED: usize = 2;

fn is_payload(word: usize) -> bool {
    word > CLAIMED
}

/// Boxed pushed value in flight; alignment keeps the state values distinct
/// from pointers.
#[repr(align(4))]
struct Payload<T>(T);

enum OpKind {
    Push,
    Pop,
}

struct CollisionCell {
    kind: OpKind,
    word: AtomicUsize,
}

/// Treiber stack backed by an elimination array. A thread that loses the top
/// CAS publishes its operation at its own slot and tries to pair up with an
/// opposing operation instead of contending again; a matched push/pop pair
/// completes without ever touching `top`.
pub struct EliminationBackoffStack<T> {
    top: CachePadded<Atomic<Node<T>>>,
    slots: Box<[Atomic<CollisionCell>]>,
    ids: Arc<ThreadIdPool>,
}

impl<T: Clone + Send + Sync + 'static> EliminationBackoffStack<T> {
    pub fn new() -> Self {
        Self::with_thread_id_pool(Arc::new(ThreadIdPool::new()), num_cpus::get().max(1))
    }

    /// Explicit thread-id pool and array capacity, mostly for tests. Ids are
    /// mapped into the slot range; a collision on a shared slot only skips
    /// one elimination round.
    pub fn with_thread_id_pool(ids: Arc<ThreadIdPool>, capacity: usize) -> Self {
        assert!(capacity >= 1);
        let slots = (0..capacity)
            .map(|_| Atomic::null())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            top: CachePadded::new(Atomic::null()),
            slots,
            ids,
        }
    }

    pub fn push(&self, value: T) {
        let guard = epoch::pin();
        let mut value = value;
        loop {
            value = match self.try_push(value, &guard) {
                Ok(()) => return,
                Err(v) => v,
            };
            value = match self.eliminate_push(value, &guard) {
                Ok(()) => return,
                Err(v) => v,
            };
        }
    }

    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            if let Ok(popped) = self.try_pop(&guard) {
                return popped;
            }
            if let Some(value) = self.eliminate_pop(&guard) {
                return Some(value);
            }
        }
    }

    pub fn peek(&self) -> Option<T> {
        let guard = epoch::pin();
        let top = self.top.load(Ordering::Acquire, &guard);
        unsafe { top.as_ref() }.map(|node| node.value.clone())
    }

    fn try_push(&self, value: T, guard: &Guard) -> Result<(), T> {
        let top = self.top.load(Ordering::Acquire, guard);
        let node = Owned::new(Node {
            value,
            next: Atomic::null(),
        });
        node.next.store(top, Ordering::Relaxed);
        match self.top.compare_and_set(top, node, Ordering::AcqRel, guard) {
            Ok(_) => Ok(()),
            Err(e) => Err(e.new.into_box().value),
        }
    }

    fn try_pop(&self, guard: &Guard) -> Result<Option<T>, ()> {
        let top = self.top.load(Ordering::Acquire, guard);
        let node = match unsafe { top.as_ref() } {
            Some(node) => node,
            None => return Ok(None),
        };
        let next = node.next.load(Ordering::Relaxed, guard);
        if self
            .top
            .compare_and_set(top, next, Ordering::AcqRel, guard)
            .is_ok()
        {
            let value = node.value.clone();
            unsafe { guard.defer_destroy(top) };
            Ok(Some(value))
        } else {
            Err(())
        }
    }

    /// Offer `value` to a concurrent pop. `Ok` means some popper took it.
    fn eliminate_push(&self, value: T, guard: &Guard) -> Result<(), T> {
        let payload = Box::into_raw(Box::new(Payload(value))) as usize;
        let me = self.slot_index();
        let cell = Owned::new(CollisionCell {
            kind: OpKind::Push,
            word: AtomicUsize::new(payload),
        });
        let cell = match self.slots[me].compare_and_set(Shared::null(), cell, Ordering::AcqRel, guard)
        {
            Ok(shared) => shared,
            Err(e) => {
                // slot busy, the id range is oversubscribed
                drop(e.new);
                return Err(unsafe { take_payload::<T>(payload) });
            }
        };
        let cell_ref = unsafe { cell.deref() };

        let partner = thread_rng().gen_range(0, self.slots.len());
        if partner != me {
            let their = self.slots[partner].load(Ordering::Acquire, guard);
            if let Some(their_ref) = unsafe { their.as_ref() } {
                if let OpKind::Pop = their_ref.kind {
                    // withdraw our offer, then hand the payload over directly
                    if cell_ref
                        .word
                        .compare_exchange(payload, RETRACTED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        self.clear_slot(me, cell, guard);
                        if their_ref
                            .word
                            .compare_exchange(
                                PUBLISHED,
                                payload,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_ok()
                        {
                            return Ok(());
                        }
                        return Err(unsafe { take_payload::<T>(payload) });
                    }
                    // a popper claimed our value while we looked away
                    self.clear_slot(me, cell, guard);
                    return Ok(());
                }
            }
        }

        for _ in 0..ELIMINATION_SPIN {
            if cell_ref.word.load(Ordering::SeqCst) == CLAIMED {
                self.clear_slot(me, cell, guard);
                return Ok(());
            }
            std::hint::spin_loop();
        }
        if cell_ref
            .word
            .compare_exchange(payload, RETRACTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.clear_slot(me, cell, guard);
            Err(unsafe { take_payload::<T>(payload) })
        } else {
            // claimed at the last moment
            self.clear_slot(me, cell, guard);
            Ok(())
        }
    }

    /// Ask a concurrent push for its value. `Some` means a pair was
    /// eliminated.
    fn eliminate_pop(&self, guard: &Guard) -> Option<T> {
        let me = self.slot_index();
        let cell = Owned::new(CollisionCell {
            kind: OpKind::Pop,
            word: AtomicUsize::new(PUBLISHED),
        });
        let cell = match self.slots[me].compare_and_set(Shared::null(), cell, Ordering::AcqRel, guard)
        {
            Ok(shared) => shared,
            Err(e) => {
                drop(e.new);
                return None;
            }
        };
        let cell_ref = unsafe { cell.deref() };

        let partner = thread_rng().gen_range(0, self.slots.len());
        if partner != me {
            let their = self.slots[partner].load(Ordering::Acquire, guard);
            if let Some(their_ref) = unsafe { their.as_ref() } {
                if let OpKind::Push = their_ref.kind {
                    let offered = their_ref.word.load(Ordering::SeqCst);
                    if is_payload(offered) {
                        if cell_ref
                            .word
                            .compare_exchange(
                                PUBLISHED,
                                RETRACTED,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_ok()
                        {
                            self.clear_slot(me, cell, guard);
                            if their_ref
                                .word
                                .compare_exchange(
                                    offered,
                                    CLAIMED,
                                    Ordering::SeqCst,
                                    Ordering::SeqCst,
                                )
                                .is_ok()
                            {
                                return Some(unsafe { take_payload::<T>(offered) });
                            }
                            return None;
                        }
                        // a pusher filled our cell while we looked away
                        let filled = cell_ref.word.load(Ordering::SeqCst);
                        self.clear_slot(me, cell, guard);
                        debug_assert!(is_payload(filled));
                        return Some(unsafe { take_payload::<T>(filled) });
                    }
                }
            }
        }

        for _ in 0..ELIMINATION_SPIN {
            let word = cell_ref.word.load(Ordering::SeqCst);
            if is_payload(word) {
                self.clear_slot(me, cell, guard);
                return Some(unsafe { take_payload::<T>(word) });
            }
            std::hint::spin_loop();
        }
        if cell_ref
            .word
            .compare_exchange(PUBLISHED, RETRACTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.clear_slot(me, cell, guard);
            None
        } else {
            let word = cell_ref.word.load(Ordering::SeqCst);
            self.clear_slot(me, cell, guard);
            Some(unsafe { take_payload::<T>(word) })
        }
    }

    fn slot_index(&self) -> usize {
        (self.ids.current() - 1) % self.slots.len()
    }

    /// Only the publisher clears its slot and retires its cell.
    fn clear_slot(&self, index: usize, cell: Shared<'_, CollisionCell>, guard: &Guard) {
        self.slots[index].store(Shared::null(), Ordering::Release);
        unsafe { guard.defer_destroy(cell) };
    }
}

unsafe fn take_payload<T>(word: usize) -> T {
    Box::from_raw(word as *mut Payload<T>).0
}

impl<T: Clone + Send + Sync + 'static> Default for EliminationBackoffStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Stack<T> for EliminationBackoffStack<T> {
    fn push(&self, value: T) {
        EliminationBackoffStack::push(self, value)
    }

    fn pop(&self) -> Option<T> {
        EliminationBackoffStack::pop(self)
    }

    fn peek(&self) -> Option<T> {
        EliminationBackoffStack::peek(self)
    }
}

impl<T> Drop for EliminationBackoffStack<T> {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let mut curr = self.top.load(Ordering::Relaxed, guard);
            while let Some(node) = curr.as_ref() {
                let next = node.next.load(Ordering::Relaxed, guard);
                drop(curr.into_owned());
                curr = next;
            }
            for slot in self.slots.iter() {
                let cell = slot.load(Ordering::Relaxed, guard);
                if let Some(cell_ref) = cell.as_ref() {
                    let word = cell_ref.word.load(Ordering::Relaxed);
                    if is_payload(word) {
                        drop(Box::from_raw(word as *mut Payload<T>));
                    }
                    drop(cell.into_owned());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn single_slot_contention_conserves_values() {
        let stack = Arc::new(EliminationBackoffStack::with_thread_id_pool(
            Arc::new(ThreadIdPool::new()),
            1,
        ));
        let threads = 4usize;
        let per_thread = 1_000usize;
        let mut handles = Vec::new();
        for t in 0..threads {
            let stack = Arc::clone(&stack);
            handles.push(std::thread::spawn(move || {
                let mut popped = Vec::new();
                for i in 0..per_thread {
                    stack.push(t * per_thread + i);
                    if let Some(v) = stack.pop() {
                        popped.push(v);
                    }
                }
                popped
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(seen.insert(v));
            }
        }
        while let Some(v) = stack.pop() {
            assert!(seen.insert(v));
        }
        assert_eq!(seen.len(), threads * per_thread);
    }
}
