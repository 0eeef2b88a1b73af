use super::Stack;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, TryLockError};

/// Publication passes one combiner makes before releasing the lock.
/// Empirical, keep tunable.
const COMBINING_ROUNDS: usize = 20;

enum OpKind {
    Push,
    Pop,
    Peek,
}

struct OpRecord<T> {
    kind: OpKind,
    /// Push input, or pop/peek output once `ready` is set.
    cell: UnsafeCell<Option<T>>,
    ready: AtomicBool,
    next: Atomic<OpRecord<T>>,
}

unsafe impl<T: Send> Send for OpRecord<T> {}
unsafe impl<T: Send> Sync for OpRecord<T> {}

/// Flat-combining stack. Threads publish operation records into a lock-free
/// list; whoever grabs the combiner lock applies everybody's operations to a
/// plain `Vec` while the rest spin on their own `ready` flags.
pub struct FlatCombiningStack<T> {
    publications: Atomic<OpRecord<T>>,
    items: Mutex<Vec<T>>,
}

impl<T: Clone + Send + Sync + 'static> FlatCombiningStack<T> {
    pub fn new() -> Self {
        Self {
            publications: Atomic::null(),
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, value: T) {
        self.run(OpKind::Push, Some(value));
    }

    pub fn pop(&self) -> Option<T> {
        self.run(OpKind::Pop, None)
    }

    pub fn peek(&self) -> Option<T> {
        self.run(OpKind::Peek, None)
    }

    fn run(&self, kind: OpKind, input: Option<T>) -> Option<T> {
        let guard = epoch::pin();
        let record = Owned::new(OpRecord {
            kind,
            cell: UnsafeCell::new(input),
            ready: AtomicBool::new(false),
            next: Atomic::null(),
        })
        .into_shared(&guard);
        let record_ref = unsafe { record.deref() };

        loop {
            let head = self.publications.load(Ordering::Acquire, &guard);
            record_ref.next.store(head, Ordering::Relaxed);
            if self
                .publications
                .compare_and_set(head, record, Ordering::AcqRel, &guard)
                .is_ok()
            {
                break;
            }
        }

        loop {
            if record_ref.ready.load(Ordering::Acquire) {
                break;
            }
            match self.items.try_lock() {
                Ok(mut items) => self.combine(&mut items, &guard),
                Err(TryLockError::Poisoned(poisoned)) => {
                    self.combine(&mut poisoned.into_inner(), &guard)
                }
                Err(TryLockError::WouldBlock) => std::thread::yield_now(),
            }
        }
        // the record is ours again once ready; the combiner already retired
        // it, the pin keeps it readable until we are done
        unsafe { (*record_ref.cell.get()).take() }
    }

    /// Run combining passes: detach the whole publication list, apply every
    /// record in order, mark it ready and retire it.
    fn combine(&self, items: &mut Vec<T>, guard: &Guard) {
        for _ in 0..COMBINING_ROUNDS {
            let chain = self
                .publications
                .swap(Shared::null(), Ordering::AcqRel, guard);
            if chain.is_null() {
                return;
            }
            let mut curr = chain;
            while let Some(record) = unsafe { curr.as_ref() } {
                let next = record.next.load(Ordering::Relaxed, guard);
                unsafe {
                    let cell = &mut *record.cell.get();
                    match record.kind {
                        OpKind::Push => {
                            if let Some(value) = cell.take() {
                                items.push(value);
                            }
                        }
                        OpKind::Pop => *cell = items.pop(),
                        OpKind::Peek => *cell = items.last().cloned(),
                    }
                }
                record.ready.store(true, Ordering::Release);
                unsafe { guard.defer_destroy(curr) };
                curr = next;
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for FlatCombiningStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Stack<T> for FlatCombiningStack<T> {
    fn push(&self, value: T) {
        FlatCombiningStack::push(self, value)
    }

    fn pop(&self) -> Option<T> {
        FlatCombiningStack::pop(self)
    }

    fn peek(&self) -> Option<T> {
        FlatCombiningStack::peek(self)
    }
}

impl<T> Drop for FlatCombiningStack<T> {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let mut curr = self.publications.load(Ordering::Relaxed, guard);
            while let Some(record) = curr.as_ref() {
                let next = record.next.load(Ordering::Relaxed, guard);
                drop(curr.into_owned());
                curr = next;
            }
        }
    }
}
