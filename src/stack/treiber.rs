use super::Stack;
use crossbeam_epoch::{self as epoch, Atomic, Owned};
use crossbeam_utils::CachePadded;
use std::sync::atomic::Ordering;

pub(super) struct Node<T> {
    pub value: T,
    pub next: Atomic<Node<T>>,
}

/// Plain lock-free stack: CAS the top, retry unboundedly.
pub struct TreiberStack<T> {
    top: CachePadded<Atomic<Node<T>>>,
}

impl<T: Clone + Send + Sync + 'static> TreiberStack<T> {
    pub fn new() -> Self {
        Self {
            top: CachePadded::new(Atomic::null()),
        }
    }

    pub fn push(&self, value: T) {
        let guard = epoch::pin();
        let mut node = Owned::new(Node {
            value,
            next: Atomic::null(),
        });
        loop {
            let top = self.top.load(Ordering::Acquire, &guard);
            node.next.store(top, Ordering::Relaxed);
            match self.top.compare_and_set(top, node, Ordering::AcqRel, &guard) {
                Ok(_) => return,
                Err(e) => node = e.new,
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let top = self.top.load(Ordering::Acquire, &guard);
            let node = unsafe { top.as_ref() }?;
            let next = node.next.load(Ordering::Relaxed, &guard);
            if self
                .top
                .compare_and_set(top, next, Ordering::AcqRel, &guard)
                .is_ok()
            {
                let value = node.value.clone();
                unsafe { guard.defer_destroy(top) };
                return Some(value);
            }
        }
    }

    pub fn peek(&self) -> Option<T> {
        let guard = epoch::pin();
        let top = self.top.load(Ordering::Acquire, &guard);
        unsafe { top.as_ref() }.map(|node| node.value.clone())
    }
}

impl<T: Clone + Send + Sync + 'static> Default for TreiberStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Stack<T> for TreiberStack<T> {
    fn push(&self, value: T) {
        TreiberStack::push(self, value)
    }

    fn pop(&self) -> Option<T> {
        TreiberStack::pop(self)
    }

    fn peek(&self) -> Option<T> {
        TreiberStack::peek(self)
    }
}

impl<T> Drop for TreiberStack<T> {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let mut curr = self.top.load(Ordering::Relaxed, guard);
            while let Some(node) = curr.as_ref() {
                let next = node.next.load(Ordering::Relaxed, guard);
                drop(curr.into_owned());
                curr = next;
            }
        }
    }
}
