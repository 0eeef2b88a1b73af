use super::treiber::Node;
use super::Stack;
use crate::backoff::Backoff;
use crossbeam_epoch::{self as epoch, Atomic, Owned};
use crossbeam_utils::CachePadded;
use std::sync::atomic::Ordering;

const MIN_DELAY: u32 = 1;
const MAX_DELAY: u32 = 64;

/// Treiber stack that backs off after every failed CAS instead of hammering
/// the top pointer.
pub struct BackoffStack<T> {
    top: CachePadded<Atomic<Node<T>>>,
}

impl<T: Clone + Send + Sync + 'static> BackoffStack<T> {
    pub fn new() -> Self {
        Self {
            top: CachePadded::new(Atomic::null()),
        }
    }

    pub fn push(&self, value: T) {
        let guard = epoch::pin();
        let mut backoff = Backoff::new(MIN_DELAY, MAX_DELAY);
        let mut node = Owned::new(Node {
            value,
            next: Atomic::null(),
        });
        loop {
            let top = self.top.load(Ordering::Acquire, &guard);
            node.next.store(top, Ordering::Relaxed);
            match self.top.compare_and_set(top, node, Ordering::AcqRel, &guard) {
                Ok(_) => return,
                Err(e) => {
                    node = e.new;
                    backoff.backoff();
                }
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        let mut backoff = Backoff::new(MIN_DELAY, MAX_DELAY);
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
            backoff.backoff();
        }
    }

    pub fn peek(&self) -> Option<T> {
        let guard = epoch::pin();
        let top = self.top.load(Ordering::Acquire, &guard);
        unsafe { top.as_ref() }.map(|node| node.value.clone())
    }
}

impl<T: Clone + Send + Sync + 'static> Default for BackoffStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Stack<T> for BackoffStack<T> {
    fn push(&self, value: T) {
        BackoffStack::push(self, value)
    }

    fn pop(&self) -> Option<T> {
        BackoffStack::pop(self)
    }

    fn peek(&self) -> Option<T> {
        BackoffStack::peek(self)
    }
}

impl<T> Drop for BackoffStack<T> {
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
