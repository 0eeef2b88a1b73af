//! Two-thread rendez-vous over one stamped word. The slot packs an offer
//! pointer with a two-bit stamp; every transition is a single CAS from an
//! exact prior word, so a claimed offer is always the currently published
//! one and can be consumed without further coordination.

use crossbeam_utils::CachePadded;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

const EMPTY: usize = 0;
const WAITING: usize = 1;
const BUSY: usize = 2;
const STAMP_MASK: usize = 0b11;

static NEVER_INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Boxed value in flight; the alignment keeps the stamp bits free.
#[repr(align(4))]
struct Offer<T> {
    value: T,
}

/// Failed exchanges hand the caller's value back instead of dropping it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExchangeError<T> {
    #[error("exchange timed out")]
    Timeout(T),
    #[error("exchange interrupted")]
    Interrupted(T),
}

pub struct Exchanger<T> {
    slot: CachePadded<AtomicUsize>,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Send> Send for Exchanger<T> {}
unsafe impl<T: Send> Sync for Exchanger<T> {}

impl<T: Send> Exchanger<T> {
    pub fn new() -> Self {
        Self {
            slot: CachePadded::new(AtomicUsize::new(EMPTY)),
            _marker: PhantomData,
        }
    }

    /// Swap `value` with a peer within `timeout`.
    pub fn exchange(&self, value: T, timeout: Duration) -> Result<T, ExchangeError<T>> {
        self.exchange_interruptible(value, timeout, &NEVER_INTERRUPTED)
    }

    /// Like [`exchange`](Self::exchange), but also gives up when
    /// `interrupted` becomes true. The flag is polled between spin
    /// iterations, the Rust stand-in for a per-thread interrupt status.
    pub fn exchange_interruptible(
        &self,
        value: T,
        timeout: Duration,
        interrupted: &AtomicBool,
    ) -> Result<T, ExchangeError<T>> {
        let deadline = Instant::now() + timeout;
        let offer = Box::into_raw(Box::new(Offer { value }));
        loop {
            if interrupted.load(Ordering::Relaxed) {
                return Err(ExchangeError::Interrupted(unsafe { reclaim(offer) }));
            }
            let curr = self.slot.load(Ordering::SeqCst);
            match curr & STAMP_MASK {
                EMPTY => {
                    let waiting = offer as usize | WAITING;
                    if self
                        .slot
                        .compare_exchange(curr, waiting, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return self.await_peer(offer, deadline, interrupted);
                    }
                }
                WAITING => {
                    let their = (curr & !STAMP_MASK) as *mut Offer<T>;
                    let busy = offer as usize | BUSY;
                    if self
                        .slot
                        .compare_exchange(curr, busy, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        // the CAS claimed the published offer, it is ours now
                        return Ok(unsafe { reclaim(their) });
                    }
                }
                _ => {
                    // another pair is completing
                    std::hint::spin_loop();
                }
            }
            if Instant::now() >= deadline {
                return Err(ExchangeError::Timeout(unsafe { reclaim(offer) }));
            }
        }
    }

    /// Installed as the waiter; spin until a peer turns the slot busy or the
    /// deadline passes. Losing the retract race means the exchange is
    /// completing and must be reported as a success.
    fn await_peer(
        &self,
        offer: *mut Offer<T>,
        deadline: Instant,
        interrupted: &AtomicBool,
    ) -> Result<T, ExchangeError<T>> {
        let waiting = offer as usize | WAITING;
        loop {
            let curr = self.slot.load(Ordering::SeqCst);
            if curr & STAMP_MASK == BUSY {
                // from our WAITING word the only possible transition
                let their = (curr & !STAMP_MASK) as *mut Offer<T>;
                self.slot.store(EMPTY, Ordering::SeqCst);
                return Ok(unsafe { reclaim(their) });
            }
            let cancelled = interrupted.load(Ordering::Relaxed);
            if cancelled || Instant::now() >= deadline {
                if self
                    .slot
                    .compare_exchange(waiting, EMPTY, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    let value = unsafe { reclaim(offer) };
                    return Err(if cancelled {
                        ExchangeError::Interrupted(value)
                    } else {
                        ExchangeError::Timeout(value)
                    });
                }
                continue;
            }
            std::hint::spin_loop();
        }
    }
}

impl<T: Send> Default for Exchanger<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Exchanger<T> {
    fn drop(&mut self) {
        // a leftover offer is only possible after an abandoned exchange
        let curr = self.slot.load(Ordering::Relaxed);
        let ptr = (curr & !STAMP_MASK) as *mut Offer<T>;
        if !ptr.is_null() {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

unsafe fn reclaim<T>(offer: *mut Offer<T>) -> T {
    Box::from_raw(offer).value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lone_thread_times_out() {
        let exchanger: Exchanger<String> = Exchanger::new();
        let outcome = exchanger.exchange("hello".to_string(), Duration::from_millis(1));
        assert_eq!(outcome, Err(ExchangeError::Timeout("hello".to_string())));
    }

    #[test]
    fn interrupt_flag_cancels() {
        let exchanger: Exchanger<u32> = Exchanger::new();
        let interrupted = AtomicBool::new(true);
        let outcome =
            exchanger.exchange_interruptible(7, Duration::from_secs(10), &interrupted);
        assert_eq!(outcome, Err(ExchangeError::Interrupted(7)));
    }

    #[test]
    fn pair_swaps_values() {
        let exchanger = Arc::new(Exchanger::new());
        let other = Arc::clone(&exchanger);
        let handle = std::thread::spawn(move || {
            other.exchange("ping".to_string(), Duration::from_secs(5))
        });
        let mine = exchanger.exchange("pong".to_string(), Duration::from_secs(5));
        let theirs = handle.join().unwrap();
        assert_eq!(mine.unwrap(), "ping");
        assert_eq!(theirs.unwrap(), "pong");
    }

    #[test]
    fn long_run_of_exchanges_makes_progress() {
        let exchanger = Arc::new(Exchanger::new());
        let rounds = 10_000u32;
        let spawn = |ex: Arc<Exchanger<u32>>, base: u32| {
            std::thread::spawn(move || {
                let mut succeeded = 0u32;
                for i in 0..rounds {
                    if ex.exchange(base + i, Duration::from_millis(1)).is_ok() {
                        succeeded += 1;
                    }
                }
                succeeded
            })
        };
        let a = spawn(Arc::clone(&exchanger), 0);
        let b = spawn(Arc::clone(&exchanger), 1_000_000);
        let a = a.join().unwrap();
        let b = b.join().unwrap();
        // every completed exchange pairs one success on each side
        assert_eq!(a, b);
    }
}
