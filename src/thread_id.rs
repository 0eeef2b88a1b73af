use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

static POOL_GENERATION: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static ASSIGNED: RefCell<Vec<(usize, usize)>> = RefCell::new(Vec::new());
}

/// Dense 1-based thread ids, handed out on first use per thread. An explicit
/// resource rather than a process-wide global so tests can create and reset
/// their own pools; `reset` starts a fresh generation and invalidates every
/// id handed out so far.
pub struct ThreadIdPool {
    generation: AtomicUsize,
    next: AtomicUsize,
}

impl ThreadIdPool {
    pub fn new() -> Self {
        Self {
            generation: AtomicUsize::new(next_generation()),
            next: AtomicUsize::new(1),
        }
    }

    /// Id of the calling thread within this pool, assigning one on first use.
    pub fn current(&self) -> usize {
        let generation = self.generation.load(Ordering::Acquire);
        ASSIGNED.with(|cache| {
            let mut cache = cache.borrow_mut();
            if let Some(&(_, id)) = cache.iter().find(|&&(g, _)| g == generation) {
                return id;
            }
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            cache.push((generation, id));
            id
        })
    }

    pub fn reset(&self) {
        self.next.store(1, Ordering::Relaxed);
        self.generation.store(next_generation(), Ordering::Release);
    }
}

impl Default for ThreadIdPool {
    fn default() -> Self {
        Self::new()
    }
}

fn next_generation() -> usize {
    POOL_GENERATION.fetch_add(1, Ordering::Relaxed) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ids_are_stable_per_thread() {
        let pool = ThreadIdPool::new();
        let id = pool.current();
        assert_eq!(pool.current(), id);
        assert_eq!(id, 1);
    }

    #[test]
    fn pools_are_independent() {
        let a = ThreadIdPool::new();
        let b = ThreadIdPool::new();
        assert_eq!(a.current(), 1);
        assert_eq!(b.current(), 1);
    }

    #[test]
    fn reset_starts_a_fresh_range() {
        let pool = ThreadIdPool::new();
        assert_eq!(pool.current(), 1);
        pool.reset();
        assert_eq!(pool.current(), 1);
    }

    #[test]
    fn concurrent_threads_get_distinct_ids() {
        let pool = Arc::new(ThreadIdPool::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || pool.current()));
        }
        let mut ids: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        assert!(ids.iter().all(|&id| (1..=4).contains(&id)));
    }
}
