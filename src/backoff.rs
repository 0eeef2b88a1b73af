use once_cell::sync::Lazy;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Spin iterations per delay step. Empirical, keep tunable.
const SPIN_SCALE: u64 = 10_000;

static MULTIPROCESSOR: Lazy<bool> = Lazy::new(|| num_cpus::get() > 1);

/// Randomized exponential backoff for contended retry loops. Each call
/// sleeps a random number of delay steps below the current limit and doubles
/// the limit up to `max`.
pub struct Backoff {
    limit: u32,
    max: u32,
    /// Seeded on first use; an uncontended caller never pays for entropy.
    rng: Option<SmallRng>,
}

impl Backoff {
    pub fn new(min: u32, max: u32) -> Self {
        assert!(min >= 1 && min <= max);
        Self {
            limit: min,
            max,
            rng: None,
        }
    }

    pub fn backoff(&mut self) {
        let rng = self.rng.get_or_insert_with(SmallRng::from_entropy);
        let delay = rng.gen_range(0, self.limit);
        self.limit = self.limit.saturating_mul(2).min(self.max);
        if delay == 0 {
            return;
        }
        if *MULTIPROCESSOR {
            for _ in 0..u64::from(delay) * SPIN_SCALE {
                std::hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_doubles_up_to_max() {
        let mut backoff = Backoff::new(1, 8);
        assert_eq!(backoff.limit, 1);
        for _ in 0..10 {
            backoff.backoff();
        }
        assert_eq!(backoff.limit, 8);
    }

    #[test]
    #[should_panic]
    fn zero_min_is_rejected() {
        let _ = Backoff::new(0, 8);
    }
}
