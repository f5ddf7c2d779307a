use std::sync::atomic::{AtomicU64, Ordering};

/// Deterministic 1-in-N admission counter.
///
/// Admits the 1st, (N+1)th, (2N+1)th ... call. The counter is shared by every
/// caller of the same instance, so capture feeds running concurrently still see
/// exactly one admission per N calls overall.
#[derive(Debug)]
pub struct EveryNth {
    rate: u64,
    seen: AtomicU64,
}

impl EveryNth {
    pub fn new(rate: u32) -> Self {
        Self {
            rate: u64::from(rate),
            seen: AtomicU64::new(0),
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.rate <= 1
    }

    pub fn admit(&self) -> bool {
        if self.is_passthrough() {
            return true;
        }
        self.seen.fetch_add(1, Ordering::Relaxed) % self.rate == 0
    }
}

impl Clone for EveryNth {
    fn clone(&self) -> Self {
        Self {
            rate: self.rate,
            seen: AtomicU64::new(self.seen.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn zero_and_one_admit_everything() {
        for rate in [0, 1] {
            let sampler = EveryNth::new(rate);
            assert!((0..100).all(|_| sampler.admit()));
        }
    }

    #[test]
    fn admits_first_then_every_nth() {
        let sampler = EveryNth::new(3);
        let admitted: Vec<bool> = (0..7).map(|_| sampler.admit()).collect();
        assert_eq!(
            admitted,
            vec![true, false, false, true, false, false, true]
        );
    }

    proptest! {
        #[test]
        fn admits_ceil_of_n_over_rate(rate in 2u32..64, n in 0usize..2_000) {
            let sampler = EveryNth::new(rate);
            let admitted = (0..n).filter(|_| sampler.admit()).count();
            prop_assert_eq!(admitted, n.div_ceil(rate as usize));
        }
    }
}
