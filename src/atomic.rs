//! Lock-free floating point cell.

use std::sync::atomic::{AtomicU64, Ordering};

/// 64-bit floating point value, safe for concurrent use without locks.
///
/// Mutations are performed as compare-and-swap loops over the bit
/// representation of the value, so concurrent [`AtomicF64::add()`]s never lose
/// an update, and a concurrent [`AtomicF64::get()`] never observes torn bits.
#[derive(Debug, Default)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    /// Creates a new [`AtomicF64`] holding the provided `val`ue.
    #[must_use]
    pub fn new(val: f64) -> Self {
        Self { bits: AtomicU64::new(val.to_bits()) }
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Replaces the current value unconditionally.
    pub fn set(&self, val: f64) {
        self.bits.store(val.to_bits(), Ordering::Relaxed);
    }

    /// Adds the provided `delta` to the current value.
    pub fn add(&self, delta: f64) {
        self.update(|cur| Some(cur + delta));
    }

    /// Subtracts the provided `delta` from the current value.
    pub fn sub(&self, delta: f64) {
        self.update(|cur| Some(cur - delta));
    }

    /// Raises the current value to `val`, if it's lower.
    ///
    /// Returns the value observed before the operation.
    pub fn fetch_max(&self, val: f64) -> f64 {
        self.update(|cur| (val > cur).then_some(val))
    }

    /// Swaps the current value with the provided one, returning the previous.
    pub fn swap(&self, val: f64) -> f64 {
        f64::from_bits(self.bits.swap(val.to_bits(), Ordering::Relaxed))
    }

    /// Retries applying `f` to the current value until no concurrent write
    /// intervenes. `None` returned by `f` leaves the value untouched.
    fn update(&self, mut f: impl FnMut(f64) -> Option<f64>) -> f64 {
        let mut old = self.bits.load(Ordering::Relaxed);
        loop {
            let cur = f64::from_bits(old);
            let Some(new) = f(cur) else {
                return cur;
            };
            match self.bits.compare_exchange_weak(
                old,
                new.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return cur,
                Err(actual) => old = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use proptest::prelude::*;

    use super::AtomicF64;

    #[test]
    fn sets_and_gets() {
        let v = AtomicF64::new(1.5);
        assert_eq!(v.get(), 1.5);

        v.set(-3.0);
        assert_eq!(v.get(), -3.0);

        v.add(4.0);
        v.sub(0.5);
        assert_eq!(v.get(), 0.5);

        assert_eq!(v.swap(7.0), 0.5);
        assert_eq!(v.get(), 7.0);
    }

    #[test]
    fn fetch_max_only_raises() {
        let v = AtomicF64::new(10.0);

        assert_eq!(v.fetch_max(5.0), 10.0);
        assert_eq!(v.get(), 10.0);

        assert_eq!(v.fetch_max(12.0), 10.0);
        assert_eq!(v.get(), 12.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn concurrent_adds_lose_no_update(
            streams in prop::collection::vec(
                prop::collection::vec(-1000i32..1000, 0..500),
                1..16,
            ),
        ) {
            // Integral deltas keep the reference sum exact regardless of the
            // order the additions are applied in.
            let expected: f64 =
                streams.iter().flatten().map(|d| f64::from(*d)).sum();

            let v = Arc::new(AtomicF64::default());
            let handles = streams
                .into_iter()
                .map(|deltas| {
                    let v = Arc::clone(&v);
                    thread::spawn(move || {
                        for d in deltas {
                            v.add(f64::from(d));
                        }
                    })
                })
                .collect::<Vec<_>>();
            for h in handles {
                h.join().unwrap();
            }

            prop_assert_eq!(v.get(), expected);
        }
    }
}
