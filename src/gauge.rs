//! Metric going up and down.

use std::sync::Arc;

use crate::{
    core::{Collector, Metric},
    proto::{self, MetricKind},
    value::Value,
    Desc, Opts,
};

/// Metric representing a single value that can arbitrarily go up and down.
///
/// Cloning a [`Gauge`] is cheap and yields a handle to the same value.
#[derive(Clone, Debug)]
pub struct Gauge(pub(crate) Arc<Value>);

impl Gauge {
    /// Creates a new [`Gauge`] out of the provided [`Opts`].
    ///
    /// [`Opts::variable_labels`] are ignored. Errors in the [`Opts`] are
    /// reported on registration.
    #[must_use]
    pub fn new(opts: Opts) -> Self {
        Self(Arc::new(Value::from_opts(&opts, MetricKind::Gauge)))
    }

    /// Sets this [`Gauge`] to the provided `val`ue.
    pub fn set(&self, val: f64) {
        self.0.val.set(val);
    }

    /// Increments this [`Gauge`] by one.
    pub fn inc(&self) {
        self.0.val.add(1.0);
    }

    /// Decrements this [`Gauge`] by one.
    pub fn dec(&self) {
        self.0.val.sub(1.0);
    }

    /// Adds the provided `delta` (possibly negative) to this [`Gauge`].
    pub fn add(&self, delta: f64) {
        self.0.val.add(delta);
    }

    /// Subtracts the provided `delta` from this [`Gauge`].
    pub fn sub(&self, delta: f64) {
        self.0.val.sub(delta);
    }

    /// Returns the current value of this [`Gauge`].
    #[must_use]
    pub fn get(&self) -> f64 {
        self.0.val.get()
    }
}

impl Metric for Gauge {
    fn desc(&self) -> &Desc {
        &self.0.desc
    }

    fn render(&self) -> proto::Sample {
        self.0.render()
    }
}

impl Collector for Gauge {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.0.desc]
    }

    fn collect(&self) -> Vec<Box<dyn Metric>> {
        vec![Box::new(self.clone())]
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc, Barrier},
        thread,
    };

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn goes_up_and_down() {
        let g = Gauge::new(Opts::new("g", "help"));
        g.set(900.0);
        g.inc();
        g.dec();
        g.dec();
        g.add(-9.0);
        g.sub(90.0);

        assert_eq!(g.get(), 800.0);
        assert_eq!(Metric::render(&g).value, proto::Value::Gauge(800.0));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn concurrent_adds_sum_up(n in any::<u32>()) {
            let mutations = (n % 2000) as usize;
            let conc_level = (n % 15 + 1) as usize;

            let g = Gauge::new(
                Opts::new("test_gauge", "no help can be found here"),
            );
            let start = Arc::new(Barrier::new(conc_level));
            let (tx, rx) = mpsc::channel::<f64>();

            let handles = (0..conc_level)
                .map(|i| {
                    let (g, start, tx) =
                        (g.clone(), Arc::clone(&start), tx.clone());
                    let vals = (0..mutations)
                        .map(|j| (((i * 7919 + j * 104_729) % 1000) as f64) / 1000.0 - 0.5)
                        .collect::<Vec<_>>();
                    thread::spawn(move || {
                        _ = start.wait();
                        for v in vals {
                            tx.send(v).unwrap();
                            g.add(v);
                        }
                    })
                })
                .collect::<Vec<_>>();
            drop(tx);
            for h in handles {
                h.join().unwrap();
            }

            let expected: f64 = rx.iter().sum();
            prop_assert!((expected - g.get()).abs() < 0.000_001);
        }
    }
}
