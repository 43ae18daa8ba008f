//! Monotonically increasing metric.

use std::sync::Arc;

use crate::{
    core::{Collector, Metric},
    proto::{self, MetricKind},
    value::Value,
    Desc, Error, Opts, Result,
};

/// Metric representing a single value that only goes up (or is reset to zero
/// on process restart).
///
/// Cloning a [`Counter`] is cheap and yields a handle to the same value.
///
/// # Example
///
/// ```rust
/// use metrics_gatherer::{Counter, Error, Opts};
///
/// let requests = Counter::new(Opts::new("requests_total", "Requests."));
/// requests.inc();
/// requests.add(2.0)?;
/// assert_eq!(requests.get(), 3.0);
///
/// assert_eq!(requests.add(-1.0), Err(Error::NegativeCounterDelta(-1.0)));
/// assert_eq!(requests.get(), 3.0);
/// # Ok::<_, Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Counter(pub(crate) Arc<Value>);

impl Counter {
    /// Creates a new [`Counter`] out of the provided [`Opts`].
    ///
    /// [`Opts::variable_labels`] are ignored. Errors in the [`Opts`] are
    /// reported on registration.
    #[must_use]
    pub fn new(opts: Opts) -> Self {
        Self(Arc::new(Value::from_opts(&opts, MetricKind::Counter)))
    }

    /// Increments this [`Counter`] by one.
    pub fn inc(&self) {
        self.0.val.add(1.0);
    }

    /// Adds the provided `delta` to this [`Counter`].
    ///
    /// # Errors
    ///
    /// With [`Error::NegativeCounterDelta`] if the `delta` is negative (or
    /// NaN), leaving the [`Counter`] untouched.
    pub fn add(&self, delta: f64) -> Result<()> {
        if !(delta >= 0.0) {
            return Err(Error::NegativeCounterDelta(delta));
        }
        self.0.val.add(delta);
        Ok(())
    }

    /// Raises this [`Counter`] to the provided absolute `val`ue, if it's
    /// lower. Never decreases it.
    ///
    /// Intended for mirroring counters maintained elsewhere.
    pub fn absolute(&self, val: f64) {
        _ = self.0.val.fetch_max(val);
    }

    /// Resets this [`Counter`] to zero.
    pub fn reset(&self) {
        self.0.val.set(0.0);
    }

    /// Returns the current value of this [`Counter`].
    #[must_use]
    pub fn get(&self) -> f64 {
        self.0.val.get()
    }
}

impl Metric for Counter {
    fn desc(&self) -> &Desc {
        &self.0.desc
    }

    fn render(&self) -> proto::Sample {
        self.0.render()
    }
}

impl Collector for Counter {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.0.desc]
    }

    fn collect(&self) -> Vec<Box<dyn Metric>> {
        vec![Box::new(self.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative_delta() {
        let c = Counter::new(Opts::new("c", "help"));
        c.add(1.5).unwrap();

        assert_eq!(c.add(-0.1), Err(Error::NegativeCounterDelta(-0.1)));
        assert!(c.add(f64::NAN).is_err());
        assert_eq!(c.get(), 1.5);
    }

    #[test]
    fn absolute_never_decreases() {
        let c = Counter::new(Opts::new("c", "help"));
        c.absolute(10.0);
        c.absolute(4.0);
        assert_eq!(c.get(), 10.0);

        c.reset();
        assert_eq!(c.get(), 0.0);
    }

    #[test]
    fn renders_as_counter() {
        let c = Counter::new(Opts::new("c", "help"));
        c.inc();

        assert_eq!(Metric::render(&c).value, proto::Value::Counter(1.0));
        assert_eq!(Collector::desc(&c)[0].fq_name(), "c");
    }
}
