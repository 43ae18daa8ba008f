//! Shared storage of scalar metrics and their constant counterparts.

use std::sync::Arc;

use crate::{
    atomic::AtomicF64,
    core::{Collector, Metric},
    proto::{self, LabelPair, MetricKind},
    Desc, Opts, Result,
};

/// Scalar value of a single counter, gauge or untyped time series.
#[derive(Debug)]
pub(crate) struct Value {
    /// [`Desc`] of the whole metric (or of the vector it belongs to).
    pub(crate) desc: Arc<Desc>,

    /// Type to render this [`Value`] as.
    kind: MetricKind,

    /// Current value.
    pub(crate) val: AtomicF64,

    /// Const and variable labels of this series, sorted by name.
    labels: Vec<LabelPair>,
}

impl Value {
    /// Creates a new zeroed [`Value`].
    pub(crate) fn new(
        desc: Arc<Desc>,
        kind: MetricKind,
        labels: Vec<LabelPair>,
    ) -> Self {
        Self { desc, kind, val: AtomicF64::default(), labels }
    }

    /// Creates a new zeroed [`Value`] of a label-less metric out of the
    /// provided [`Opts`].
    pub(crate) fn from_opts(opts: &Opts, kind: MetricKind) -> Self {
        let desc = opts.single_desc();
        let labels = desc.const_label_pairs().to_vec();
        Self::new(Arc::new(desc), kind, labels)
    }

    pub(crate) fn render(&self) -> proto::Sample {
        let v = self.val.get();
        proto::Sample {
            labels: self.labels.clone(),
            value: match self.kind {
                MetricKind::Counter => proto::Value::Counter(v),
                MetricKind::Gauge => proto::Value::Gauge(v),
                MetricKind::Histogram | MetricKind::Untyped => {
                    proto::Value::Untyped(v)
                }
            },
            timestamp_ms: None,
        }
    }
}

/// Metric whose value is neither a counter nor a gauge.
///
/// Mutated the same way as a [`Gauge`](crate::Gauge), but exposed without a
/// declared type.
#[derive(Clone, Debug)]
pub struct Untyped(pub(crate) Arc<Value>);

impl Untyped {
    /// Creates a new [`Untyped`] metric out of the provided [`Opts`].
    ///
    /// [`Opts::variable_labels`] are ignored. Errors in the [`Opts`] are
    /// reported on registration.
    #[must_use]
    pub fn new(opts: Opts) -> Self {
        Self(Arc::new(Value::from_opts(&opts, MetricKind::Untyped)))
    }

    /// Sets the value.
    pub fn set(&self, v: f64) {
        self.0.val.set(v);
    }

    /// Adds the provided `delta` to the value.
    pub fn add(&self, delta: f64) {
        self.0.val.add(delta);
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> f64 {
        self.0.val.get()
    }
}

impl Metric for Untyped {
    fn desc(&self) -> &Desc {
        &self.0.desc
    }

    fn render(&self) -> proto::Sample {
        self.0.render()
    }
}

impl Collector for Untyped {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.0.desc]
    }

    fn collect(&self) -> Vec<Box<dyn Metric>> {
        vec![Box::new(self.clone())]
    }
}

/// Throw-away [`Metric`] with a fixed value, for [`Collector`]s mirroring
/// some external state on each collection.
#[derive(Clone, Debug)]
pub struct ConstMetric {
    desc: Arc<Desc>,
    sample: proto::Sample,
}

impl ConstMetric {
    /// Creates a new [`ConstMetric`] of the provided `desc` with the provided
    /// `value` and variable `label_values`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidDescriptor`] if the `desc` is invalid.
    /// - [`Error::UnmatchedLabels`] if the `label_values` don't match the
    ///   variable labels of the `desc`.
    ///
    /// [`Error::InvalidDescriptor`]: crate::Error::InvalidDescriptor
    /// [`Error::UnmatchedLabels`]: crate::Error::UnmatchedLabels
    pub fn new(
        desc: Arc<Desc>,
        value: proto::Value,
        label_values: &[&str],
    ) -> Result<Self> {
        desc.validity().map_err(Clone::clone)?;
        let labels = desc.label_pairs(label_values)?;
        Ok(Self {
            desc,
            sample: proto::Sample { labels, value, timestamp_ms: None },
        })
    }

    /// Attaches the provided timestamp (in milliseconds since UNIX epoch) to
    /// this [`ConstMetric`].
    #[must_use]
    pub fn with_timestamp_ms(mut self, ts: i64) -> Self {
        self.sample.timestamp_ms = Some(ts);
        self
    }
}

impl Metric for ConstMetric {
    fn desc(&self) -> &Desc {
        &self.desc
    }

    fn render(&self) -> proto::Sample {
        self.sample.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn untyped_renders_const_labels() {
        let m = Untyped::new(
            Opts::new("temp", "Temperature.").const_label("room", "a"),
        );
        m.set(20.0);
        m.add(1.5);

        let s = Metric::render(&m);
        assert_eq!(s.value, proto::Value::Untyped(21.5));
        assert_eq!(s.labels, vec![LabelPair::new("room", "a")]);
    }

    #[test]
    fn const_metric_checks_labels() {
        let desc = Arc::new(Desc::new(
            "x",
            "help",
            [("c", "1")],
            ["a", "b"],
        ));

        let m = ConstMetric::new(
            Arc::clone(&desc),
            proto::Value::Counter(3.0),
            &["1", "2"],
        )
        .unwrap()
        .with_timestamp_ms(7);
        let s = m.render();
        assert_eq!(s.timestamp_ms, Some(7));
        assert_eq!(s.labels.len(), 3);

        assert!(matches!(
            ConstMetric::new(desc, proto::Value::Counter(3.0), &["1"]),
            Err(Error::UnmatchedLabels { .. }),
        ));
    }

    #[test]
    fn const_metric_rejects_invalid_desc() {
        let desc = Arc::new(Desc::new("x", "", [("c", "1")], ["a"]));

        assert!(matches!(
            ConstMetric::new(desc, proto::Value::Gauge(1.0), &["1"]),
            Err(Error::InvalidDescriptor { .. }),
        ));
    }
}
