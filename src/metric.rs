//! Adapters of this crate's metrics to the [`metrics`] crate interfaces.

use std::sync::Arc;

use arc_swap::ArcSwap;
use sealed::sealed;

use crate::{
    core::{Collector, Metric},
    opts::DEFAULT_BUCKETS,
    proto, Counter, CounterVec, Desc, Error, Gauge, GaugeVec, Histogram,
    HistogramOpts, HistogramVec, Opts, Result,
};

use self::bundle::Either;

pub use self::bundle::Bundle;

impl metrics::CounterFn for Counter {
    #[allow(clippy::cast_precision_loss)] // acceptable for counters
    fn increment(&self, val: u64) {
        self.0.val.add(val as f64);
    }

    #[allow(clippy::cast_precision_loss)] // acceptable for counters
    fn absolute(&self, val: u64) {
        self.absolute(val as f64);
    }
}

impl metrics::GaugeFn for Gauge {
    fn increment(&self, val: f64) {
        self.add(val);
    }

    fn decrement(&self, val: f64) {
        self.sub(val);
    }

    fn set(&self, val: f64) {
        Gauge::set(self, val);
    }
}

impl metrics::HistogramFn for Histogram {
    fn record(&self, val: f64) {
        self.observe(val);
    }
}

/// Outcome of creating a metric for a [`metrics::Key`], passed through a
/// [`metrics::Registry`] up to a [`metrics::Recorder`] deciding what to do
/// with a failure.
///
/// [`metrics::Registry`]: metrics_util::registry::Registry
#[derive(Clone, Debug)]
pub struct Fallible<M>(pub Result<M>);

impl<M> From<Result<M>> for Fallible<M> {
    fn from(res: Result<M>) -> Self {
        Self(res)
    }
}

impl<M> Fallible<M> {
    /// Returns the created metric, if any.
    ///
    /// # Errors
    ///
    /// If the metric failed to be created or registered.
    pub const fn as_ref(&self) -> Result<&M, &Error> {
        self.0.as_ref()
    }
}

impl<M: metrics::CounterFn> metrics::CounterFn for Fallible<M> {
    fn increment(&self, val: u64) {
        if let Ok(m) = &self.0 {
            m.increment(val);
        }
    }

    fn absolute(&self, val: u64) {
        if let Ok(m) = &self.0 {
            m.absolute(val);
        }
    }
}

impl<M: metrics::GaugeFn> metrics::GaugeFn for Fallible<M> {
    fn increment(&self, val: f64) {
        if let Ok(m) = &self.0 {
            m.increment(val);
        }
    }

    fn decrement(&self, val: f64) {
        if let Ok(m) = &self.0 {
            m.decrement(val);
        }
    }

    fn set(&self, val: f64) {
        if let Ok(m) = &self.0 {
            m.set(val);
        }
    }
}

impl<M: metrics::HistogramFn> metrics::HistogramFn for Fallible<M> {
    fn record(&self, val: f64) {
        if let Ok(m) = &self.0 {
            m.record(val);
        }
    }
}

/// Metric (or a bundle of them) with a `help` description changeable in
/// runtime.
///
/// Empty description keeps the `help` the metric was created with.
#[derive(Clone, Debug, Default)]
pub struct Describable<M> {
    pub(crate) description: Arc<ArcSwap<String>>,
    pub(crate) metric: M,
}

impl<M> Describable<M> {
    /// Wraps the provided `metric` without changing its description.
    pub fn wrap(metric: M) -> Self {
        Self { description: Arc::default(), metric }
    }

    /// Creates a [`Describable`] with the provided `desc`ription and no
    /// metric yet.
    pub fn only_description(desc: impl Into<String>) -> Self
    where
        M: Default,
    {
        Self {
            description: Arc::new(ArcSwap::new(Arc::new(desc.into()))),
            metric: M::default(),
        }
    }

    /// Maps the wrapped metric, keeping the description shared.
    pub fn map<Into>(self, into: impl FnOnce(M) -> Into) -> Describable<Into> {
        Describable { description: self.description, metric: into(self.metric) }
    }
}

impl<M: Collector> Collector for Describable<M> {
    fn desc(&self) -> Vec<&Desc> {
        // A `Registry` uses `Collector::desc()` for identification only, so
        // the `help` is substituted in `Collector::collect()` alone.
        self.metric.desc()
    }

    fn collect(&self) -> Vec<Box<dyn Metric>> {
        let out = self.metric.collect();
        let help = self.description.load_full();
        if help.is_empty() {
            return out;
        }

        // Children of a vector share the same `Desc`.
        let mut last: Option<Arc<Desc>> = None;
        out.into_iter()
            .map(|metric| {
                let desc = match &last {
                    Some(d) if d.id() == metric.desc().id() => Arc::clone(d),
                    _ => {
                        let d =
                            Arc::new(metric.desc().with_help(help.as_str()));
                        last = Some(Arc::clone(&d));
                        d
                    }
                };
                Box::new(Described { desc, metric }) as Box<dyn Metric>
            })
            .collect()
    }
}

/// [`Metric`] rendered under a [`Desc`] with a substituted `help`.
struct Described {
    desc: Arc<Desc>,
    metric: Box<dyn Metric>,
}

impl Metric for Described {
    fn desc(&self) -> &Desc {
        &self.desc
    }

    fn render(&self) -> proto::Sample {
        self.metric.render()
    }
}

/// Creates the [`Opts`] of a metric identified by the provided
/// [`metrics::Key`].
fn opts(key: &metrics::Key) -> Opts {
    // `key.name()` is used as a `help` description here, because it cannot be
    // empty. Use `metrics::describe_*!()` macros to change it.
    Opts::new(key.name(), key.name()).variable_labels(label_names(key))
}

fn label_names(key: &metrics::Key) -> impl Iterator<Item = &str> {
    key.labels().map(metrics::Label::key)
}

/// Metric which is a part of a [`Bundle`].
#[sealed]
pub trait Bundled {
    /// [`Bundle`] this metric is a part of.
    type Bundle: Bundle;

    /// Wraps this metric into its [`Bundle`].
    fn into_bundle(self) -> Self::Bundle;
}

#[sealed]
impl Bundled for Counter {
    type Bundle = CounterBundle;

    fn into_bundle(self) -> Self::Bundle {
        Either::Single(self)
    }
}

#[sealed]
impl Bundled for CounterVec {
    type Bundle = CounterBundle;

    fn into_bundle(self) -> Self::Bundle {
        Either::Vec(self)
    }
}

#[sealed]
impl Bundled for Gauge {
    type Bundle = GaugeBundle;

    fn into_bundle(self) -> Self::Bundle {
        Either::Single(self)
    }
}

#[sealed]
impl Bundled for GaugeVec {
    type Bundle = GaugeBundle;

    fn into_bundle(self) -> Self::Bundle {
        Either::Vec(self)
    }
}

#[sealed]
impl Bundled for Histogram {
    type Bundle = HistogramBundle;

    fn into_bundle(self) -> Self::Bundle {
        Either::Single(self)
    }
}

#[sealed]
impl Bundled for HistogramVec {
    type Bundle = HistogramBundle;

    fn into_bundle(self) -> Self::Bundle {
        Either::Vec(self)
    }
}

/// [`Counter`]s sharing the same name.
pub type CounterBundle = Either<Counter, CounterVec>;

impl From<&metrics::Key> for CounterBundle {
    fn from(key: &metrics::Key) -> Self {
        if key.labels().next().is_some() {
            Self::Vec(CounterVec::new(opts(key)))
        } else {
            Self::Single(Counter::new(opts(key)))
        }
    }
}

/// [`Gauge`]s sharing the same name.
pub type GaugeBundle = Either<Gauge, GaugeVec>;

impl From<&metrics::Key> for GaugeBundle {
    fn from(key: &metrics::Key) -> Self {
        if key.labels().next().is_some() {
            Self::Vec(GaugeVec::new(opts(key)))
        } else {
            Self::Single(Gauge::new(opts(key)))
        }
    }
}

/// [`Histogram`]s sharing the same name.
pub type HistogramBundle = Either<Histogram, HistogramVec>;

impl From<&metrics::Key> for HistogramBundle {
    fn from(key: &metrics::Key) -> Self {
        let opts =
            HistogramOpts::from(opts(key)).buckets(DEFAULT_BUCKETS.to_vec());
        if key.labels().next().is_some() {
            Self::Vec(HistogramVec::new(opts))
        } else {
            Self::Single(Histogram::new(opts))
        }
    }
}

pub mod bundle {
    //! Metrics sharing the same name, either a single one or a vector.

    use std::{collections::HashMap, iter};

    use sealed::sealed;

    use crate::{
        core::{Collector, Metric},
        vec::{Child, MetricVec},
        Desc, Error, Result,
    };

    use super::label_names;

    /// Either a single metric, or a vector of them.
    #[derive(Clone, Copy, Debug)]
    pub enum Either<Single, Vec> {
        /// Single label-less metric.
        Single(Single),

        /// Vector of labeled metrics.
        Vec(Vec),
    }

    impl<S, V> Collector for Either<S, V>
    where
        S: Collector,
        V: Collector,
    {
        fn desc(&self) -> Vec<&Desc> {
            match self {
                Self::Single(m) => m.desc(),
                Self::Vec(v) => v.desc(),
            }
        }

        fn collect(&self) -> Vec<Box<dyn Metric>> {
            match self {
                Self::Single(m) => m.collect(),
                Self::Vec(v) => v.collect(),
            }
        }
    }

    /// Metrics sharing the same name, resolvable into a single one by a
    /// [`metrics::Key`].
    #[sealed]
    pub trait Bundle {
        /// Single metric of this [`Bundle`].
        type Single;

        /// Returns the single metric matching the labels of the provided
        /// [`metrics::Key`].
        ///
        /// # Errors
        ///
        /// With [`Error::UnmatchedLabels`] if the label names of the
        /// [`metrics::Key`] don't match the ones of this [`Bundle`].
        fn get_single_metric(&self, key: &metrics::Key) -> Result<Self::Single>;
    }

    #[sealed]
    impl<M: Child> Bundle for Either<M, MetricVec<M>> {
        type Single = M;

        fn get_single_metric(&self, key: &metrics::Key) -> Result<M> {
            match self {
                Self::Single(m) => {
                    if key.labels().next().is_some() {
                        return Err(Error::unmatched(
                            iter::empty::<&str>(),
                            label_names(key),
                        ));
                    }
                    Ok(m.clone())
                }
                Self::Vec(v) => {
                    let labels = key
                        .labels()
                        .map(|l| (l.key(), l.value()))
                        .collect::<HashMap<_, _>>();
                    v.get_or_create_by_name(&labels)
                }
            }
        }
    }
}
