//! Options for declaring metrics.

use crate::{desc::Labels, Desc};

/// Default [`HistogramOpts::buckets`], tailored to measure network request
/// latencies in seconds.
pub const DEFAULT_BUCKETS: &[f64; 11] =
    &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Options for declaring counters, gauges and untyped metrics.
///
/// The fully-qualified name of the metric is built by joining the non-empty
/// [`Opts::namespace`], [`Opts::subsystem`] and [`Opts::name`] with `_`.
///
/// # Example
///
/// ```rust
/// use metrics_gatherer::Opts;
///
/// let opts = Opts::new("deletes", "Delete operations.")
///     .namespace("our_company")
///     .subsystem("blob_storage")
///     .const_label("binary_version", "debug")
///     .variable_labels(["corpus", "qos"]);
///
/// assert_eq!(opts.fq_name(), "our_company_blob_storage_deletes");
/// ```
#[derive(Clone, Debug, Default)]
pub struct Opts {
    /// Namespace prefix of the metric name.
    pub namespace: String,

    /// Subsystem part of the metric name.
    pub subsystem: String,

    /// Name of the metric.
    pub name: String,

    /// Help text of the metric. Must not be empty.
    pub help: String,

    /// Labels with values fixed for the metric's lifetime.
    pub const_labels: Labels,

    /// Labels partitioning a vector of the metric, in order.
    ///
    /// Ignored when constructing a single (non-vector) metric.
    pub variable_labels: Vec<String>,
}

impl Opts {
    /// Creates new [`Opts`] with the provided `name` and `help`.
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self { name: name.into(), help: help.into(), ..Self::default() }
    }

    /// Sets the [`Opts::namespace`].
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the [`Opts::subsystem`].
    #[must_use]
    pub fn subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = subsystem.into();
        self
    }

    /// Adds a single const label.
    #[must_use]
    pub fn const_label(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        drop(self.const_labels.insert(name.into(), value.into()));
        self
    }

    /// Replaces all the [`Opts::const_labels`].
    #[must_use]
    pub fn const_labels(mut self, labels: Labels) -> Self {
        self.const_labels = labels;
        self
    }

    /// Replaces the [`Opts::variable_labels`].
    #[must_use]
    pub fn variable_labels<N: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = N>,
    ) -> Self {
        self.variable_labels = names.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the fully-qualified name of the metric.
    #[must_use]
    pub fn fq_name(&self) -> String {
        [&self.namespace, &self.subsystem, &self.name]
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Builds a [`Desc`] of a single metric, ignoring the
    /// [`Opts::variable_labels`].
    pub(crate) fn single_desc(&self) -> Desc {
        Desc::new(
            self.fq_name(),
            self.help.as_str(),
            self.const_labels.clone(),
            Vec::<String>::new(),
        )
    }

    /// Builds a [`Desc`] of a metric vector.
    pub(crate) fn vec_desc(&self) -> Desc {
        Desc::new(
            self.fq_name(),
            self.help.as_str(),
            self.const_labels.clone(),
            self.variable_labels.clone(),
        )
    }
}

impl From<Opts> for HistogramOpts {
    fn from(common: Opts) -> Self {
        Self { common, buckets: DEFAULT_BUCKETS.to_vec() }
    }
}

/// Options for declaring histograms.
#[derive(Clone, Debug)]
pub struct HistogramOpts {
    /// Name, help and labels of the histogram.
    pub common: Opts,

    /// Upper bounds of the histogram buckets, strictly ascending. The `+Inf`
    /// bucket is implicit.
    pub buckets: Vec<f64>,
}

impl HistogramOpts {
    /// Creates new [`HistogramOpts`] with the provided `name` and `help`, and
    /// the [`DEFAULT_BUCKETS`].
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Opts::new(name, help).into()
    }

    /// Replaces the [`HistogramOpts::buckets`].
    #[must_use]
    pub fn buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    /// Replaces the [`Opts::variable_labels`].
    #[must_use]
    pub fn variable_labels<N: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = N>,
    ) -> Self {
        self.common = self.common.variable_labels(names);
        self
    }

    /// Adds a single const label.
    #[must_use]
    pub fn const_label(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.common = self.common.const_label(name, value);
        self
    }
}

/// Creates `count` buckets, each `width` wide, the lowest one having `start`
/// as its upper bound.
///
/// Returns an empty [`Vec`] if `count` is zero or `width` isn't positive.
#[must_use]
pub fn linear_buckets(start: f64, width: f64, count: usize) -> Vec<f64> {
    if width <= 0.0 {
        return Vec::new();
    }
    let mut next = start;
    (0..count)
        .map(|_| {
            let b = next;
            next += width;
            b
        })
        .collect()
}

/// Creates `count` buckets, each upper bound being `factor` times the previous
/// one, the lowest one having `start` as its upper bound.
///
/// Returns an empty [`Vec`] if `count` is zero, `start` isn't positive or
/// `factor` isn't greater than one.
#[must_use]
pub fn exponential_buckets(start: f64, factor: f64, count: usize) -> Vec<f64> {
    if start <= 0.0 || factor <= 1.0 {
        return Vec::new();
    }
    let mut next = start;
    (0..count)
        .map(|_| {
            let b = next;
            next *= factor;
            b
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_fq_name_skipping_empty_parts() {
        assert_eq!(Opts::new("name", "h").fq_name(), "name");
        assert_eq!(Opts::new("name", "h").namespace("ns").fq_name(), "ns_name");
        assert_eq!(
            Opts::new("name", "h").subsystem("sub").fq_name(),
            "sub_name",
        );
        assert_eq!(
            Opts::new("name", "h").namespace("ns").subsystem("sub").fq_name(),
            "ns_sub_name",
        );
    }

    #[test]
    fn single_desc_ignores_variable_labels() {
        let opts = Opts::new("x", "h").variable_labels(["a"]);

        assert!(opts.single_desc().variable_labels().is_empty());
        assert_eq!(opts.vec_desc().variable_labels(), ["a".to_owned()]);
    }

    #[test]
    fn generates_buckets() {
        assert_eq!(linear_buckets(1.0, 2.0, 3), vec![1.0, 3.0, 5.0]);
        assert_eq!(exponential_buckets(1.0, 2.0, 4), vec![1.0, 2.0, 4.0, 8.0]);
        assert!(linear_buckets(1.0, 0.0, 3).is_empty());
        assert!(exponential_buckets(0.0, 2.0, 3).is_empty());
    }
}
