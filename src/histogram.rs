//! Metric sampling observations into buckets.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{
    atomic::AtomicF64,
    core::{Collector, Metric},
    proto::{self, LabelPair},
    Desc, HistogramOpts,
};

/// Label name reserved by histograms for bucket upper bounds.
pub const BUCKET_LABEL: &str = "le";

/// State of a single histogram time series.
#[derive(Debug)]
pub(crate) struct Core {
    /// [`Desc`] of the whole histogram (or of the vector it belongs to).
    pub(crate) desc: Arc<Desc>,

    /// Const and variable labels of this series, sorted by name.
    labels: Vec<LabelPair>,

    /// Upper bounds of the buckets, strictly ascending, without `+Inf`.
    upper_bounds: Arc<[f64]>,

    /// Non-cumulative observation counts per bucket, the last one being the
    /// implicit `+Inf` bucket.
    counts: Box<[AtomicU64]>,

    /// Sum of all the observations.
    sum: AtomicF64,
}

impl Core {
    pub(crate) fn new(
        desc: Arc<Desc>,
        labels: Vec<LabelPair>,
        upper_bounds: Arc<[f64]>,
    ) -> Self {
        let counts =
            (0..=upper_bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self { desc, labels, upper_bounds, counts, sum: AtomicF64::default() }
    }

    fn observe(&self, v: f64) {
        // NaN lands in the `+Inf` bucket.
        let idx = if v.is_nan() {
            self.counts.len() - 1
        } else {
            self.upper_bounds.partition_point(|b| *b < v)
        };
        _ = self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.sum.add(v);
    }

    fn render(&self) -> proto::Sample {
        let mut cumulative = 0;
        let buckets = self
            .upper_bounds
            .iter()
            .zip(self.counts.iter())
            .map(|(b, c)| {
                cumulative += c.load(Ordering::Relaxed);
                proto::Bucket { upper_bound: *b, cumulative_count: cumulative }
            })
            .collect();
        let inf = self.counts.last().map_or(0, |c| c.load(Ordering::Relaxed));
        proto::Sample {
            labels: self.labels.clone(),
            value: proto::Value::Histogram {
                count: cumulative + inf,
                sum: self.sum.get(),
                buckets,
            },
            timestamp_ms: None,
        }
    }
}

/// Validates the `buckets` of a histogram with the provided `desc`, dropping
/// a trailing `+Inf` bucket.
///
/// Problems are captured into the returned [`Desc`].
pub(crate) fn check(desc: Desc, buckets: &[f64]) -> (Desc, Arc<[f64]>) {
    let mut bounds = buckets.to_vec();
    if bounds.last() == Some(&f64::INFINITY) {
        _ = bounds.pop();
    }

    let mut desc = desc;
    if bounds.iter().any(|b| b.is_nan()) {
        desc = desc.invalidate("histogram buckets must not contain NaN");
    } else if bounds.windows(2).any(|w| w[0] >= w[1]) {
        desc = desc.invalidate("histogram buckets must be strictly ascending");
    }
    let reserved = desc
        .const_label_pairs()
        .iter()
        .map(|p| p.name.as_str())
        .chain(desc.variable_labels().iter().map(String::as_str))
        .any(|n| n == BUCKET_LABEL);
    if reserved {
        desc = desc.invalidate(format!(
            "`{BUCKET_LABEL}` is not allowed as a histogram label name",
        ));
    }
    (desc, bounds.into())
}

/// Metric counting observations into configurable buckets, along with their
/// total count and sum.
///
/// # Example
///
/// ```rust
/// use metrics_gatherer::{proto, Histogram, HistogramOpts, Metric as _};
///
/// let latency = Histogram::new(
///     HistogramOpts::new("latency_seconds", "Latency.")
///         .buckets(vec![0.1, 1.0]),
/// );
/// latency.observe(0.05);
/// latency.observe(0.5);
/// latency.observe(5.0);
///
/// let proto::Value::Histogram { count, buckets, .. } = latency.render().value
/// else {
///     unreachable!()
/// };
/// assert_eq!(count, 3);
/// assert_eq!(buckets[0].cumulative_count, 1);
/// assert_eq!(buckets[1].cumulative_count, 2);
/// ```
#[derive(Clone, Debug)]
pub struct Histogram(pub(crate) Arc<Core>);

impl Histogram {
    /// Creates a new [`Histogram`] out of the provided [`HistogramOpts`].
    ///
    /// [`Opts::variable_labels`] are ignored. Errors in the
    /// [`HistogramOpts`] are reported on registration.
    ///
    /// [`Opts::variable_labels`]: crate::Opts::variable_labels
    #[must_use]
    pub fn new(opts: HistogramOpts) -> Self {
        let (desc, bounds) = check(opts.common.single_desc(), &opts.buckets);
        let labels = desc.const_label_pairs().to_vec();
        Self(Arc::new(Core::new(Arc::new(desc), labels, bounds)))
    }

    /// Adds a single observation.
    pub fn observe(&self, v: f64) {
        self.0.observe(v);
    }

    /// Returns the total number of observations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.0.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Returns the sum of all the observations.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.0.sum.get()
    }
}

impl Metric for Histogram {
    fn desc(&self) -> &Desc {
        &self.0.desc
    }

    fn render(&self) -> proto::Sample {
        self.0.render()
    }
}

impl Collector for Histogram {
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
    use crate::Error;

    #[test]
    fn counts_into_inclusive_buckets() {
        let h = Histogram::new(
            HistogramOpts::new("h", "help").buckets(vec![1.0, 2.0, f64::INFINITY]),
        );
        for v in [0.5, 1.0, 1.5, 2.0, 3.0] {
            h.observe(v);
        }

        assert_eq!(h.count(), 5);
        assert_eq!(h.sum(), 8.0);
        assert_eq!(
            Metric::render(&h).value,
            proto::Value::Histogram {
                count: 5,
                sum: 8.0,
                buckets: vec![
                    proto::Bucket { upper_bound: 1.0, cumulative_count: 2 },
                    proto::Bucket { upper_bound: 2.0, cumulative_count: 4 },
                ],
            },
        );
    }

    #[test]
    fn counts_nan_into_inf_bucket() {
        let h = Histogram::new(
            HistogramOpts::new("h", "help").buckets(vec![1.0, 2.0]),
        );
        h.observe(f64::NAN);
        h.observe(0.5);

        let proto::Value::Histogram { count, buckets, .. } =
            Metric::render(&h).value
        else {
            panic!("not a histogram");
        };
        assert_eq!(count, 2);
        assert_eq!(buckets[0].cumulative_count, 1);
        assert_eq!(buckets[1].cumulative_count, 1);
    }

    #[test]
    fn captures_invalid_buckets() {
        let h = Histogram::new(
            HistogramOpts::new("h", "help").buckets(vec![2.0, 1.0]),
        );
        assert!(matches!(
            Metric::desc(&h).validity(),
            Err(Error::InvalidDescriptor { .. }),
        ));
    }

    #[test]
    fn reserves_le_label() {
        let h = Histogram::new(
            HistogramOpts::new("h", "help").const_label("le", "1"),
        );
        assert!(Metric::desc(&h).validity().is_err());
    }
}
