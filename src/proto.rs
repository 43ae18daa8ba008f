//! Structured snapshot produced by gathering a [`Registry`].
//!
//! Encoding these snapshots into bytes (text or binary exposition formats) is
//! left to an external encoder.
//!
//! [`Registry`]: crate::Registry

use std::fmt;

/// Type of a metric family.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricKind {
    /// Monotonically increasing value.
    Counter,

    /// Value which may go up and down.
    Gauge,

    /// Distribution of observations over configured buckets.
    Histogram,

    /// Value without any declared semantics.
    Untyped,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Untyped => "untyped",
        })
    }
}

/// Name-value pair of a label.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LabelPair {
    /// Name of the label.
    pub name: String,

    /// Value of the label.
    pub value: String,
}

impl LabelPair {
    /// Creates a new [`LabelPair`].
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Cumulative bucket of a [`Value::Histogram`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bucket {
    /// Inclusive upper bound of the bucket.
    pub upper_bound: f64,

    /// Number of observations less than or equal to the
    /// [`Bucket::upper_bound`].
    pub cumulative_count: u64,
}

/// Rendered value of a single time series.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Value of a counter.
    Counter(f64),

    /// Value of a gauge.
    Gauge(f64),

    /// Value of an untyped metric.
    Untyped(f64),

    /// State of a histogram.
    Histogram {
        /// Total number of observations.
        count: u64,

        /// Sum of all the observed values.
        sum: f64,

        /// Cumulative buckets in ascending order of their upper bounds. The
        /// implicit `+Inf` bucket equals to the `count`.
        buckets: Vec<Bucket>,
    },
}

impl Value {
    /// Returns the [`MetricKind`] of this [`Value`].
    #[must_use]
    pub const fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Untyped(_) => MetricKind::Untyped,
            Self::Histogram { .. } => MetricKind::Histogram,
        }
    }
}

/// Rendered single time series.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Const and variable labels of the series, sorted by name.
    pub labels: Vec<LabelPair>,

    /// Current value of the series.
    pub value: Value,

    /// Milliseconds since UNIX epoch the [`Sample::value`] was observed at,
    /// if it's not "now".
    pub timestamp_ms: Option<i64>,
}

impl Sample {
    /// Renders [`Sample::labels`] as `{name="value",...}`.
    #[must_use]
    pub fn labels_string(&self) -> String {
        let pairs = self
            .labels
            .iter()
            .map(|l| format!("{}={:?}", l.name, l.value))
            .collect::<Vec<_>>();
        format!("{{{}}}", pairs.join(","))
    }
}

/// All the [`Sample`]s gathered under a single metric name.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricFamily {
    /// Fully-qualified name of the family.
    pub name: String,

    /// Help text of the family.
    pub help: String,

    /// Type of every [`Sample`] in the family.
    pub kind: MetricKind,

    /// Samples ordered by their label values.
    pub samples: Vec<Sample>,
}
