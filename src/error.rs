//! Errors of metrics declaration, registration and gathering.

/// Alias of a [`Result`](std::result::Result) with this crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible failures of declaring, registering, using or gathering metrics.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// Malformed metric name, label names or help of a [`Desc`].
    ///
    /// Captured at [`Desc`] construction and surfaced on its first use.
    ///
    /// [`Desc`]: crate::Desc
    #[error("descriptor `{name}` is invalid: {reason}")]
    InvalidDescriptor {
        /// Fully-qualified name of the invalid [`Desc`](crate::Desc).
        name: String,

        /// Description of what is wrong.
        reason: String,
    },

    /// [`Desc`] with the same identity is registered already.
    ///
    /// [`Desc`]: crate::Desc
    #[error(
        "descriptor `{0}` already exists with the same fully-qualified name \
         and const label values"
    )]
    DuplicateDescriptor(String),

    /// Metric name is used with a differing set of label names.
    #[error(
        "metric `{0}` is already known with a different set of label names"
    )]
    InconsistentDimensions(String),

    /// Metric name is used with a differing help.
    #[error("metric `{0}` is already known with a different help")]
    InconsistentHelp(String),

    /// Provided labels don't match the variable labels of a vector.
    #[error("labels mismatch: expected {expected:?}, got {got:?}")]
    UnmatchedLabels {
        /// Label names the vector expects.
        expected: Vec<String>,

        /// Label names (or the number of values) actually provided.
        got: Vec<String>,
    },

    /// Counter is asked to decrease.
    #[error("counter cannot decrease in value, got delta {0}")]
    NegativeCounterDelta(f64),

    /// Metrics of different types are collected under the same name.
    #[error("metric `{name}` collected as {got}, but its family is {expected}")]
    InconsistentKind {
        /// Name of the metric family.
        name: String,

        /// Type of the metric family, as seen first.
        expected: crate::proto::MetricKind,

        /// Type of the offending metric.
        got: crate::proto::MetricKind,
    },

    /// Metric family contains two samples with identical labels.
    #[error("metric `{name}` collected twice with labels {labels}")]
    DuplicateSample {
        /// Name of the metric family.
        name: String,

        /// Rendered label pairs of the duplicated sample.
        labels: String,
    },

    /// Collector hasn't responded within the gathering deadline.
    #[error("collector describing {0:?} timed out")]
    GatherTimeout(Vec<String>),

    /// Collector panicked (or couldn't be run) while collecting.
    #[error("collector describing {0:?} failed to collect")]
    CollectorFailed(Vec<String>),

    /// Collector describes no [`Desc`]s, so cannot be identified.
    ///
    /// [`Desc`]: crate::Desc
    #[error("collector describes no metrics")]
    EmptyCollector,
}

impl Error {
    pub(crate) fn unmatched<E, G>(expected: E, got: G) -> Self
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        G: IntoIterator,
        G::Item: AsRef<str>,
    {
        Self::UnmatchedLabels {
            expected: expected
                .into_iter()
                .map(|s| s.as_ref().to_owned())
                .collect(),
            got: got.into_iter().map(|s| s.as_ref().to_owned()).collect(),
        }
    }
}
