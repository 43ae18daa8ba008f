//! Prometheus-style metric primitives (counters, gauges, histograms and their
//! labeled vectors), a [`Registry`] gathering them into [`MetricFamily`]s, and
//! a [`metrics`] crate [`Recorder`] backed by it.
//!
//! # Example
//!
//! ```rust
//! use metrics_gatherer::{CounterVec, Opts};
//!
//! let requests = CounterVec::new(
//!     Opts::new("requests_total", "Total number of handled requests.")
//!         .namespace("app")
//!         .variable_labels(["method", "code"]),
//! );
//! metrics_gatherer::register(Box::new(requests.clone()))?;
//!
//! requests.get_or_create(&["GET", "200"])?.inc();
//!
//! let gathered = metrics_gatherer::gather();
//! assert!(gathered.errors.is_empty());
//! assert_eq!(gathered.families[0].name, "app_requests_total");
//! # Ok::<_, metrics_gatherer::Error>(())
//! ```
//!
//! [`MetricFamily`]: proto::MetricFamily

mod atomic;
mod core;
mod counter;
mod desc;
mod error;
pub mod failure;
mod gauge;
mod histogram;
pub mod metric;
mod opts;
pub mod proto;
pub mod recorder;
mod registry;
pub mod storage;
mod value;
pub mod vec;

use once_cell::sync::Lazy;

#[doc(inline)]
pub use self::{
    atomic::AtomicF64,
    core::{Collector, Metric},
    counter::Counter,
    desc::{is_valid_label_name, is_valid_metric_name, Desc, Labels},
    error::{Error, Result},
    gauge::Gauge,
    histogram::{Histogram, BUCKET_LABEL},
    opts::{
        exponential_buckets, linear_buckets, HistogramOpts, Opts,
        DEFAULT_BUCKETS,
    },
    recorder::Recorder,
    registry::{
        Builder as RegistryBuilder, Gathered, Registry, DEFAULT_MAX_WORKERS,
    },
    value::{ConstMetric, Untyped},
    vec::{CounterVec, GaugeVec, HistogramVec, MetricVec, UntypedVec},
};

/// Process-wide [`Registry`] used when no other is specified.
static DEFAULT_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Returns the process-wide default [`Registry`].
#[must_use]
pub fn default_registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}

/// Registers the provided [`Collector`] in the [`default_registry()`].
///
/// # Errors
///
/// See [`Registry::register()`] for details.
pub fn register(c: Box<dyn Collector>) -> Result<()> {
    DEFAULT_REGISTRY.register(c)
}

/// Registers the provided [`Collector`] in the [`default_registry()`].
///
/// # Panics
///
/// If the [`Collector`] fails to be registered.
pub fn must_register(c: Box<dyn Collector>) {
    DEFAULT_REGISTRY.must_register(c);
}

/// Unregisters the provided [`Collector`] from the [`default_registry()`],
/// returning whether it was registered.
pub fn unregister(c: &dyn Collector) -> bool {
    DEFAULT_REGISTRY.unregister(c)
}

/// Gathers all the metrics of the [`default_registry()`].
#[must_use]
pub fn gather() -> Gathered {
    DEFAULT_REGISTRY.gather()
}

/// Tries to install a [`Recorder`] on top of the [`default_registry()`] as
/// [`metrics::recorder()`].
///
/// # Errors
///
/// If another [`metrics::Recorder`] is installed already.
pub fn try_install() -> Result<Recorder, metrics::SetRecorderError> {
    Recorder::builder().try_build_and_install()
}

/// Installs a [`Recorder`] on top of the [`default_registry()`] as
/// [`metrics::recorder()`].
///
/// # Panics
///
/// If another [`metrics::Recorder`] is installed already.
pub fn install() -> Recorder {
    Recorder::builder().build_and_install()
}

#[cfg(test)]
mod tests {
    use super::{must_register, Counter, Opts};

    #[test]
    #[should_panic(expected = "failed to register metrics collector")]
    fn must_register_panics_on_invalid_collector() {
        must_register(Box::new(Counter::new(Opts::new("0invalid", "help"))));
    }
}
