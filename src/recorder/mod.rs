//! [`metrics::Recorder`] implementation.

use std::{fmt, sync::Arc};

use crate::{
    core::Collector,
    failure::{self, strategy::PanicInDebugNoOpInRelease},
    metric::Bundled,
    storage::{self, Storage},
    Counter, Gauge, Histogram, Registry, Result,
};

/// [`metrics::Recorder`] registering metrics in a [`Registry`] and powered by
/// a [`metrics::Registry`] built on top of a [`Storage`].
///
/// This [`Recorder`] registers metrics in its [`Registry`] on the fly. By
/// default, the [`default_registry()`] is used.
///
/// # Example
///
/// ```rust
/// use metrics_gatherer::{proto, Gauge, Opts};
///
/// let recorder = metrics_gatherer::install();
///
/// // Either use `metrics` crate interfaces.
/// metrics::increment_counter!("count", "whose" => "mine", "kind" => "owned");
/// metrics::increment_counter!("count", "whose" => "mine", "kind" => "ref");
/// metrics::increment_counter!("count", "kind" => "owned", "whose" => "dummy");
///
/// // Or construct and provide metrics directly.
/// recorder.try_register_metric(Gauge::new(Opts::new("value", "help")))?;
///
/// let gathered = recorder.registry().gather();
/// assert!(gathered.errors.is_empty());
/// assert_eq!(gathered.families.len(), 2);
/// assert_eq!(gathered.families[0].name, "count");
/// assert_eq!(gathered.families[0].help, "count");
/// assert_eq!(gathered.families[0].samples.len(), 3);
/// assert_eq!(gathered.families[1].help, "help");
///
/// // Metrics can be described anytime, before or after their registration.
/// metrics::describe_counter!("count", "Example of counter.");
/// metrics::describe_gauge!("value", "Example of gauge.");
///
/// let gathered = metrics_gatherer::gather();
/// assert_eq!(gathered.families[0].help, "Example of counter.");
/// assert_eq!(gathered.families[1].help, "Example of gauge.");
///
/// // Using labels inconsistently is a failure, handled by the configured
/// // `failure::Strategy` (panicking in debug mode by default).
/// let res = std::panic::catch_unwind(|| {
///     metrics::increment_counter!("count", "kind" => "owned");
/// });
/// assert_eq!(res.is_err(), cfg!(debug_assertions));
/// # Ok::<_, metrics_gatherer::Error>(())
/// ```
///
/// [`default_registry()`]: crate::default_registry
/// [`metrics::Registry`]: metrics_util::registry::Registry
#[derive(Clone)]
pub struct Recorder<FailureStrategy = PanicInDebugNoOpInRelease> {
    /// [`metrics::Registry`] providing performant access to the stored
    /// metrics.
    ///
    /// [`metrics::Registry`]: metrics_util::registry::Registry
    metrics: Arc<metrics_util::registry::Registry<metrics::Key, Storage>>,

    /// [`Storage`] backing the [`metrics::Registry`] and registering metrics
    /// in a [`Registry`].
    ///
    /// [`metrics::Registry`]: metrics_util::registry::Registry
    storage: Storage,

    /// [`failure::Strategy`] to apply when a metric fails to be used.
    failure_strategy: FailureStrategy,
}

impl<S: fmt::Debug> fmt::Debug for Recorder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("storage", &self.storage)
            .field("failure_strategy", &self.failure_strategy)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Starts building a new [`Recorder`] on top of the
    /// [`default_registry()`].
    ///
    /// [`default_registry()`]: crate::default_registry
    pub fn builder() -> Builder {
        Builder {
            storage: Storage::default(),
            failure_strategy: PanicInDebugNoOpInRelease,
        }
    }
}

impl<S> Recorder<S> {
    /// Returns the [`Registry`] backing this [`Recorder`].
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.storage.registry
    }

    /// Tries to register the provided metric in the underlying [`Registry`]
    /// in the way making it usable via this [`Recorder`] (and, so,
    /// [`metrics`] crate interfaces).
    ///
    /// Accepts [`Counter`]s, [`Gauge`]s, [`Histogram`]s and their vectors.
    ///
    /// # Errors
    ///
    /// If the underlying [`Registry`] fails to register the provided
    /// `metric`.
    pub fn try_register_metric<M>(&self, metric: M) -> Result<()>
    where
        M: Bundled + Collector,
        <M as Bundled>::Bundle: Collector + Clone + 'static,
        Storage: storage::Get<storage::Collection<<M as Bundled>::Bundle>>,
    {
        self.storage.register_external(metric)
    }

    /// Registers the provided metric in the underlying [`Registry`] in the
    /// way making it usable via this [`Recorder`] (and, so, [`metrics`] crate
    /// interfaces).
    ///
    /// Accepts [`Counter`]s, [`Gauge`]s, [`Histogram`]s and their vectors.
    ///
    /// # Panics
    ///
    /// If the underlying [`Registry`] fails to register the provided
    /// `metric`.
    pub fn register_metric<M>(&self, metric: M)
    where
        M: Bundled + Collector,
        <M as Bundled>::Bundle: Collector + Clone + 'static,
        Storage: storage::Get<storage::Collection<<M as Bundled>::Bundle>>,
    {
        self.try_register_metric(metric)
            .unwrap_or_else(|e| panic!("failed to register metric: {e}"));
    }
}

impl<S> metrics::Recorder for Recorder<S>
where
    S: failure::Strategy,
{
    fn describe_counter(
        &self,
        name: metrics::KeyName,
        _: Option<metrics::Unit>,
        description: metrics::SharedString,
    ) {
        self.storage
            .describe::<Counter>(name.as_str(), description.into_owned());
    }

    fn describe_gauge(
        &self,
        name: metrics::KeyName,
        _: Option<metrics::Unit>,
        description: metrics::SharedString,
    ) {
        self.storage.describe::<Gauge>(name.as_str(), description.into_owned());
    }

    fn describe_histogram(
        &self,
        name: metrics::KeyName,
        _: Option<metrics::Unit>,
        description: metrics::SharedString,
    ) {
        self.storage
            .describe::<Histogram>(name.as_str(), description.into_owned());
    }

    fn register_counter(&self, key: &metrics::Key) -> metrics::Counter {
        self.metrics
            .get_or_create_counter(key, |counter| {
                counter.as_ref().map(|c| Arc::new(c.clone()).into()).or_else(
                    |e| match self.failure_strategy.decide(e) {
                        failure::Action::NoOp => Ok(metrics::Counter::noop()),
                        // PANIC: Panicking inside this closure poisons the
                        //        `RwLock`s of the `metrics_util` registry.
                        failure::Action::Panic => Err(e.to_string()),
                    },
                )
            })
            .unwrap_or_else(|e| panic!("failed to register counter: {e}"))
    }

    fn register_gauge(&self, key: &metrics::Key) -> metrics::Gauge {
        self.metrics
            .get_or_create_gauge(key, |gauge| {
                gauge.as_ref().map(|g| Arc::new(g.clone()).into()).or_else(
                    |e| match self.failure_strategy.decide(e) {
                        failure::Action::NoOp => Ok(metrics::Gauge::noop()),
                        // PANIC: Panicking inside this closure poisons the
                        //        `RwLock`s of the `metrics_util` registry.
                        failure::Action::Panic => Err(e.to_string()),
                    },
                )
            })
            .unwrap_or_else(|e| panic!("failed to register gauge: {e}"))
    }

    fn register_histogram(&self, key: &metrics::Key) -> metrics::Histogram {
        self.metrics
            .get_or_create_histogram(key, |histogram| {
                histogram.as_ref().map(|h| Arc::new(h.clone()).into()).or_else(
                    |e| match self.failure_strategy.decide(e) {
                        failure::Action::NoOp => Ok(metrics::Histogram::noop()),
                        // PANIC: Panicking inside this closure poisons the
                        //        `RwLock`s of the `metrics_util` registry.
                        failure::Action::Panic => Err(e.to_string()),
                    },
                )
            })
            .unwrap_or_else(|e| panic!("failed to register histogram: {e}"))
    }
}

/// Builder for building a [`Recorder`].
#[derive(Debug)]
#[must_use]
pub struct Builder<FailureStrategy = PanicInDebugNoOpInRelease> {
    /// [`Storage`] to build the [`Recorder`] with.
    storage: Storage,

    /// [`failure::Strategy`] of the built [`Recorder`].
    failure_strategy: FailureStrategy,
}

impl<S> Builder<S> {
    /// Sets the provided [`Registry`] to be used by the built [`Recorder`],
    /// instead of the [`default_registry()`].
    ///
    /// [`default_registry()`]: crate::default_registry
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.storage = Storage::new(registry);
        self
    }

    /// Sets the provided [`failure::Strategy`] to be used by the built
    /// [`Recorder`].
    pub fn with_failure_strategy<F>(self, strategy: F) -> Builder<F>
    where
        F: failure::Strategy,
    {
        Builder { storage: self.storage, failure_strategy: strategy }
    }

    /// Tries to register the provided metric in the underlying [`Registry`]
    /// in the way making it usable via the built [`Recorder`].
    ///
    /// # Errors
    ///
    /// If the underlying [`Registry`] fails to register the provided
    /// `metric`.
    pub fn try_with_metric<M>(self, metric: M) -> Result<Self>
    where
        M: Bundled + Collector,
        <M as Bundled>::Bundle: Collector + Clone + 'static,
        Storage: storage::Get<storage::Collection<<M as Bundled>::Bundle>>,
    {
        self.storage.register_external(metric)?;
        Ok(self)
    }

    /// Registers the provided metric in the underlying [`Registry`] in the
    /// way making it usable via the built [`Recorder`].
    ///
    /// # Panics
    ///
    /// If the underlying [`Registry`] fails to register the provided
    /// `metric`.
    pub fn with_metric<M>(self, metric: M) -> Self
    where
        M: Bundled + Collector,
        <M as Bundled>::Bundle: Collector + Clone + 'static,
        Storage: storage::Get<storage::Collection<<M as Bundled>::Bundle>>,
    {
        self.try_with_metric(metric)
            .unwrap_or_else(|e| panic!("failed to register metric: {e}"))
    }

    /// Builds the [`Recorder`] without installing it as
    /// [`metrics::recorder()`].
    ///
    /// Use it along with [`metrics_util::layers::Stack`] to install the
    /// [`Recorder`] wrapped with [`metrics_util::layers::Layer`]s.
    pub fn build(self) -> Recorder<S>
    where
        S: failure::Strategy,
    {
        let Self { storage, failure_strategy } = self;
        Recorder {
            metrics: Arc::new(metrics_util::registry::Registry::new(
                storage.clone(),
            )),
            storage,
            failure_strategy,
        }
    }

    /// Builds the [`Recorder`] and tries to install it as
    /// [`metrics::recorder()`].
    ///
    /// # Errors
    ///
    /// If another [`metrics::Recorder`] is installed already.
    pub fn try_build_and_install(
        self,
    ) -> Result<Recorder<S>, metrics::SetRecorderError>
    where
        S: failure::Strategy + Clone + 'static,
    {
        let rec = self.build();
        metrics::set_boxed_recorder(Box::new(rec.clone()))?;
        Ok(rec)
    }

    /// Builds the [`Recorder`] and installs it as [`metrics::recorder()`].
    ///
    /// # Panics
    ///
    /// If another [`metrics::Recorder`] is installed already.
    pub fn build_and_install(self) -> Recorder<S>
    where
        S: failure::Strategy + Clone + 'static,
    {
        self.try_build_and_install().unwrap_or_else(|e| {
            panic!(
                "failed to install `metrics_gatherer::Recorder` as \
                 `metrics::recorder()`: {e}",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use metrics::Recorder as _;
    use metrics_util::layers::{self, FilterLayer};

    use super::*;
    use crate::{failure::strategy::NoOp, proto, Error, GaugeVec, Opts};

    fn recorder() -> Recorder<NoOp> {
        Recorder::builder()
            .with_registry(Registry::new())
            .with_failure_strategy(NoOp)
            .build()
    }

    fn key(name: &'static str, labels: &[(&'static str, &'static str)]) -> metrics::Key {
        metrics::Key::from_parts(
            name,
            labels
                .iter()
                .map(|(k, v)| metrics::Label::new(*k, *v))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn records_into_registry() {
        let rec = recorder();
        rec.register_counter(&key("count", &[("whose", "mine"), ("kind", "ref")]))
            .increment(2);
        rec.register_counter(&key("count", &[("kind", "ref"), ("whose", "mine")]))
            .increment(1);
        rec.register_gauge(&key("value", &[])).set(5.0);
        rec.register_histogram(&key("latency", &[])).record(0.2);

        let g = rec.registry().gather();
        assert!(g.errors.is_empty(), "{:?}", g.errors);
        let families = g
            .families
            .iter()
            .map(|f| (f.name.as_str(), f.kind, f.samples.len()))
            .collect::<Vec<_>>();
        assert_eq!(
            families,
            [
                ("count", proto::MetricKind::Counter, 1),
                ("latency", proto::MetricKind::Histogram, 1),
                ("value", proto::MetricKind::Gauge, 1),
            ],
        );
        assert_eq!(g.families[0].samples[0].value, proto::Value::Counter(3.0));
    }

    #[test]
    fn applies_descriptions() {
        let rec = recorder();
        rec.describe_gauge("value".into(), None, "Before.".into());
        rec.register_gauge(&key("value", &[])).increment(1.0);
        assert_eq!(rec.registry().gather().families[0].help, "Before.");

        rec.describe_gauge("value".into(), None, "After.".into());
        assert_eq!(rec.registry().gather().families[0].help, "After.");
    }

    #[test]
    fn falls_back_to_noop_on_failure() {
        let rec = recorder();
        rec.register_counter(&key("count", &[("a", "1")])).increment(1);
        rec.register_counter(&key("count", &[("b", "1")])).increment(1);
        rec.register_counter(&key("invalid name", &[])).increment(1);

        let g = rec.registry().gather();
        assert_eq!(g.families.len(), 1);
        assert_eq!(g.families[0].samples.len(), 1);
    }

    #[test]
    fn panics_on_failure_with_panic_strategy() {
        let rec = Recorder::builder()
            .with_registry(Registry::new())
            .with_failure_strategy(failure::strategy::Panic)
            .build();

        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            rec.register_counter(&key("invalid name", &[]));
        }));
        assert!(res.is_err());

        // The `metrics::Registry` is still usable after the panic.
        rec.register_counter(&key("valid", &[])).increment(1);
        assert_eq!(rec.registry().gather().families.len(), 1);
    }

    #[test]
    fn uses_external_metrics() {
        let vec =
            GaugeVec::new(Opts::new("external", "help").variable_labels(["a"]));
        let rec = Recorder::builder()
            .with_registry(Registry::new())
            .with_failure_strategy(NoOp)
            .with_metric(vec.clone())
            .build();

        rec.register_gauge(&key("external", &[("a", "1")])).set(7.0);
        assert_eq!(vec.get_or_create(&["1"]).unwrap().get(), 7.0);

        assert!(matches!(
            rec.try_register_metric(vec),
            Err(Error::DuplicateDescriptor(_)),
        ));
    }

    #[test]
    fn layers_recorder() {
        let rec = recorder();
        let layered = layers::Stack::new(rec.clone())
            .push(FilterLayer::from_patterns(["secret"]));

        layered.register_counter(&key("secret_total", &[])).increment(1);
        layered.register_counter(&key("public_total", &[])).increment(1);

        let g = rec.registry().gather();
        let names = g.families.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["public_total"]);
    }
}
