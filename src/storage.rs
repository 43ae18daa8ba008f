//! [`metrics::registry::Storage`] backed by a [`Registry`].
//!
//! [`metrics::registry::Storage`]: metrics_util::registry::Storage

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use sealed::sealed;

use crate::{
    core::Collector,
    metric::{self, Bundled},
    Counter, Gauge, Histogram, Registry, Result,
};

/// Name identifying a [`metric::Bundle`] stored in a [`Storage`].
pub type KeyName = String;

/// Thread-safe [`HashMap`] a [`Collection`] is built upon.
pub type Map<K, V> = Arc<RwLock<HashMap<K, V>>>;

/// [`Collection`] of [`Describable`] [`metric::Bundle`]s, stored in a
/// [`Storage`].
///
/// [`Describable`]: metric::Describable
pub type Collection<M> = Map<KeyName, metric::Describable<Option<M>>>;

/// Retrieving a `Collection` of [`metric::Bundle`]s from a [`Storage`].
#[sealed]
pub trait Get<Collection> {
    /// Returns a `Collection` of [`metric::Bundle`]s stored in this
    /// [`Storage`].
    #[must_use]
    fn collection(&self) -> &Collection;
}

/// [`metrics::registry::Storage`] backed by a [`Registry`] and allowing to
/// change a `help` description of the registered metrics in runtime.
///
/// This [`metrics::registry::Storage`] registers metrics in its [`Registry`]
/// on the fly, on their first use. By default, the [`default_registry()`] is
/// used.
///
/// # Errors
///
/// This [`Storage`] returns [`metric::Fallible`] in its
/// [`metrics::registry::Storage`] interface, because it cannot panic, as is
/// called inside [`metrics::Registry`] and, so, may poison its inner locks.
/// That's why possible errors are passed through, up to the
/// [`metrics::Recorder`] using this [`Storage`], and should be resolved there.
///
/// [`default_registry()`]: crate::default_registry
/// [`metrics::Registry`]: metrics_util::registry::Registry
/// [`metrics::registry::Storage`]: metrics_util::registry::Storage
#[derive(Clone, Debug)]
pub struct Storage {
    /// [`Registry`] backing this [`Storage`].
    pub(crate) registry: Registry,

    /// [`Collection`] of [`Counter`]s registered in this [`Storage`].
    counters: Collection<metric::CounterBundle>,

    /// [`Collection`] of [`Gauge`]s registered in this [`Storage`].
    gauges: Collection<metric::GaugeBundle>,

    /// [`Collection`] of [`Histogram`]s registered in this [`Storage`].
    histograms: Collection<metric::HistogramBundle>,
}

#[sealed]
impl Get<Collection<metric::CounterBundle>> for Storage {
    fn collection(&self) -> &Collection<metric::CounterBundle> {
        &self.counters
    }
}

#[sealed]
impl Get<Collection<metric::GaugeBundle>> for Storage {
    fn collection(&self) -> &Collection<metric::GaugeBundle> {
        &self.gauges
    }
}

#[sealed]
impl Get<Collection<metric::HistogramBundle>> for Storage {
    fn collection(&self) -> &Collection<metric::HistogramBundle> {
        &self.histograms
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new(crate::default_registry().clone())
    }
}

impl Storage {
    /// Creates a new empty [`Storage`] registering metrics in the provided
    /// [`Registry`].
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            counters: Collection::default(),
            gauges: Collection::default(),
            histograms: Collection::default(),
        }
    }

    /// Changes the `help` description of the `M`etric identified by its
    /// `name`.
    ///
    /// The `M`etric may be registered later, and will pick up the stored
    /// description then. Empty description restores the original `help`.
    ///
    /// Intended to be used in [`metrics::Recorder::describe_counter()`],
    /// [`metrics::Recorder::describe_gauge()`] and
    /// [`metrics::Recorder::describe_histogram()`] implementations.
    pub fn describe<M>(&self, name: &str, description: String)
    where
        M: Bundled,
        <M as Bundled>::Bundle: Clone,
        Self: Get<Collection<<M as Bundled>::Bundle>>,
    {
        let stored = self
            .collection()
            .read()
            .get(name)
            .map(|m| Arc::clone(&m.description));

        if let Some(d) = stored {
            d.store(Arc::new(description));
        } else {
            let mut storage = self.collection().write();

            if let Some(metric) = storage.get(name) {
                metric.description.store(Arc::new(description));
            } else {
                drop(storage.insert(
                    name.into(),
                    metric::Describable::only_description(description),
                ));
            }
        }
    }

    /// Initializes a new [`metric::Bundle`] (or reuses the existing one) in
    /// the underlying [`Registry`], and returns its metric satisfying the
    /// labeling of the provided [`metrics::Key`].
    ///
    /// # Errors
    ///
    /// - If the underlying [`Registry`] fails to register the newly
    ///   initialized [`metric::Bundle`].
    /// - If the labels of the [`metrics::Key`] don't match the ones of the
    ///   existing [`metric::Bundle`].
    fn register<B>(&self, key: &metrics::Key) -> Result<B::Single>
    where
        B: metric::Bundle + Collector + Clone + 'static,
        for<'k> B: From<&'k metrics::Key>,
        Self: Get<Collection<B>>,
    {
        let name = key.name();

        let existing = self
            .collection()
            .read()
            .get(name)
            .and_then(|m| m.metric.clone());

        let bundle = if let Some(bundle) = existing {
            bundle
        } else {
            let mut storage = self.collection().write();

            let stored = storage.get(name).and_then(|m| m.metric.clone());
            if let Some(bundle) = stored {
                bundle
            } else {
                let bundle = B::from(key);

                // This way an existing `description` is reused, if it has
                // been set before the metric registration.
                let entry = storage.entry(name.into()).or_default();
                // Registering in the `Registry` goes before storing in the
                // `Collection`, so a failed registration is retried on the
                // next use.
                self.registry.register(Box::new(
                    entry.clone().map(|_| bundle.clone()),
                ))?;
                entry.metric = Some(bundle.clone());

                bundle
            }
        };
        bundle.get_single_metric(key)
    }

    /// Registers the provided `metric` in the underlying [`Registry`] in the
    /// way making it usable via this [`metrics::registry::Storage`] (and, so,
    /// [`metrics`] crate interfaces).
    ///
    /// Accepts [`Counter`]s, [`Gauge`]s, [`Histogram`]s and their vectors.
    ///
    /// # Errors
    ///
    /// If the underlying [`Registry`] fails to register the provided `metric`.
    ///
    /// [`metrics::registry::Storage`]: metrics_util::registry::Storage
    pub fn register_external<M>(&self, metric: M) -> Result<()>
    where
        M: Bundled + Collector,
        <M as Bundled>::Bundle: Collector + Clone + 'static,
        Self: Get<Collection<<M as Bundled>::Bundle>>,
    {
        let name = metric
            .desc()
            .first()
            .map(|d| d.fq_name().to_owned())
            .unwrap_or_default();
        let bundle = metric.into_bundle();

        let mut storage = self.collection().write();
        let description = storage
            .get(&name)
            .map(|m| Arc::clone(&m.description))
            .unwrap_or_default();
        let entry = metric::Describable { description, metric: bundle };
        self.registry.register(Box::new(entry.clone()))?;
        drop(storage.insert(name, entry.map(Some)));

        Ok(())
    }
}

impl metrics_util::registry::Storage<metrics::Key> for Storage {
    // PANIC: Panicking inside `metrics_util::registry::Storage` poisons the
    //        locks used inside `metrics_util::registry::Registry`, so the
    //        errors are passed through and resolved by a `metrics::Recorder`.
    type Counter = metric::Fallible<Counter>;
    type Gauge = metric::Fallible<Gauge>;
    type Histogram = metric::Fallible<Histogram>;

    fn counter(&self, key: &metrics::Key) -> Self::Counter {
        self.register::<metric::CounterBundle>(key).into()
    }

    fn gauge(&self, key: &metrics::Key) -> Self::Gauge {
        self.register::<metric::GaugeBundle>(key).into()
    }

    fn histogram(&self, key: &metrics::Key) -> Self::Histogram {
        self.register::<metric::HistogramBundle>(key).into()
    }
}

#[cfg(test)]
mod tests {
    use metrics_util::registry::Storage as _;

    use super::*;
    use crate::{proto, CounterVec, Error, Opts};

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
    fn registers_lazily_once() {
        let storage = Storage::new(Registry::new());
        assert!(storage.registry.gather().families.is_empty());

        let a = storage.counter(&key("count", &[("kind", "a")]));
        let b = storage.counter(&key("count", &[("kind", "b")]));
        a.as_ref().unwrap().inc();
        b.as_ref().unwrap().inc();
        b.as_ref().unwrap().inc();

        let g = storage.registry.gather();
        assert!(g.errors.is_empty());
        assert_eq!(g.families.len(), 1);
        let values = g.families[0]
            .samples
            .iter()
            .map(|s| s.value.clone())
            .collect::<Vec<_>>();
        assert_eq!(
            values,
            [proto::Value::Counter(1.0), proto::Value::Counter(2.0)],
        );
    }

    #[test]
    fn passes_errors_through() {
        let storage = Storage::new(Registry::new());
        let registered = Gauge::new(Opts::new("taken", "help"));
        storage.registry.register(Box::new(registered)).unwrap();

        assert!(matches!(
            storage.gauge(&key("taken", &[])).as_ref(),
            Err(Error::DuplicateDescriptor(_)),
        ));
        assert!(storage.counter(&key("invalid name", &[])).as_ref().is_err());

        assert!(storage.gauge(&key("labeled", &[("a", "1")])).as_ref().is_ok());
        assert!(matches!(
            storage.gauge(&key("labeled", &[("b", "1")])).as_ref(),
            Err(Error::UnmatchedLabels { .. }),
        ));
    }

    #[test]
    fn describes_before_and_after_registration() {
        let storage = Storage::new(Registry::new());
        storage.describe::<Counter>("early", "Early.".into());
        _ = storage.counter(&key("early", &[]));
        _ = storage.counter(&key("late", &[]));
        storage.describe::<Counter>("late", "Late.".into());

        let g = storage.registry.gather();
        let helps = g.families.iter().map(|f| f.help.as_str()).collect::<Vec<_>>();
        assert_eq!(helps, ["Early.", "Late."]);
    }

    #[test]
    fn exposes_external_metrics() {
        let storage = Storage::new(Registry::new());
        let vec =
            CounterVec::new(Opts::new("external", "help").variable_labels(["a"]));
        storage.register_external(vec.clone()).unwrap();

        storage
            .counter(&key("external", &[("a", "1")]))
            .as_ref()
            .unwrap()
            .inc();

        assert_eq!(vec.get_or_create(&["1"]).unwrap().get(), 1.0);
        assert!(storage.register_external(vec).is_err());
    }
}
