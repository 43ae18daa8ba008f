//! Seams between metrics, their collectors and a [`Registry`].
//!
//! [`Registry`]: crate::Registry

use std::sync::Arc;

use crate::{proto, Desc};

/// Single time series, able to render its current state.
pub trait Metric: Send + Sync {
    /// Returns the [`Desc`] of this [`Metric`].
    fn desc(&self) -> &Desc;

    /// Renders the current state of this [`Metric`].
    ///
    /// Must be cheap: the [`Registry`] calls it once per gathering.
    ///
    /// [`Registry`]: crate::Registry
    fn render(&self) -> proto::Sample;
}

/// Source of [`Metric`]s registrable in a [`Registry`].
///
/// [`Collector::desc()`] must return the same [`Desc`]s every time, and
/// [`Collector::collect()`] must be safe to be called concurrently.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use metrics_gatherer::{
///     proto, Collector, ConstMetric, Desc, Metric, Registry,
/// };
///
/// struct Uptime {
///     desc: Arc<Desc>,
/// }
///
/// impl Collector for Uptime {
///     fn desc(&self) -> Vec<&Desc> {
///         vec![&self.desc]
///     }
///
///     fn collect(&self) -> Vec<Box<dyn Metric>> {
///         ConstMetric::new(
///             Arc::clone(&self.desc),
///             proto::Value::Gauge(42.0),
///             &[],
///         )
///         .map(|m| vec![Box::new(m) as Box<dyn Metric>])
///         .unwrap_or_default()
///     }
/// }
///
/// let registry = Registry::new();
/// registry.register(Box::new(Uptime {
///     desc: Arc::new(Desc::new(
///         "uptime_seconds",
///         "Uptime.",
///         [("host", "a")],
///         Vec::<String>::new(),
///     )),
/// }))?;
///
/// let gathered = registry.gather();
/// assert_eq!(gathered.families[0].name, "uptime_seconds");
/// # Ok::<_, metrics_gatherer::Error>(())
/// ```
///
/// [`Registry`]: crate::Registry
pub trait Collector: Send + Sync {
    /// Returns all the [`Desc`]s of [`Metric`]s this [`Collector`] may ever
    /// collect.
    fn desc(&self) -> Vec<&Desc>;

    /// Collects the current [`Metric`]s.
    fn collect(&self) -> Vec<Box<dyn Metric>>;
}

impl<C: Collector + ?Sized> Collector for Arc<C> {
    fn desc(&self) -> Vec<&Desc> {
        (**self).desc()
    }

    fn collect(&self) -> Vec<Box<dyn Metric>> {
        (**self).collect()
    }
}

impl<C: Collector + ?Sized> Collector for Box<C> {
    fn desc(&self) -> Vec<&Desc> {
        (**self).desc()
    }

    fn collect(&self) -> Vec<Box<dyn Metric>> {
        (**self).collect()
    }
}
